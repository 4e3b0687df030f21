//! Producer side: readable stream state machines, controllers, and readers.
//!
//! A [`ProducerStream`] carries arbitrary chunks fed by a [`Source`]; a
//! [`ByteProducerStream`] carries bytes and additionally supports zero-copy
//! reads into caller-supplied buffers. Each stream is consumed through at
//! most one reader at a time — acquiring a reader locks the stream.

mod bytes;
mod controller;
mod reader;
mod zero_copy;

pub use self::bytes::{ByteController, ByteProducerStream};
pub use self::controller::ProducerController;
pub use self::reader::DefaultReader;
pub use self::zero_copy::{ByteReader, ByteView, ZeroCopyRead, ZeroCopyReader};

use crate::config::ProducerConfig;
use crate::error::{Result, StreamError};
use crate::hooks::Source;
use crate::Completion;

use self::controller::ProducerShared;

/// Lifecycle state of a producer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// Chunks may still arrive.
    Readable,
    /// End of stream; remaining reads observe `None`.
    Closed,
    /// Terminal failure; the stored error settles every request.
    Errored,
}

/// A backpressure-aware chunk producer stream.
///
/// Created from a [`Source`] whose hooks feed the internal queue; consumed
/// through a [`DefaultReader`] or piped into a consumer stream with
/// [`ProducerStream::pipe_to`](crate::pipe).
pub struct ProducerStream<T> {
    pub(crate) shared: ProducerShared<T>,
}

impl<T: 'static> ProducerStream<T> {
    /// Create a stream with the default configuration (high-water mark 1,
    /// every chunk costing 1).
    pub fn new(source: impl Source<Chunk = T> + 'static) -> Self {
        Self {
            shared: ProducerShared::new(Box::new(source), ProducerConfig::default()),
        }
    }

    /// Create a stream with explicit configuration.
    pub fn with_config(
        source: impl Source<Chunk = T> + 'static,
        config: ProducerConfig<T>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: ProducerShared::new(Box::new(source), config),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProducerState {
        self.shared.state()
    }

    /// The stored error, once errored.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.shared.stored_error()
    }

    /// True while a reader holds the stream's lock.
    pub fn locked(&self) -> bool {
        self.shared.locked()
    }

    /// Acquire the exclusive reader. Fails with [`StreamError::Locked`]
    /// while another reader is attached.
    pub fn get_reader(&self) -> Result<DefaultReader<T>> {
        let closed = self.shared.acquire_reader()?;
        Ok(DefaultReader::new(self.shared.clone(), closed))
    }

    /// Cancel the stream without a reader attached.
    ///
    /// The returned future settles with the source cancel hook's outcome.
    /// Fails immediately with [`StreamError::Locked`] while locked.
    pub fn cancel(&self, reason: StreamError) -> Completion {
        if self.shared.locked() {
            return flowprims_task::Deferred::rejected(StreamError::Locked).wait();
        }
        self.shared.cancel(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use flowprims_task::run_local;

    use super::*;
    use crate::config::ProducerConfig;
    use crate::hooks::{self, HookFuture};

    /// Enqueues `first..=last`, one chunk per pull, starting with `first`
    /// from the start hook, then closes.
    struct CountSource {
        next: u32,
        last: u32,
    }

    impl Source for CountSource {
        type Chunk = u32;

        fn start(&mut self, controller: &ProducerController<u32>) -> HookFuture {
            let _ = controller.enqueue(self.next);
            self.next += 1;
            hooks::done()
        }

        fn pull(&mut self, controller: &ProducerController<u32>) -> HookFuture {
            let _ = controller.enqueue(self.next);
            self.next += 1;
            if self.next > self.last {
                let _ = controller.close();
            }
            hooks::done()
        }
    }

    /// Hands its controller out so the test drives the stream directly.
    struct RemoteSource {
        controller: Rc<RefCell<Option<ProducerController<u32>>>>,
        pulls: Rc<Cell<u32>>,
        cancels: Rc<Cell<u32>>,
    }

    impl RemoteSource {
        #[allow(clippy::type_complexity)]
        fn new() -> (
            Self,
            Rc<RefCell<Option<ProducerController<u32>>>>,
            Rc<Cell<u32>>,
            Rc<Cell<u32>>,
        ) {
            let controller = Rc::new(RefCell::new(None));
            let pulls = Rc::new(Cell::new(0));
            let cancels = Rc::new(Cell::new(0));
            (
                Self {
                    controller: Rc::clone(&controller),
                    pulls: Rc::clone(&pulls),
                    cancels: Rc::clone(&cancels),
                },
                controller,
                pulls,
                cancels,
            )
        }
    }

    impl Source for RemoteSource {
        type Chunk = u32;

        fn start(&mut self, controller: &ProducerController<u32>) -> HookFuture {
            *self.controller.borrow_mut() = Some(controller.clone());
            hooks::done()
        }

        fn pull(&mut self, _controller: &ProducerController<u32>) -> HookFuture {
            self.pulls.set(self.pulls.get() + 1);
            hooks::done()
        }

        fn cancel(&mut self, _reason: StreamError) -> HookFuture {
            self.cancels.set(self.cancels.get() + 1);
            hooks::done()
        }
    }

    async fn settled_controller(
        slot: &Rc<RefCell<Option<ProducerController<u32>>>>,
    ) -> ProducerController<u32> {
        loop {
            if let Some(controller) = slot.borrow().as_ref() {
                return controller.clone();
            }
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn reads_observe_chunks_in_order_then_done() {
        run_local(async {
            let stream = ProducerStream::new(CountSource { next: 0, last: 6 });
            let reader = stream.get_reader().expect("unlocked");
            for expected in 0..7 {
                assert_eq!(reader.read().await, Ok(Some(expected)));
            }
            assert_eq!(reader.read().await, Ok(None));
            assert_eq!(reader.read().await, Ok(None));
            assert_eq!(stream.state(), ProducerState::Closed);
        });
    }

    #[test]
    fn enqueue_bypasses_queue_for_a_waiting_read() {
        run_local(async {
            let (source, slot, _, _) = RemoteSource::new();
            let stream = ProducerStream::new(source);
            let reader = stream.get_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;
            let pending = reader.read();
            controller.enqueue(7).expect("readable");
            // The chunk went straight to the request, not the queue.
            assert_eq!(controller.desired_size(), Some(1.0));
            assert_eq!(pending.await, Ok(Some(7)));
        });
    }

    #[test]
    fn error_rejects_pending_and_future_reads_and_closed() {
        run_local(async {
            let (source, slot, _, _) = RemoteSource::new();
            let stream = ProducerStream::new(source);
            let reader = stream.get_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;
            let pending = reader.read();
            let reason = StreamError::other("source blew up");
            controller.error(reason.clone());
            assert_eq!(pending.await, Err(reason.clone()));
            assert_eq!(reader.read().await, Err(reason.clone()));
            assert_eq!(reader.closed().await, Err(reason.clone()));
            assert_eq!(stream.state(), ProducerState::Errored);
            assert_eq!(stream.stored_error(), Some(reason));
            assert_eq!(controller.desired_size(), None);
        });
    }

    #[test]
    fn cancel_runs_the_hook_once_and_is_idempotent() {
        run_local(async {
            let (source, slot, _, cancels) = RemoteSource::new();
            let stream = ProducerStream::new(source);
            let reader = stream.get_reader().expect("unlocked");
            let _ = settled_controller(&slot).await;
            let pending = reader.read();
            assert_eq!(reader.cancel(StreamError::other("done with it")).await, Ok(()));
            assert_eq!(cancels.get(), 1);
            // Pending reads observe end-of-stream, not an error.
            assert_eq!(pending.await, Ok(None));
            assert_eq!(stream.state(), ProducerState::Closed);
            // A second cancel on the closed stream is a successful no-op.
            assert_eq!(reader.cancel(StreamError::other("again")).await, Ok(()));
            assert_eq!(cancels.get(), 1);
        });
    }

    #[test]
    fn second_lock_acquisition_fails_until_release() {
        run_local(async {
            let stream = ProducerStream::new(CountSource { next: 0, last: 2 });
            let reader = stream.get_reader().expect("unlocked");
            assert!(stream.locked());
            assert!(matches!(stream.get_reader(), Err(StreamError::Locked)));
            reader.release();
            assert!(!stream.locked());
            let reader = stream.get_reader().expect("released");
            assert_eq!(reader.read().await, Ok(Some(0)));
        });
    }

    #[test]
    fn release_rejects_pending_reads_and_stream_stays_usable() {
        run_local(async {
            let (source, slot, _, _) = RemoteSource::new();
            let stream = ProducerStream::new(source);
            let reader = stream.get_reader().expect("unlocked");
            let controller = settled_controller(&slot).await;
            let pending = reader.read();
            reader.release();
            assert_eq!(pending.await, Err(StreamError::LockReleased));
            assert_eq!(reader.closed().await, Err(StreamError::LockReleased));
            // A new lock picks up where the old one left off.
            let reader = stream.get_reader().expect("released");
            controller.enqueue(3).expect("still readable");
            assert_eq!(reader.read().await, Ok(Some(3)));
        });
    }

    #[test]
    fn invalid_chunk_size_errors_the_stream() {
        run_local(async {
            let (source, slot, _, _) = RemoteSource::new();
            let config = ProducerConfig {
                high_water_mark: 1.0,
                size: Some(Rc::new(|_: &u32| f64::NAN)),
            };
            let stream = ProducerStream::with_config(source, config).expect("valid config");
            let controller = settled_controller(&slot).await;
            let outcome = controller.enqueue(1);
            assert!(matches!(outcome, Err(StreamError::SizeAlgorithm(_))));
            assert_eq!(stream.state(), ProducerState::Errored);
        });
    }

    #[test]
    fn pulling_stops_at_the_high_water_mark() {
        run_local(async {
            let (source, slot, pulls, _) = RemoteSource::new();
            let config = ProducerConfig {
                high_water_mark: 2.0,
                size: None,
            };
            let stream = ProducerStream::with_config(source, config).expect("valid config");
            let controller = settled_controller(&slot).await;
            // The source answers each pull from the test: two enqueues
            // fill the queue to the mark.
            for chunk in [10, 11] {
                controller.enqueue(chunk).expect("readable");
                tokio::task::yield_now().await;
            }
            // Let any in-flight pull settle before sampling the count.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            let pulls_at_mark = pulls.get();
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            assert_eq!(pulls.get(), pulls_at_mark);
            assert_eq!(controller.desired_size(), Some(0.0));
            assert_eq!(stream.state(), ProducerState::Readable);
        });
    }

    #[test]
    fn close_drains_queued_chunks_before_done() {
        run_local(async {
            let (source, slot, _, _) = RemoteSource::new();
            let config = ProducerConfig {
                high_water_mark: 4.0,
                size: None,
            };
            let stream = ProducerStream::with_config(source, config).expect("valid config");
            let controller = settled_controller(&slot).await;
            controller.enqueue(1).expect("readable");
            controller.enqueue(2).expect("readable");
            controller.close().expect("first close");
            assert!(controller.close().is_err());
            // Still draining: the stream reports closed only after the
            // last queued chunk is read.
            assert_eq!(stream.state(), ProducerState::Readable);
            let reader = stream.get_reader().expect("unlocked");
            assert_eq!(reader.read().await, Ok(Some(1)));
            assert_eq!(reader.read().await, Ok(Some(2)));
            assert_eq!(stream.state(), ProducerState::Closed);
            assert_eq!(reader.read().await, Ok(None));
        });
    }

    #[test]
    fn pull_failure_errors_the_stream() {
        run_local(async {
            struct FailingSource;
            impl Source for FailingSource {
                type Chunk = u32;
                fn pull(&mut self, _controller: &ProducerController<u32>) -> HookFuture {
                    hooks::fail(StreamError::hook("pull exploded"))
                }
            }
            let stream = ProducerStream::new(FailingSource);
            let reader = stream.get_reader().expect("unlocked");
            let outcome = reader.read().await;
            assert_eq!(outcome, Err(StreamError::hook("pull exploded")));
            assert_eq!(stream.state(), ProducerState::Errored);
        });
    }
}
