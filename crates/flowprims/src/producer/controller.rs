use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use flowprims_queue::SizedQueue;
use flowprims_task::{spawn, Deferred};
use tracing::debug;

use crate::config::{size_fn_or_default, ProducerConfig, SizeFn};
use crate::error::{Result, StreamError};
use crate::hooks::Source;
use crate::producer::ProducerState;
use crate::{Completion, ReadFuture};

pub(crate) struct StreamCore<T> {
    pub(crate) state: ProducerState,
    pub(crate) stored_error: Option<StreamError>,
    pub(crate) reader: Option<ReaderCore<T>>,
}

pub(crate) struct ReaderCore<T> {
    pub(crate) read_requests: VecDeque<Deferred<Option<T>, StreamError>>,
    pub(crate) closed: Deferred<(), StreamError>,
}

struct CtlCore<T> {
    queue: SizedQueue<T>,
    started: bool,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    high_water_mark: f64,
    size: SizeFn<T>,
}

/// Shared state of one default producer stream: the stream cell, the
/// controller cell, and the source hook cell. The three are borrowed only
/// for short, non-overlapping windows; user hooks run with none of them
/// held except the hook cell during the hook's synchronous prologue.
pub(crate) struct ProducerShared<T> {
    stream: Rc<RefCell<StreamCore<T>>>,
    ctl: Rc<RefCell<CtlCore<T>>>,
    source: Rc<RefCell<Option<Box<dyn Source<Chunk = T>>>>>,
}

impl<T> Clone for ProducerShared<T> {
    fn clone(&self) -> Self {
        Self {
            stream: Rc::clone(&self.stream),
            ctl: Rc::clone(&self.ctl),
            source: Rc::clone(&self.source),
        }
    }
}

impl<T> ProducerShared<T> {
    pub(crate) fn state(&self) -> ProducerState {
        self.stream.borrow().state
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.stream.borrow().stored_error.clone()
    }

    pub(crate) fn locked(&self) -> bool {
        self.stream.borrow().reader.is_some()
    }

    pub(crate) fn desired_size(&self) -> Option<f64> {
        match self.stream.borrow().state {
            ProducerState::Readable => {
                let ctl = self.ctl.borrow();
                Some(ctl.high_water_mark - ctl.queue.total_size())
            }
            ProducerState::Closed => Some(0.0),
            ProducerState::Errored => None,
        }
    }

    pub(crate) fn release_reader(&self) {
        let taken = self.stream.borrow_mut().reader.take();
        if let Some(core) = taken {
            for request in core.read_requests {
                request.reject(StreamError::LockReleased);
            }
            // No-op if the stream already settled it.
            core.closed.reject(StreamError::LockReleased);
        }
    }
}

impl<T: 'static> ProducerShared<T> {
    pub(crate) fn new(source: Box<dyn Source<Chunk = T>>, config: ProducerConfig<T>) -> Self {
        let shared = Self {
            stream: Rc::new(RefCell::new(StreamCore {
                state: ProducerState::Readable,
                stored_error: None,
                reader: None,
            })),
            ctl: Rc::new(RefCell::new(CtlCore {
                queue: SizedQueue::new(),
                started: false,
                pulling: false,
                pull_again: false,
                close_requested: false,
                high_water_mark: config.high_water_mark,
                size: size_fn_or_default(config.size),
            })),
            source: Rc::new(RefCell::new(Some(source))),
        };
        shared.spawn_start();
        shared
    }

    fn controller(&self) -> ProducerController<T> {
        ProducerController {
            shared: self.clone(),
        }
    }

    fn spawn_start(&self) {
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut source = shared.source.borrow_mut();
                source.as_mut().map(|s| s.start(&controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            shared.ctl.borrow_mut().started = true;
            match outcome {
                Ok(()) => shared.call_pull_if_needed(),
                Err(reason) => shared.error(reason),
            }
        });
    }

    // ---- controller operations ----

    pub(crate) fn enqueue(&self, chunk: T) -> Result<()> {
        if self.stream.borrow().state != ProducerState::Readable {
            return Err(StreamError::InvalidState("enqueue on a non-readable stream"));
        }
        if self.ctl.borrow().close_requested {
            return Err(StreamError::InvalidState("enqueue after close requested"));
        }
        let pending = {
            let mut stream = self.stream.borrow_mut();
            stream
                .reader
                .as_mut()
                .and_then(|reader| reader.read_requests.pop_front())
        };
        match pending {
            // A read is already waiting: hand the chunk over, bypassing
            // the queue.
            Some(request) => request.resolve(Some(chunk)),
            None => {
                let size_fn = Rc::clone(&self.ctl.borrow().size);
                let size = size_fn(&chunk);
                if !size.is_finite() || size < 0.0 {
                    let reason = StreamError::SizeAlgorithm(size);
                    self.error(reason.clone());
                    return Err(reason);
                }
                self.ctl.borrow_mut().queue.append(chunk, size);
            }
        }
        self.call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        if self.stream.borrow().state != ProducerState::Readable {
            return Err(StreamError::InvalidState("close on a non-readable stream"));
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            if ctl.close_requested {
                return Err(StreamError::InvalidState("close already requested"));
            }
            ctl.close_requested = true;
            if !ctl.queue.is_empty() {
                // Queued chunks drain through reads first; the stream
                // transitions once the queue empties.
                return Ok(());
            }
        }
        self.close_stream();
        Ok(())
    }

    pub(crate) fn error(&self, reason: StreamError) {
        {
            let mut stream = self.stream.borrow_mut();
            if stream.state != ProducerState::Readable {
                return;
            }
            stream.state = ProducerState::Errored;
            stream.stored_error = Some(reason.clone());
        }
        debug!(error = %reason, "producer errored");
        {
            let mut ctl = self.ctl.borrow_mut();
            ctl.queue.clear();
            ctl.pull_again = false;
        }
        let drained = {
            let mut stream = self.stream.borrow_mut();
            stream
                .reader
                .as_mut()
                .map(|reader| (std::mem::take(&mut reader.read_requests), reader.closed.clone()))
        };
        if let Some((requests, closed)) = drained {
            for request in requests {
                request.reject(reason.clone());
            }
            closed.reject(reason);
        }
        self.dispose_source();
    }

    // ---- stream transitions ----

    fn close_stream(&self) {
        {
            let mut stream = self.stream.borrow_mut();
            debug_assert_eq!(stream.state, ProducerState::Readable);
            stream.state = ProducerState::Closed;
        }
        debug!("producer closed");
        let drained = {
            let mut stream = self.stream.borrow_mut();
            stream
                .reader
                .as_mut()
                .map(|reader| (std::mem::take(&mut reader.read_requests), reader.closed.clone()))
        };
        if let Some((requests, closed)) = drained {
            for request in requests {
                request.resolve(None);
            }
            closed.resolve(());
        }
        self.dispose_source();
    }

    /// Drop the source hooks once no further hook may run, breaking any
    /// reference cycle through a user-held controller handle.
    fn dispose_source(&self) {
        let source = Rc::clone(&self.source);
        spawn(async move {
            source.borrow_mut().take();
        });
    }

    // ---- pull scheduling ----

    fn should_pull(&self) -> bool {
        let stream = self.stream.borrow();
        if stream.state != ProducerState::Readable {
            return false;
        }
        let ctl = self.ctl.borrow();
        if ctl.close_requested || !ctl.started {
            return false;
        }
        if stream
            .reader
            .as_ref()
            .is_some_and(|reader| !reader.read_requests.is_empty())
        {
            return true;
        }
        ctl.high_water_mark - ctl.queue.total_size() > 0.0
    }

    pub(crate) fn call_pull_if_needed(&self) {
        if !self.should_pull() {
            return;
        }
        {
            let mut ctl = self.ctl.borrow_mut();
            if ctl.pulling {
                ctl.pull_again = true;
                return;
            }
            ctl.pulling = true;
        }
        let shared = self.clone();
        spawn(async move {
            let hook = {
                let controller = shared.controller();
                let mut source = shared.source.borrow_mut();
                source.as_mut().map(|s| s.pull(&controller))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => {
                    let again = {
                        let mut ctl = shared.ctl.borrow_mut();
                        ctl.pulling = false;
                        std::mem::take(&mut ctl.pull_again)
                    };
                    if again {
                        shared.call_pull_if_needed();
                    }
                }
                Err(reason) => {
                    shared.ctl.borrow_mut().pulling = false;
                    shared.error(reason);
                }
            }
        });
    }

    // ---- reader operations ----

    pub(crate) fn acquire_reader(&self) -> Result<Deferred<(), StreamError>> {
        let mut stream = self.stream.borrow_mut();
        if stream.reader.is_some() {
            return Err(StreamError::Locked);
        }
        let closed = match stream.state {
            ProducerState::Readable => Deferred::new(),
            ProducerState::Closed => Deferred::resolved(()),
            ProducerState::Errored => Deferred::rejected(
                stream
                    .stored_error
                    .clone()
                    .unwrap_or(StreamError::InvalidState("stream errored")),
            ),
        };
        stream.reader = Some(ReaderCore {
            read_requests: VecDeque::new(),
            closed: closed.clone(),
        });
        Ok(closed)
    }

    pub(crate) fn read(&self) -> ReadFuture<T> {
        let (state, stored) = {
            let stream = self.stream.borrow();
            (stream.state, stream.stored_error.clone())
        };
        match state {
            ProducerState::Closed => Deferred::resolved(None).claim(),
            ProducerState::Errored => {
                Deferred::rejected(stored.unwrap_or(StreamError::InvalidState("stream errored")))
                    .claim()
            }
            ProducerState::Readable => {
                let dequeued = self.ctl.borrow_mut().queue.dequeue_first();
                match dequeued {
                    Some(chunk) => {
                        let drained = {
                            let ctl = self.ctl.borrow();
                            ctl.close_requested && ctl.queue.is_empty()
                        };
                        if drained {
                            self.close_stream();
                        } else {
                            self.call_pull_if_needed();
                        }
                        Deferred::resolved(Some(chunk)).claim()
                    }
                    None => {
                        let request = Deferred::new();
                        {
                            let mut stream = self.stream.borrow_mut();
                            match stream.reader.as_mut() {
                                Some(reader) => reader.read_requests.push_back(request.clone()),
                                None => {
                                    return Deferred::rejected(StreamError::InvalidState(
                                        "reader released",
                                    ))
                                    .claim()
                                }
                            }
                        }
                        self.call_pull_if_needed();
                        request.claim()
                    }
                }
            }
        }
    }

    pub(crate) fn cancel(&self, reason: StreamError) -> Completion {
        {
            let stream = self.stream.borrow();
            match stream.state {
                ProducerState::Closed => return Deferred::resolved(()).wait(),
                ProducerState::Errored => {
                    return Deferred::rejected(
                        stream
                            .stored_error
                            .clone()
                            .unwrap_or(StreamError::InvalidState("stream errored")),
                    )
                    .wait()
                }
                ProducerState::Readable => {}
            }
        }
        debug!(reason = %reason, "producer cancelled");
        let result = Deferred::new();
        // The cancel hook runs exactly once, regardless of queue state.
        // Spawned before `close_stream` so it claims the source box ahead
        // of the disposal task.
        let shared = self.clone();
        let settle = result.clone();
        spawn(async move {
            let hook = {
                let mut source = shared.source.borrow_mut();
                source.take().map(|mut s| s.cancel(reason))
            };
            let outcome = match hook {
                Some(hook) => hook.await,
                None => Ok(()),
            };
            match outcome {
                Ok(()) => settle.resolve(()),
                Err(reason) => settle.reject(reason),
            }
        });
        self.ctl.borrow_mut().queue.clear();
        self.close_stream();
        result.wait()
    }
}

/// Handle passed to [`Source`] hooks for feeding a default producer
/// stream.
pub struct ProducerController<T> {
    shared: ProducerShared<T>,
}

impl<T> Clone for ProducerController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> ProducerController<T> {
    /// Queue a chunk, or hand it straight to a waiting read.
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        self.shared.enqueue(chunk)
    }

    /// No more chunks will be enqueued. Queued chunks still drain through
    /// reads before the stream reports end-of-stream.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Move the stream to the errored state, rejecting all pending and
    /// future reads with `reason`.
    pub fn error(&self, reason: StreamError) {
        self.shared.error(reason)
    }

    /// Remaining queue capacity: high-water mark minus queued size.
    /// `Some(0)` once closed, `None` once errored.
    pub fn desired_size(&self) -> Option<f64> {
        self.shared.desired_size()
    }
}
