//! Consumer side: writable stream state machine, controller, and writer.
//!
//! A [`ConsumerStream`] feeds chunks to a [`Sink`] one at a time, with a
//! sized queue between caller and sink and a readiness signal that paces
//! writers once the queue passes its high-water mark. The stream is driven
//! through at most one [`Writer`] at a time.

mod controller;
mod writer;

pub use self::writer::Writer;

use crate::config::ConsumerConfig;
use crate::error::{Result, StreamError};
use crate::hooks::Sink;
use crate::Completion;

use self::controller::ConsumerShared;

/// Lifecycle state of a consumer stream.
///
/// `Writable → Erroring → Errored` on failure or abort; `Writable →
/// Closed` on a clean close (a close that wins the race against an abort
/// skips `Erroring` entirely, and `Closed` is unreachable from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Accepting writes.
    Writable,
    /// A failure or abort was recorded; an in-flight operation is still
    /// settling.
    Erroring,
    /// Terminal clean shutdown.
    Closed,
    /// Terminal failure; the stored error settles every request.
    Errored,
}

/// A backpressure-aware chunk consumer stream.
///
/// Created from a [`Sink`] whose hooks drain the internal queue; driven
/// through a [`Writer`] or as the destination of
/// [`ProducerStream::pipe_to`](crate::ProducerStream::pipe_to).
pub struct ConsumerStream<T> {
    pub(crate) shared: ConsumerShared<T>,
}

impl<T: 'static> ConsumerStream<T> {
    /// Create a stream with the default configuration (high-water mark 1,
    /// every chunk costing 1).
    pub fn new(sink: impl Sink<Chunk = T> + 'static) -> Self {
        Self {
            shared: ConsumerShared::new(Box::new(sink), ConsumerConfig::default()),
        }
    }

    /// Create a stream with explicit configuration.
    pub fn with_config(
        sink: impl Sink<Chunk = T> + 'static,
        config: ConsumerConfig<T>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: ConsumerShared::new(Box::new(sink), config),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        self.shared.state()
    }

    /// The stored error, once erroring or errored.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.shared.stored_error()
    }

    /// True while a writer holds the stream's lock.
    pub fn locked(&self) -> bool {
        self.shared.locked()
    }

    /// Acquire the exclusive writer. Fails with [`StreamError::Locked`]
    /// while another writer is attached.
    pub fn get_writer(&self) -> Result<Writer<T>> {
        self.shared.acquire_writer()?;
        Ok(Writer::new(self.shared.clone()))
    }

    /// Abort the stream without a writer attached.
    ///
    /// Resolves once the sink's abort hook settles; a no-op on a stream
    /// that is already closed or errored. Fails immediately with
    /// [`StreamError::Locked`] while locked.
    pub fn abort(&self, reason: StreamError) -> Completion {
        if self.shared.locked() {
            return flowprims_task::Deferred::rejected(StreamError::Locked).wait();
        }
        self.shared.abort(reason)
    }
}

/// Handle passed to [`Sink`] hooks.
pub struct ConsumerController<T> {
    pub(crate) shared: ConsumerShared<T>,
}

impl<T> Clone for ConsumerController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static> ConsumerController<T> {
    /// Move a writable stream onto the error path with `reason`.
    ///
    /// A no-op once the stream left the writable state.
    pub fn error(&self, reason: StreamError) {
        self.shared.error_if_needed(reason);
    }
}
