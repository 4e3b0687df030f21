use std::cell::Cell;

use flowprims_task::Deferred;

use crate::consumer::controller::ConsumerShared;
use crate::consumer::ConsumerState;
use crate::error::{Result, StreamError};
use crate::Completion;

/// The exclusive writer of a [`ConsumerStream`](crate::ConsumerStream).
///
/// Holding a writer locks the stream. Writes settle strictly in the order
/// issued; [`ready`](Writer::ready) is the backpressure signal — pending
/// while the queue sits at or above its high-water mark. Dropping the
/// writer releases the lock; an explicit [`release`](Writer::release)
/// additionally rejects queued (not yet in-flight) writes with
/// [`StreamError::LockReleased`].
pub struct Writer<T> {
    shared: ConsumerShared<T>,
    released: Cell<bool>,
}

impl<T: 'static> Writer<T> {
    pub(crate) fn new(shared: ConsumerShared<T>) -> Self {
        Self {
            shared,
            released: Cell::new(false),
        }
    }

    fn released_error(&self) -> Option<Completion> {
        if self.released.get() {
            Some(Deferred::rejected(StreamError::InvalidState("writer released")).wait())
        } else {
            None
        }
    }

    /// Queue a chunk for the sink. The returned future settles when the
    /// sink's write hook for this chunk settles.
    pub fn write(&self, chunk: T) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.write(chunk)
    }

    /// Request a clean close: the queue drains, the sink's close hook
    /// runs, and the stream transitions to closed.
    pub fn close(&self) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.close()
    }

    /// Abort the stream: queued writes are rejected and the sink's abort
    /// hook runs once any in-flight operation settles. A second abort
    /// while one is pending joins the same result.
    pub fn abort(&self, reason: StreamError) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.abort(reason)
    }

    /// Backpressure signal: pending while the queue sits at or above the
    /// high-water mark, resolved when it clears, rejected once the stream
    /// errors.
    pub fn ready(&self) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.writer_ready()
    }

    /// Settles on clean close; rejects with the stored error or the
    /// lock-release reason.
    pub fn closed(&self) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.writer_closed()
    }

    /// Remaining queue capacity: `Some(high_water_mark - queued)` while
    /// writable, `Some(0)` once closed, `None` while erroring/errored.
    pub fn desired_size(&self) -> Result<Option<f64>> {
        if self.released.get() {
            return Err(StreamError::InvalidState("writer released"));
        }
        Ok(self.shared.writer_desired_size())
    }

    /// Close unless the stream is already closing or closed, propagating
    /// the stored error if it already failed.
    pub(crate) fn close_or_propagate(&self) -> Completion {
        if let Some(rejected) = self.released_error() {
            return rejected;
        }
        self.shared.close_or_propagate()
    }

    pub(crate) fn stream_state(&self) -> ConsumerState {
        self.shared.state()
    }

    pub(crate) fn stream_stored_error(&self) -> Option<StreamError> {
        self.shared.stored_error()
    }

    /// Release the lock. Queued writes and a queued close reject with
    /// [`StreamError::LockReleased`]; an in-flight operation still settles
    /// from its hook's outcome. The stream may be locked again afterwards.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        self.shared.release_writer();
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.shared.release_writer();
        }
    }
}
