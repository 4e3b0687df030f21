use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use flowprims_task::Deferred;

use crate::error::{Result, StreamError};
use crate::producer::controller::ProducerShared;
use crate::{Completion, ReadFuture};

/// The exclusive chunk reader of a [`ProducerStream`](crate::ProducerStream).
///
/// Holding a reader locks the stream. Dropping the reader releases the
/// lock; an explicit [`release`](DefaultReader::release) does the same and
/// rejects any still-pending reads with [`StreamError::LockReleased`].
pub struct DefaultReader<T> {
    shared: ProducerShared<T>,
    closed: Deferred<(), StreamError>,
    released: Cell<bool>,
    pending_next: RefCell<Option<ReadFuture<T>>>,
}

impl<T: 'static> DefaultReader<T> {
    pub(crate) fn new(shared: ProducerShared<T>, closed: Deferred<(), StreamError>) -> Self {
        Self {
            shared,
            closed,
            released: Cell::new(false),
            pending_next: RefCell::new(None),
        }
    }

    /// Read the next chunk: `Ok(Some(chunk))` in FIFO order, `Ok(None)`
    /// exactly once at end-of-stream, `Err` with the stored error on an
    /// errored stream.
    pub fn read(&self) -> ReadFuture<T> {
        if self.released.get() {
            return Deferred::rejected(StreamError::InvalidState("reader released")).claim();
        }
        self.shared.read()
    }

    /// Cancel the stream: the queue is dropped, pending reads observe
    /// end-of-stream, and the source's cancel hook runs exactly once. The
    /// returned future settles with the hook's outcome.
    pub fn cancel(&self, reason: StreamError) -> Completion {
        if self.released.get() {
            return Deferred::rejected(StreamError::InvalidState("reader released")).wait();
        }
        self.shared.cancel(reason)
    }

    /// Settles when the stream closes, or rejects with the stored error /
    /// lock-release reason.
    pub fn closed(&self) -> Completion {
        self.closed.wait()
    }

    /// Release the lock. Still-pending reads reject with
    /// [`StreamError::LockReleased`]; the stream may be locked again
    /// afterwards.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        self.shared.release_reader();
    }
}

impl<T> Drop for DefaultReader<T> {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.shared.release_reader();
        }
    }
}

impl<T: 'static> futures_core::Stream for DefaultReader<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut slot = this.pending_next.borrow_mut();
        let fut = slot.get_or_insert_with(|| this.read());
        match Pin::new(fut).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                *slot = None;
                Poll::Ready(match outcome {
                    Ok(Some(chunk)) => Some(Ok(chunk)),
                    Ok(None) => None,
                    Err(reason) => Some(Err(reason)),
                })
            }
        }
    }
}
