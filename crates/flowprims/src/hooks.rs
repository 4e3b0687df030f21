//! Underlying source and sink hook traits.
//!
//! A producer stream is driven by a [`Source`] (or [`ByteSource`]), a
//! consumer stream by a [`Sink`]. Every hook is optionally awaitable: it
//! returns a [`HookFuture`] and may do its work synchronously before
//! returning a resolved future, or capture what it needs and finish later.
//! Hooks are always entered from a scheduled task, never re-entrantly from
//! inside another hook's synchronous body.
//!
//! A hook failure routes through the owning stream's error/erroring
//! transition; it is never silently absorbed.

use std::future::Future;
use std::pin::Pin;

use crate::consumer::ConsumerController;
use crate::error::{Result, StreamError};
use crate::producer::{ByteController, ProducerController};

/// The awaitable outcome of a hook invocation.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// A hook outcome that is already successful.
pub fn done() -> HookFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// A hook outcome that has already failed.
pub fn fail(reason: StreamError) -> HookFuture {
    Box::pin(std::future::ready(Err(reason)))
}

/// Box any future as a hook outcome.
pub fn from_future<F>(future: F) -> HookFuture
where
    F: Future<Output = Result<()>> + 'static,
{
    Box::pin(future)
}

/// Chunk producer hooks for a default producer stream.
pub trait Source {
    type Chunk;

    /// Runs once at stream setup, before any pull.
    fn start(&mut self, controller: &ProducerController<Self::Chunk>) -> HookFuture {
        let _ = controller;
        done()
    }

    /// Requests more data. Rescheduled whenever the queue is below the
    /// high-water mark or a read is waiting; never invoked concurrently
    /// with itself.
    fn pull(&mut self, controller: &ProducerController<Self::Chunk>) -> HookFuture {
        let _ = controller;
        done()
    }

    /// The consumer no longer wants data. Invoked at most once.
    fn cancel(&mut self, reason: StreamError) -> HookFuture {
        let _ = reason;
        done()
    }
}

/// Byte producer hooks for a byte-oriented producer stream.
pub trait ByteSource {
    /// Runs once at stream setup, before any pull.
    fn start(&mut self, controller: &ByteController) -> HookFuture {
        let _ = controller;
        done()
    }

    /// Requests more bytes; a zero-copy buffer or a default read is
    /// waiting when this runs on a zero high-water mark stream.
    fn pull(&mut self, controller: &ByteController) -> HookFuture {
        let _ = controller;
        done()
    }

    /// The consumer no longer wants data. Invoked at most once.
    fn cancel(&mut self, reason: StreamError) -> HookFuture {
        let _ = reason;
        done()
    }
}

/// Chunk consumer hooks for a consumer stream.
pub trait Sink {
    type Chunk;

    /// Runs once at stream setup, before any write.
    fn start(&mut self, controller: &ConsumerController<Self::Chunk>) -> HookFuture {
        let _ = controller;
        done()
    }

    /// Consume one chunk. At most one write (or close) is in flight at a
    /// time; the next queued chunk is delivered only after this settles.
    fn write(&mut self, chunk: Self::Chunk, controller: &ConsumerController<Self::Chunk>) -> HookFuture {
        let _ = (chunk, controller);
        done()
    }

    /// Flush and release the sink once the queue has drained. Invoked at
    /// most once, never after `abort`.
    fn close(&mut self) -> HookFuture {
        done()
    }

    /// Tear down after an abort. Invoked at most once, never after
    /// `close`.
    fn abort(&mut self, reason: StreamError) -> HookFuture {
        let _ = reason;
        done()
    }
}
