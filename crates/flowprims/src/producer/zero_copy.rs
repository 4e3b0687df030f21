use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use flowprims_task::Deferred;

use crate::error::{Result, StreamError};
use crate::producer::bytes::ByteShared;
use crate::{ByteReadFuture, Completion, ZeroCopyReadFuture};

/// A caller-owned destination buffer for zero-copy reads.
///
/// The view is *moved* into [`ZeroCopyReader::read`]; while the controller
/// holds it, nobody else can touch the memory. It comes back, over the same
/// memory, inside the [`ZeroCopyRead`] result with its length set to the
/// number of bytes delivered (capacity is preserved for reuse).
pub struct ByteView {
    buf: BytesMut,
    element_size: usize,
}

impl ByteView {
    /// A plain byte view (element size 1). The buffer must be non-empty.
    pub fn new(buf: BytesMut) -> Result<Self> {
        Self::with_element_size(buf, 1)
    }

    /// A view over fixed-size elements. The buffer must be non-empty and
    /// a whole number of elements long.
    pub fn with_element_size(buf: BytesMut, element_size: usize) -> Result<Self> {
        if element_size == 0 {
            return Err(StreamError::InvalidConfig("element size must be non-zero"));
        }
        if buf.is_empty() || buf.len() % element_size != 0 {
            return Err(StreamError::InvalidConfig(
                "view length must be a non-zero multiple of the element size",
            ));
        }
        Ok(Self { buf, element_size })
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Take the underlying buffer back, e.g. to resize it for another
    /// read.
    pub fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub(crate) fn into_parts(self) -> (BytesMut, usize) {
        (self.buf, self.element_size)
    }

    pub(crate) fn from_parts(buf: BytesMut, element_size: usize) -> Self {
        Self { buf, element_size }
    }

    pub(crate) fn emptied(mut self) -> Self {
        self.buf.truncate(0);
        self
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteView")
            .field("len", &self.buf.len())
            .field("element_size", &self.element_size)
            .finish()
    }
}

/// Outcome of a zero-copy read: the caller's memory back, holding the
/// delivered bytes.
#[derive(Debug)]
pub struct ZeroCopyRead {
    /// The same memory that went in, with its length set to the bytes
    /// delivered (zero on `done`).
    pub view: ByteView,
    /// True once the stream is exhausted.
    pub done: bool,
}

/// The exclusive zero-copy reader of a
/// [`ByteProducerStream`](crate::ByteProducerStream).
///
/// Each read hands a [`ByteView`] to the controller and gets the same
/// memory back filled in place. Buffers are serviced strictly in the order
/// the reads were issued.
pub struct ZeroCopyReader {
    shared: ByteShared,
    closed: Deferred<(), StreamError>,
    released: Cell<bool>,
}

impl ZeroCopyReader {
    pub(crate) fn new(shared: ByteShared, closed: Deferred<(), StreamError>) -> Self {
        Self {
            shared,
            closed,
            released: Cell::new(false),
        }
    }

    /// Fill the caller's view from the stream.
    ///
    /// With bytes already queued, an element-aligned prefix is copied in
    /// immediately and the leftover stays queued. Otherwise the buffer is
    /// registered for filling and the source is asked to pull.
    pub fn read(&self, view: ByteView) -> ZeroCopyReadFuture {
        if self.released.get() {
            return Deferred::rejected(StreamError::InvalidState("reader released")).claim();
        }
        self.shared.read_into(view)
    }

    /// Cancel the stream; outstanding buffers come back `done=true`.
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

    /// Release the lock; still-pending reads reject with
    /// [`StreamError::LockReleased`] (their buffers are dropped).
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        self.shared.release_reader();
    }
}

impl Drop for ZeroCopyReader {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.shared.release_reader();
        }
    }
}

/// The exclusive chunk reader of a
/// [`ByteProducerStream`](crate::ByteProducerStream).
///
/// Reads whole queued chunks; with an auto-allocate chunk size configured
/// it can read from a pull-driven source without a caller buffer.
pub struct ByteReader {
    shared: ByteShared,
    closed: Deferred<(), StreamError>,
    released: Cell<bool>,
    pending_next: RefCell<Option<ByteReadFuture>>,
}

impl ByteReader {
    pub(crate) fn new(shared: ByteShared, closed: Deferred<(), StreamError>) -> Self {
        Self {
            shared,
            closed,
            released: Cell::new(false),
            pending_next: RefCell::new(None),
        }
    }

    /// Read the next chunk: `Ok(Some(bytes))` in FIFO order, `Ok(None)`
    /// exactly once at end-of-stream.
    pub fn read(&self) -> ByteReadFuture {
        if self.released.get() {
            return Deferred::rejected(StreamError::InvalidState("reader released")).claim();
        }
        self.shared.read_chunk()
    }

    /// Cancel the stream; the cancel hook runs exactly once.
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

    /// Release the lock; still-pending reads reject with
    /// [`StreamError::LockReleased`].
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        self.shared.release_reader();
    }
}

impl Drop for ByteReader {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            self.shared.release_reader();
        }
    }
}

impl futures_core::Stream for ByteReader {
    type Item = Result<Bytes>;

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
