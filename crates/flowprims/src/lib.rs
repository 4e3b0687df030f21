//! Backpressure-aware producer/consumer stream primitives.
//!
//! flowprims decouples chunk and byte producers from consumers without
//! unbounded buffering: each side is a precise state machine with a sized
//! queue, explicit close/error/abort/cancel semantics, and a pipe
//! coordinator that connects the two with bidirectional failure
//! propagation. It is the flow-control layer higher-level I/O builds on.
//!
//! # Crate Structure
//!
//! - [`producer`] — readable side: [`ProducerStream`], byte-oriented
//!   [`ByteProducerStream`], default and zero-copy readers
//! - [`consumer`] — writable side: [`ConsumerStream`] and its [`Writer`]
//! - [`pipe`] — the piping coordinator ([`pipe_to`](ProducerStream::pipe_to))
//! - [`hooks`] — the [`Source`]/[`Sink`] hook traits user code implements
//! - [`config`] — construction options (high-water marks, size functions)
//!
//! Everything runs on a single cooperative flow: streams are not `Send`
//! and expect to be driven from a current-thread scheduler such as
//! [`flowprims_task::run_local`].

pub mod config;
pub mod consumer;
pub mod error;
pub mod hooks;
pub mod pipe;
pub mod producer;

pub use config::{ByteProducerConfig, ConsumerConfig, ProducerConfig, SizeFn};
pub use consumer::{ConsumerController, ConsumerState, ConsumerStream, Writer};
pub use error::{Result, StreamError};
pub use hooks::{ByteSource, HookFuture, Sink, Source};
pub use pipe::PipeOptions;
pub use producer::{
    ByteController, ByteProducerStream, ByteReader, ByteView, DefaultReader, ProducerController,
    ProducerState, ProducerStream, ZeroCopyRead, ZeroCopyReader,
};

/// Future of a default-mode read: `Some(chunk)` in FIFO order, `None` at
/// end-of-stream.
pub type ReadFuture<T> = flowprims_task::Claim<Option<T>, StreamError>;

/// Future of a byte chunk read.
pub type ByteReadFuture = ReadFuture<bytes::Bytes>;

/// Future of a zero-copy read: the caller's buffer comes back inside the
/// result.
pub type ZeroCopyReadFuture = flowprims_task::Claim<ZeroCopyRead, StreamError>;

/// Future of an operation that settles with `()` or a stream error:
/// writes, closes, aborts, cancels, readiness and closed notifications.
pub type Completion = flowprims_task::Wait<(), StreamError>;
