//! The pipe coordinator: drives chunks from a producer stream into a
//! consumer stream with bidirectional failure propagation.
//!
//! The loop is strictly sequential — read a chunk, await writer readiness,
//! write, await the write's settlement — so consumer backpressure paces the
//! producer and no chunk is requested ahead of the previous write. Failure
//! on either side propagates to the other unless suppressed by the
//! corresponding `prevent_*` flag, and an external
//! [`CancellationToken`] tears the pipe down from outside.

use std::future::Future;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::consumer::{ConsumerState, ConsumerStream, Writer};
use crate::error::{Result, StreamError};
use crate::producer::{ByteProducerStream, ByteReader, DefaultReader, ProducerStream};
use crate::{Completion, ReadFuture};

/// Options for [`ProducerStream::pipe_to`] /
/// [`ByteProducerStream::pipe_to`].
#[derive(Debug, Clone, Default)]
pub struct PipeOptions {
    /// Leave the consumer open when the producer closes.
    pub prevent_close: bool,
    /// Leave the consumer alone when the producer errors.
    pub prevent_abort: bool,
    /// Leave the producer alone when the consumer errors or closes.
    pub prevent_cancel: bool,
    /// External cancellation: when the token fires, the pipe cancels the
    /// producer and aborts the consumer (per the flags above) and settles
    /// with [`StreamError::Cancelled`].
    pub signal: Option<CancellationToken>,
}

/// The producer end of a pipe: both reader kinds feed chunks the same way.
trait PipeSource<T> {
    fn read_chunk(&self) -> ReadFuture<T>;
    fn cancel_chunks(&self, reason: StreamError) -> Completion;
}

impl<T: 'static> PipeSource<T> for DefaultReader<T> {
    fn read_chunk(&self) -> ReadFuture<T> {
        self.read()
    }

    fn cancel_chunks(&self, reason: StreamError) -> Completion {
        self.cancel(reason)
    }
}

impl PipeSource<Bytes> for ByteReader {
    fn read_chunk(&self) -> ReadFuture<Bytes> {
        self.read()
    }

    fn cancel_chunks(&self, reason: StreamError) -> Completion {
        self.cancel(reason)
    }
}

/// Await `future`, bailing out with `None` the moment the signal fires.
async fn with_signal<F: Future>(signal: &Option<CancellationToken>, future: F) -> Option<F::Output> {
    match signal {
        None => Some(future.await),
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = future => Some(output),
            }
        }
    }
}

async fn forward_source_failure<T: 'static>(
    writer: &Writer<T>,
    reason: StreamError,
    options: &PipeOptions,
) -> Result<()> {
    if !options.prevent_abort {
        let _ = writer.abort(reason.clone()).await;
    }
    Err(reason)
}

async fn forward_dest_failure<T, S: PipeSource<T>>(
    reader: &S,
    reason: StreamError,
    options: &PipeOptions,
) -> Result<()> {
    if !options.prevent_cancel {
        let _ = reader.cancel_chunks(reason.clone()).await;
    }
    Err(reason)
}

async fn tear_down_cancelled<T: 'static, S: PipeSource<T>>(
    reader: &S,
    writer: &Writer<T>,
    options: &PipeOptions,
) -> Result<()> {
    let reason = StreamError::Cancelled;
    if !options.prevent_abort {
        let _ = writer.abort(reason.clone()).await;
    }
    if !options.prevent_cancel {
        let _ = reader.cancel_chunks(reason.clone()).await;
    }
    Err(reason)
}

async fn run_pipe<T: 'static, S: PipeSource<T>>(
    reader: S,
    writer: Writer<T>,
    options: PipeOptions,
) -> Result<()> {
    let signal = options.signal.clone();
    let result = loop {
        if let Some(token) = &signal {
            if token.is_cancelled() {
                break tear_down_cancelled(&reader, &writer, &options).await;
            }
        }
        // Fail fast if the destination is already finished.
        match writer.stream_state() {
            ConsumerState::Errored => {
                let reason = writer
                    .stream_stored_error()
                    .unwrap_or(StreamError::InvalidState("destination errored"));
                break forward_dest_failure(&reader, reason, &options).await;
            }
            ConsumerState::Closed => {
                let reason = StreamError::InvalidState("destination closed");
                break forward_dest_failure(&reader, reason, &options).await;
            }
            ConsumerState::Writable | ConsumerState::Erroring => {}
        }
        let step = with_signal(&signal, reader.read_chunk()).await;
        let chunk = match step {
            None => break tear_down_cancelled(&reader, &writer, &options).await,
            Some(Err(reason)) => break forward_source_failure(&writer, reason, &options).await,
            Some(Ok(None)) => {
                // Producer finished cleanly; propagate the close unless
                // suppressed. The close itself is not interruptible.
                break if options.prevent_close {
                    Ok(())
                } else {
                    match writer.close_or_propagate().await {
                        Ok(()) => Ok(()),
                        Err(reason) => Err(reason),
                    }
                };
            }
            Some(Ok(Some(chunk))) => chunk,
        };
        match with_signal(&signal, writer.ready()).await {
            None => break tear_down_cancelled(&reader, &writer, &options).await,
            Some(Err(reason)) => break forward_dest_failure(&reader, reason, &options).await,
            Some(Ok(())) => {}
        }
        match with_signal(&signal, writer.write(chunk)).await {
            None => break tear_down_cancelled(&reader, &writer, &options).await,
            Some(Err(reason)) => break forward_dest_failure(&reader, reason, &options).await,
            Some(Ok(())) => {}
        }
    };
    writer.release();
    match &result {
        Ok(()) => debug!("pipe finished"),
        Err(reason) => debug!(error = %reason, "pipe failed"),
    }
    result
}

impl<T: 'static> ProducerStream<T> {
    /// Drive this stream's chunks into `destination` until one side
    /// finishes, with bidirectional failure propagation per `options`.
    ///
    /// Both streams are locked for the duration and released when the
    /// pipe settles; piping a locked stream fails immediately with
    /// [`StreamError::Locked`].
    pub async fn pipe_to(
        &self,
        destination: &ConsumerStream<T>,
        options: PipeOptions,
    ) -> Result<()> {
        let reader = self.get_reader()?;
        let writer = destination.get_writer()?;
        debug!("pipe started");
        run_pipe(reader, writer, options).await
    }
}

impl ByteProducerStream {
    /// Drive this stream's chunks into `destination`; see
    /// [`ProducerStream::pipe_to`].
    pub async fn pipe_to(
        &self,
        destination: &ConsumerStream<Bytes>,
        options: PipeOptions,
    ) -> Result<()> {
        let reader = self.get_reader()?;
        let writer = destination.get_writer()?;
        debug!("pipe started");
        run_pipe(reader, writer, options).await
    }
}
