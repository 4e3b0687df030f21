use std::rc::Rc;

use crate::error::{Result, StreamError};

/// Chunk cost function: maps a chunk to its queue size.
///
/// A negative or non-finite result is the size-algorithm failure case and
/// errors the owning stream at enqueue time.
pub type SizeFn<T> = Rc<dyn Fn(&T) -> f64>;

fn validate_high_water_mark(high_water_mark: f64) -> Result<()> {
    if !high_water_mark.is_finite() || high_water_mark < 0.0 {
        return Err(StreamError::InvalidConfig(
            "high water mark must be a non-negative finite number",
        ));
    }
    Ok(())
}

/// Configuration for a default (chunk-oriented) producer stream.
#[derive(Clone)]
pub struct ProducerConfig<T> {
    /// Queue-size threshold above which backpressure pauses pulling.
    pub high_water_mark: f64,
    /// Chunk cost function. `None` costs every chunk 1.
    pub size: Option<SizeFn<T>>,
}

impl<T> Default for ProducerConfig<T> {
    fn default() -> Self {
        Self {
            high_water_mark: 1.0,
            size: None,
        }
    }
}

impl<T> ProducerConfig<T> {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_high_water_mark(self.high_water_mark)
    }
}

/// Configuration for a byte-oriented producer stream.
///
/// The default high-water mark is zero: byte streams pull on reader demand
/// rather than eagerly filling their queue.
#[derive(Debug, Clone)]
pub struct ByteProducerConfig {
    /// Queue-size threshold (in bytes) above which backpressure pauses
    /// pulling.
    pub high_water_mark: f64,
    /// When set, default-mode reads allocate a buffer of this many bytes
    /// and register it for filling, so the stream is readable without a
    /// caller-supplied buffer.
    pub auto_allocate_chunk_size: Option<usize>,
}

impl Default for ByteProducerConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 0.0,
            auto_allocate_chunk_size: None,
        }
    }
}

impl ByteProducerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_high_water_mark(self.high_water_mark)?;
        if self.auto_allocate_chunk_size == Some(0) {
            return Err(StreamError::InvalidConfig(
                "auto-allocate chunk size must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Configuration for a consumer stream.
#[derive(Clone)]
pub struct ConsumerConfig<T> {
    /// Queue-size threshold at which writer readiness becomes pending.
    pub high_water_mark: f64,
    /// Chunk cost function. `None` costs every chunk 1.
    pub size: Option<SizeFn<T>>,
}

impl<T> Default for ConsumerConfig<T> {
    fn default() -> Self {
        Self {
            high_water_mark: 1.0,
            size: None,
        }
    }
}

impl<T> ConsumerConfig<T> {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_high_water_mark(self.high_water_mark)
    }
}

pub(crate) fn size_fn_or_default<T>(size: Option<SizeFn<T>>) -> SizeFn<T> {
    size.unwrap_or_else(|| Rc::new(|_| 1.0))
}
