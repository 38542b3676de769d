//! Error types for slicepipe
//!
//! Every error is fatal for the run: once an operation of the pipeline has
//! returned `Err`, the pipeline must not be driven any further.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("slice out of range: index {index}, pipeline holds {total} slices")]
    SliceOutOfRange { index: usize, total: usize },

    #[error("invariant violated on slice {slice}: {message}")]
    Invariant { slice: usize, message: String },

    #[error("payload of {words} words exceeds the transport limit of {limit} words")]
    PayloadTooLarge { words: u64, limit: u64 },

    #[error("buffer access out of bounds: {len} words at offset {offset}, buffer holds {words}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        words: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device-resident buffers requested but the transport cannot move device memory")]
    DeviceMemoryUnsupported,

    #[error("message length mismatch on tag {tag}: expected {expected} words, got {actual}")]
    LengthMismatch {
        tag: u32,
        expected: usize,
        actual: usize,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(String),
}

impl Error {
    pub(crate) fn invariant(slice: usize, message: impl Into<String>) -> Self {
        Error::Invariant {
            slice,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
