//! Error handling for the culling pipeline
//!
//! Culled-versus-visible decisions are data and never surface here. Only
//! allocation failures, invalid resource use and device failures do, and all
//! of them abort the current frame.

use crate::gpu::{BufferHandle, ComputeProgram, TextureHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CullError {
    #[error("GPU out of memory: '{label}' requested {requested} bytes (budget {budget} bytes)")]
    OutOfMemory {
        label: String,
        requested: u64,
        budget: u64,
    },

    #[error("Invalid or destroyed buffer handle {0:?}")]
    InvalidBuffer(BufferHandle),

    #[error("Invalid or destroyed texture handle {0:?}")]
    InvalidTexture(TextureHandle),

    #[error("Buffer '{label}' access out of range: offset {offset} + {len} bytes exceeds {size} bytes")]
    OutOfRange {
        label: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("Texture mismatch: {0}")]
    TextureMismatch(String),

    #[error("{program:?} dispatched without a resource in binding slot {slot}")]
    MissingBinding { program: ComputeProgram, slot: u32 },

    #[error("GPU operation '{operation}' failed: {error}")]
    GpuOperationFailed { operation: String, error: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Type alias for pipeline operation results
pub type CullResult<T> = Result<T, CullError>;

/// Helper trait for attaching a GPU operation name to foreign errors
pub trait GpuErrorContext<T> {
    fn gpu_context(self, operation: &str) -> CullResult<T>;
}

impl<T, E> GpuErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn gpu_context(self, operation: &str) -> CullResult<T> {
        self.map_err(|e| gpu_operation_error(operation, e))
    }
}

/// Create a GPU operation error
pub fn gpu_operation_error(operation: &str, error: impl std::fmt::Display) -> CullError {
    CullError::GpuOperationFailed {
        operation: operation.to_string(),
        error: error.to_string(),
    }
}
