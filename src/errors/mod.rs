//! Error types for the offload pipeline.
//!
//! Each failure family gets its own `thiserror` enum instead of a generic
//! wrapper, so callers can match on the exact condition.

mod format_error;
mod kernel_error;
mod pipeline_error;

pub use format_error::FormatError;
pub use kernel_error::KernelError;
pub use pipeline_error::PipelineError;

/// Result type alias for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Result type alias for weight file decoding.
pub type FormatResult<T> = std::result::Result<T, FormatError>;

/// Result type alias for kernel execution.
pub type KernelResult<T> = std::result::Result<T, KernelError>;
