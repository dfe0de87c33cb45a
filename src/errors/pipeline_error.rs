//! Error types for tensor, context and pipeline operations.

use thiserror::Error;

use super::FormatError;

/// Errors surfaced by buffer binding, enqueue helpers and the forward pass.
///
/// Shape, bounds and binding checks run on the host before anything is
/// enqueued, so these are reported at the call that violated them. Failures of
/// device-side work are reported through the completion token instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(
        "Host buffer alignment {alignment} does not satisfy device DMA requirement of {required} bytes"
    )]
    Misaligned { alignment: usize, required: usize },

    #[error("Tensor ({rows}x{cols}) has no device binding; bind it to the device first")]
    NotOnDevice { rows: usize, cols: usize },

    #[error("Shape mismatch in {operation}: {lhs:?} is incompatible with {rhs:?}")]
    ShapeMismatch {
        operation: &'static str,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },

    #[error("Index ({row}, {col}) is out of bounds for tensor of shape ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Data length {actual} does not match shape ({rows}, {cols})")]
    DataLengthMismatch {
        rows: usize,
        cols: usize,
        actual: usize,
    },

    #[error("Kernel package does not provide entry point '{name}'")]
    KernelNotFound { name: String },

    #[error("Dimension {value} of {operation} does not fit the kernel's 32-bit scalar arguments")]
    DimensionOverflow { operation: &'static str, value: usize },

    #[error("Memory bank {bank} does not exist; the device has {available} banks")]
    InvalidBank { bank: u8, available: u8 },

    #[error("Command '{label}' was not executed because a dependency failed: {reason}")]
    DependencyFailed { label: String, reason: String },

    #[error("Command '{label}' failed: {reason}")]
    CommandFailed { label: String, reason: String },

    #[error(
        "Command '{label}' cannot wait on '{event}', which was issued by another execution context"
    )]
    ForeignEvent { label: String, event: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
