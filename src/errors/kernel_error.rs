//! Error types raised by kernel entry points while they execute.

use thiserror::Error;

/// Errors a kernel reports back to the queue.
///
/// Kernels validate their argument list the way a device runtime validates
/// `setArg` calls: wrong kinds, missing slots and buffers too small for the
/// scalar dimensions are all rejected before any memory is touched.
#[derive(Error, Debug, Clone)]
pub enum KernelError {
    #[error("Argument {index} is missing (kernel takes {expected} arguments, got {actual})")]
    MissingArgument {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Argument {index} must be a {expected}")]
    ArgumentKind { index: usize, expected: &'static str },

    #[error("Buffer argument {index} holds {actual} elements but {required} are addressed")]
    BufferTooSmall {
        index: usize,
        required: usize,
        actual: usize,
    },

    #[error("Device execution failed: {message}")]
    Execution { message: String },
}
