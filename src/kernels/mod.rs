//! Kernel entry points and the packages that provide them.
//!
//! A kernel package stands in for a compiled accelerator binary: it exposes
//! named entry points that take positional arguments, the same way a device
//! runtime binds buffers and scalars to a kernel before launching it.
//!
//! Every package used by an [`ExecutionContext`](crate::ExecutionContext)
//! must provide these entry points:
//!
//! | name | arguments |
//! |---|---|
//! | `matmul_kernel` | `A*, B*, rowsA, colsA, colsB, out*` |
//! | `bias_relu6_kernel` | `activation*, bias*, batch, dim` (in place) |
//! | `bias_softmax_kernel` | `activation*, bias*, batch, dim` (in place) |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::DeviceBuffer;
use crate::errors::{KernelError, KernelResult};

pub mod host;
pub mod shaders;

#[cfg(feature = "gpu")]
pub mod gpu;

pub const MATMUL_KERNEL: &str = "matmul_kernel";
pub const BIAS_RELU6_KERNEL: &str = "bias_relu6_kernel";
pub const BIAS_SOFTMAX_KERNEL: &str = "bias_softmax_kernel";

/// Number of arguments taken by `matmul_kernel`.
pub const MATMUL_ARITY: usize = 6;
/// Number of arguments taken by the two bias kernels.
pub const BIAS_ARITY: usize = 4;

/// One positional kernel argument.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(DeviceBuffer),
    Uint(u32),
}

/// A precompiled routine the accelerator can run.
pub trait Kernel: Send + Sync {
    /// Entry point name inside the package.
    fn name(&self) -> &str;

    /// Runs the kernel to completion on the calling compute unit.
    fn execute(&self, args: &[KernelArg]) -> KernelResult<()>;
}

/// Returns the buffer bound at `index`.
pub fn buffer_arg(args: &[KernelArg], index: usize, arity: usize) -> KernelResult<&DeviceBuffer> {
    match args.get(index) {
        Some(KernelArg::Buffer(buffer)) => Ok(buffer),
        Some(KernelArg::Uint(_)) => Err(KernelError::ArgumentKind {
            index,
            expected: "buffer",
        }),
        None => Err(KernelError::MissingArgument {
            index,
            expected: arity,
            actual: args.len(),
        }),
    }
}

/// Returns the scalar bound at `index`, widened for indexing.
pub fn uint_arg(args: &[KernelArg], index: usize, arity: usize) -> KernelResult<usize> {
    match args.get(index) {
        Some(KernelArg::Uint(value)) => Ok(*value as usize),
        Some(KernelArg::Buffer(_)) => Err(KernelError::ArgumentKind {
            index,
            expected: "32-bit unsigned scalar",
        }),
        None => Err(KernelError::MissingArgument {
            index,
            expected: arity,
            actual: args.len(),
        }),
    }
}

/// Fails unless the buffer at `index` holds at least `required` elements.
pub fn ensure_capacity(buffer: &DeviceBuffer, index: usize, required: usize) -> KernelResult<()> {
    let actual = buffer.len();
    if actual < required {
        return Err(KernelError::BufferTooSmall {
            index,
            required,
            actual,
        });
    }
    Ok(())
}

/// Named collection of kernels, the analogue of a loaded device binary.
#[derive(Clone)]
pub struct KernelPackage {
    name: String,
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: HashMap::new(),
        }
    }

    /// Package whose kernels run on the host, standing in for the accelerator.
    pub fn host_emulated() -> Self {
        host::host_emulated_package()
    }

    /// Adds or replaces the entry point with the kernel's name.
    pub fn with_kernel(mut self, kernel: impl Kernel + 'static) -> Self {
        self.kernels
            .insert(kernel.name().to_string(), Arc::new(kernel));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(name).cloned()
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for KernelPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelPackage")
            .field("name", &self.name)
            .field("kernels", &self.kernel_names())
            .finish()
    }
}
