//! Asynchronous offload pipeline for a two-layer fully connected classifier.
//!
//! Matrix multiplication and the bias/activation stages run as kernels on an
//! accelerator behind an out-of-order command queue. Every enqueue returns an
//! [`Event`] completion token, and later stages name the tokens they depend
//! on, so a whole forward pass is issued without the host ever blocking.
//! The host waits only at explicit synchronization points such as
//! [`ExecutionContext::drain`] before reading results back.

pub mod config;
pub mod context;
pub mod device;
pub mod errors;
pub mod fcnn;
pub mod kernels;
pub mod ops;
pub mod tensor;
pub mod weights;

pub use config::ContextConfig;
pub use context::ExecutionContext;
pub use device::{Event, EventProfile, EventStatus, MemoryBank};
pub use fcnn::{Fcnn, FcnnWeights, ForwardPass, ForwardStage, argmax_rows};
pub use kernels::{Kernel, KernelArg, KernelPackage};
pub use ops::{BiasActivation, apply_bias, apply_matmul};
pub use tensor::{DeviceBinding, TensorBuffer};
