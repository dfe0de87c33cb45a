//! Enqueue helpers that launch the kernels on bound tensors.
//!
//! Shape and binding checks run here, on the host, before anything
//! is enqueued. Each launch depends on the caller's tokens plus the ready
//! tokens of its operands.

use crate::context::ExecutionContext;
use crate::device::Event;
use crate::errors::{PipelineError, PipelineResult};
use crate::kernels::KernelArg;
use crate::tensor::TensorBuffer;

/// Activation applied after the bias broadcast in [`apply_bias`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasActivation {
    /// `clamp(x + b, 0, 6)`
    Relu6,
    /// Row-wise `exp(x + b) / Σ exp(x + b)`, unshifted.
    Softmax,
}

fn kernel_dim(operation: &'static str, value: usize) -> PipelineResult<u32> {
    u32::try_from(value).map_err(|_| PipelineError::DimensionOverflow { operation, value })
}

/// Enqueues `a · b` into a freshly allocated, zero-initialised, device-bound tensor.
///
/// Returns the result tensor and the token of the multiply.
pub fn apply_matmul(
    context: &ExecutionContext,
    a: &TensorBuffer,
    b: &TensorBuffer,
    wait_on: &[Event],
) -> PipelineResult<(TensorBuffer, Event)> {
    const OPERATION: &str = "matmul";

    if a.cols() != b.rows() {
        return Err(PipelineError::ShapeMismatch {
            operation: OPERATION,
            lhs: a.shape(),
            rhs: b.shape(),
        });
    }
    let rows_a = kernel_dim(OPERATION, a.rows())?;
    let cols_a = kernel_dim(OPERATION, a.cols())?;
    let cols_b = kernel_dim(OPERATION, b.cols())?;

    let a_buffer = a.device_handle()?.clone();
    let b_buffer = b.device_handle()?.clone();
    let mut deps: Vec<Event> = wait_on.to_vec();
    deps.push(a.ready_event()?.clone());
    deps.push(b.ready_event()?.clone());

    let mut result =
        TensorBuffer::with_alignment(a.rows(), b.cols(), context.required_alignment())?;
    deps.push(result.bind_to_device(context, None)?);

    let args = vec![
        KernelArg::Buffer(a_buffer),
        KernelArg::Buffer(b_buffer),
        KernelArg::Uint(rows_a),
        KernelArg::Uint(cols_a),
        KernelArg::Uint(cols_b),
        KernelArg::Buffer(result.device_handle()?.clone()),
    ];
    let event = context.enqueue_task(context.matmul_kernel(), args, &deps)?;
    result.mark_written(event.clone());
    Ok((result, event))
}

/// Enqueues the in-place bias broadcast plus `activation_fn` on `activation`.
///
/// `bias` may be stored as a row or a column; only its element count must
/// equal `activation.cols()`.
pub fn apply_bias(
    context: &ExecutionContext,
    activation: &mut TensorBuffer,
    bias: &TensorBuffer,
    activation_fn: BiasActivation,
    wait_on: &[Event],
) -> PipelineResult<Event> {
    let operation = match activation_fn {
        BiasActivation::Relu6 => "bias_relu6",
        BiasActivation::Softmax => "bias_softmax",
    };

    if bias.len() != activation.cols() {
        return Err(PipelineError::ShapeMismatch {
            operation,
            lhs: activation.shape(),
            rhs: bias.shape(),
        });
    }
    let batch = kernel_dim(operation, activation.rows())?;
    let dim = kernel_dim(operation, activation.cols())?;

    let activation_buffer = activation.device_handle()?.clone();
    let bias_buffer = bias.device_handle()?.clone();

    let mut deps: Vec<Event> = wait_on.to_vec();
    deps.push(activation.ready_event()?.clone());
    deps.push(bias.ready_event()?.clone());

    let kernel = match activation_fn {
        BiasActivation::Relu6 => context.bias_clamp_kernel(),
        BiasActivation::Softmax => context.bias_normalize_kernel(),
    };
    let args = vec![
        KernelArg::Buffer(activation_buffer),
        KernelArg::Buffer(bias_buffer),
        KernelArg::Uint(batch),
        KernelArg::Uint(dim),
    ];
    let event = context.enqueue_task(kernel, args, &deps)?;
    activation.mark_written(event.clone());
    Ok(event)
}
