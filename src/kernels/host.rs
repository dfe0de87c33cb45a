//! Numeric kernels and their host-emulated entry points.
//!
//! The free functions are the reference algorithms; the `*Kernel` structs wrap
//! them behind the positional argument protocol of [`Kernel`]. Each entry
//! point copies its read-only operands out of device memory before taking the
//! write lock on its output, so no command ever holds two buffer locks.

use super::{
    BIAS_ARITY, BIAS_RELU6_KERNEL, BIAS_SOFTMAX_KERNEL, Kernel, KernelArg, KernelPackage,
    MATMUL_ARITY, MATMUL_KERNEL, buffer_arg, ensure_capacity, uint_arg,
};
use crate::errors::KernelResult;

/// `out = A · B` for row-major `A` (`rows_a × cols_a`) and `B` (`cols_a × cols_b`).
///
/// Every output element starts from zero before accumulation, and the sum over
/// `k` runs in ascending order.
pub fn matmul(
    matrix_a: &[f32],
    matrix_b: &[f32],
    rows_a: usize,
    cols_a: usize,
    cols_b: usize,
    out: &mut [f32],
) {
    for i in 0..rows_a {
        let row_a = &matrix_a[cols_a * i..cols_a * (i + 1)];
        let row_out = &mut out[cols_b * i..cols_b * (i + 1)];
        for (j, out_value) in row_out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for (k, &a) in row_a.iter().enumerate() {
                acc += a * matrix_b[cols_b * k + j];
            }
            *out_value = acc;
        }
    }
}

#[inline(always)]
fn relu6(x: f32) -> f32 {
    if x < 0.0 {
        return 0.0;
    }
    if x > 6.0 {
        return 6.0;
    }
    x
}

/// `activation[b][d] = clamp(activation[b][d] + bias[d], 0, 6)`, in place.
pub fn bias_relu6(activation: &mut [f32], bias: &[f32], batch: usize, dim: usize) {
    if dim == 0 {
        return;
    }
    for row in activation.chunks_exact_mut(dim).take(batch) {
        for (value, &b) in row.iter_mut().zip(bias) {
            *value = relu6(*value + b);
        }
    }
}

/// `activation[b][d] = exp(x + bias[d]) / Σ exp(x + bias)`, in place.
///
/// Plain exponentiation with no max subtraction: each row is exponentiated
/// and summed completely before any element is divided. Rows whose
/// activations exceed roughly 88 overflow to `inf` and yield NaN.
pub fn bias_softmax(activation: &mut [f32], bias: &[f32], batch: usize, dim: usize) {
    if dim == 0 {
        return;
    }
    for row in activation.chunks_exact_mut(dim).take(batch) {
        let mut accum = 0.0f32;
        for (value, &b) in row.iter_mut().zip(bias) {
            *value = (*value + b).exp();
            accum += *value;
        }
        for value in row.iter_mut() {
            *value /= accum;
        }
    }
}

/// Host implementation of `matmul_kernel`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatmulKernel;

impl Kernel for MatmulKernel {
    fn name(&self) -> &str {
        MATMUL_KERNEL
    }

    fn execute(&self, args: &[KernelArg]) -> KernelResult<()> {
        let matrix_a = buffer_arg(args, 0, MATMUL_ARITY)?;
        let matrix_b = buffer_arg(args, 1, MATMUL_ARITY)?;
        let rows_a = uint_arg(args, 2, MATMUL_ARITY)?;
        let cols_a = uint_arg(args, 3, MATMUL_ARITY)?;
        let cols_b = uint_arg(args, 4, MATMUL_ARITY)?;
        let out = buffer_arg(args, 5, MATMUL_ARITY)?;

        ensure_capacity(matrix_a, 0, rows_a * cols_a)?;
        ensure_capacity(matrix_b, 1, cols_a * cols_b)?;
        ensure_capacity(out, 5, rows_a * cols_b)?;

        let a = matrix_a.snapshot();
        let b = matrix_b.snapshot();
        out.write(|out| matmul(&a, &b, rows_a, cols_a, cols_b, out));
        Ok(())
    }
}

/// Reads the `activation*, bias*, batch, dim` argument list shared by both bias kernels.
fn bias_kernel_launch(
    args: &[KernelArg],
    apply: fn(&mut [f32], &[f32], usize, usize),
) -> KernelResult<()> {
    let activation = buffer_arg(args, 0, BIAS_ARITY)?;
    let bias = buffer_arg(args, 1, BIAS_ARITY)?;
    let batch = uint_arg(args, 2, BIAS_ARITY)?;
    let dim = uint_arg(args, 3, BIAS_ARITY)?;

    ensure_capacity(activation, 0, batch * dim)?;
    ensure_capacity(bias, 1, dim)?;

    let bias = bias.snapshot();
    activation.write(|activation| apply(activation, &bias, batch, dim));
    Ok(())
}

/// Host implementation of `bias_relu6_kernel`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BiasRelu6Kernel;

impl Kernel for BiasRelu6Kernel {
    fn name(&self) -> &str {
        BIAS_RELU6_KERNEL
    }

    fn execute(&self, args: &[KernelArg]) -> KernelResult<()> {
        bias_kernel_launch(args, bias_relu6)
    }
}

/// Host implementation of `bias_softmax_kernel`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BiasSoftmaxKernel;

impl Kernel for BiasSoftmaxKernel {
    fn name(&self) -> &str {
        BIAS_SOFTMAX_KERNEL
    }

    fn execute(&self, args: &[KernelArg]) -> KernelResult<()> {
        bias_kernel_launch(args, bias_softmax)
    }
}

pub fn host_emulated_package() -> KernelPackage {
    KernelPackage::new("host-emulated")
        .with_kernel(MatmulKernel)
        .with_kernel(BiasRelu6Kernel)
        .with_kernel(BiasSoftmaxKernel)
}
