//! WGSL sources for the three kernel entry points.
//!
//! Each shader exposes a single `main` compute entry point. Matmul binds
//! `A`, `B`, `out` and a dimension uniform at bindings 0-3; the bias kernels
//! bind `activation`, `bias` and a dimension uniform at bindings 0-2.

use super::{BIAS_RELU6_KERNEL, BIAS_SOFTMAX_KERNEL, MATMUL_KERNEL};

pub const MATMUL_WGSL: &str = include_str!("matmul.wgsl");
pub const BIAS_RELU6_WGSL: &str = include_str!("bias_relu6.wgsl");
pub const BIAS_SOFTMAX_WGSL: &str = include_str!("bias_softmax.wgsl");

/// Workgroup edge of the matmul shader (8x8 invocations per group).
pub const MATMUL_WORKGROUP_EDGE: u32 = 8;
/// Rows handled per workgroup by the bias shaders.
pub const BIAS_WORKGROUP_SIZE: u32 = 64;

/// Looks up the WGSL source for a kernel entry point.
pub fn get_kernel_wgsl(kernel_name: &str) -> Option<&'static str> {
    match kernel_name {
        MATMUL_KERNEL => Some(MATMUL_WGSL),
        BIAS_RELU6_KERNEL => Some(BIAS_RELU6_WGSL),
        BIAS_SOFTMAX_KERNEL => Some(BIAS_SOFTMAX_WGSL),
        _ => None,
    }
}
