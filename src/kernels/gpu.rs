//! Kernel package backed by WGSL compute shaders on a wgpu device.
//!
//! Each launch stages the argument buffers into GPU storage buffers,
//! dispatches the shader and copies the written buffer back into device
//! memory before the command's token resolves.

use std::sync::{Arc, mpsc};

use log::info;
use pollster::FutureExt;
use wgpu::util::DeviceExt;

use super::shaders::{BIAS_WORKGROUP_SIZE, MATMUL_WORKGROUP_EDGE, get_kernel_wgsl};
use super::{
    BIAS_ARITY, BIAS_RELU6_KERNEL, BIAS_SOFTMAX_KERNEL, Kernel, KernelArg, KernelPackage,
    MATMUL_ARITY, MATMUL_KERNEL, buffer_arg, ensure_capacity, uint_arg,
};
use crate::errors::{KernelError, KernelResult};

struct GpuRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuRuntime {
    fn pipeline(&self, label: &str, source: &str) -> wgpu::ComputePipeline {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        self.device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            })
    }

    fn storage(&self, label: &str, data: &[f32], writable: bool) -> wgpu::Buffer {
        let mut usage = wgpu::BufferUsages::STORAGE;
        if writable {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage,
            })
    }

    fn uniform(&self, values: [u32; 4]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel dims"),
                contents: bytemuck::cast_slice(&values),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// Binds `buffers` in order, dispatches, and reads back the buffer at `result_binding`.
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
        result_binding: usize,
        result_len: usize,
        workgroups: (u32, u32),
    ) -> KernelResult<Vec<f32>> {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &layout,
            entries: &entries,
        });

        let size = (result_len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups.0, workgroups.1, 1);
        }
        encoder.copy_buffer_to_buffer(buffers[result_binding], 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| KernelError::Execution {
                message: e.to_string(),
            })?
            .map_err(|e| KernelError::Execution {
                message: e.to_string(),
            })?;

        let mapped = slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(result)
    }
}

enum Entry {
    Matmul,
    Bias,
}

/// One WGSL entry point compiled for the shared wgpu device.
pub struct GpuKernel {
    name: &'static str,
    entry: Entry,
    pipeline: wgpu::ComputePipeline,
    runtime: Arc<GpuRuntime>,
}

impl GpuKernel {
    fn run_matmul(&self, args: &[KernelArg]) -> KernelResult<()> {
        let matrix_a = buffer_arg(args, 0, MATMUL_ARITY)?;
        let matrix_b = buffer_arg(args, 1, MATMUL_ARITY)?;
        let rows_a = uint_arg(args, 2, MATMUL_ARITY)?;
        let cols_a = uint_arg(args, 3, MATMUL_ARITY)?;
        let cols_b = uint_arg(args, 4, MATMUL_ARITY)?;
        let out = buffer_arg(args, 5, MATMUL_ARITY)?;

        ensure_capacity(matrix_a, 0, rows_a * cols_a)?;
        ensure_capacity(matrix_b, 1, cols_a * cols_b)?;
        ensure_capacity(out, 5, rows_a * cols_b)?;

        let out_len = rows_a * cols_b;
        if out_len == 0 {
            return Ok(());
        }
        if cols_a == 0 {
            // Zero-length storage bindings are invalid; the product is all zeros.
            out.write(|out| out[..out_len].fill(0.0));
            return Ok(());
        }

        let runtime = &self.runtime;
        let a = runtime.storage("matrix_a", &matrix_a.snapshot()[..rows_a * cols_a], false);
        let b = runtime.storage("matrix_b", &matrix_b.snapshot()[..cols_a * cols_b], false);
        let result = runtime.storage("out", &vec![0.0; out_len], true);
        let dims = runtime.uniform([rows_a as u32, cols_a as u32, cols_b as u32, 0]);

        let groups = (
            (cols_b as u32).div_ceil(MATMUL_WORKGROUP_EDGE),
            (rows_a as u32).div_ceil(MATMUL_WORKGROUP_EDGE),
        );
        let values = runtime.dispatch(&self.pipeline, &[&a, &b, &result, &dims], 2, out_len, groups)?;
        out.write(|out| out[..out_len].copy_from_slice(&values));
        Ok(())
    }

    fn run_bias(&self, args: &[KernelArg]) -> KernelResult<()> {
        let activation = buffer_arg(args, 0, BIAS_ARITY)?;
        let bias = buffer_arg(args, 1, BIAS_ARITY)?;
        let batch = uint_arg(args, 2, BIAS_ARITY)?;
        let dim = uint_arg(args, 3, BIAS_ARITY)?;

        ensure_capacity(activation, 0, batch * dim)?;
        ensure_capacity(bias, 1, dim)?;

        let len = batch * dim;
        if len == 0 {
            return Ok(());
        }

        let runtime = &self.runtime;
        let act = runtime.storage("activation", &activation.snapshot()[..len], true);
        let bias_buffer = runtime.storage("bias", &bias.snapshot()[..dim], false);
        let dims = runtime.uniform([batch as u32, dim as u32, 0, 0]);

        let groups = ((batch as u32).div_ceil(BIAS_WORKGROUP_SIZE), 1);
        let values = runtime.dispatch(&self.pipeline, &[&act, &bias_buffer, &dims], 0, len, groups)?;
        activation.write(|activation| activation[..len].copy_from_slice(&values));
        Ok(())
    }
}

impl Kernel for GpuKernel {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, args: &[KernelArg]) -> KernelResult<()> {
        match self.entry {
            Entry::Matmul => self.run_matmul(args),
            Entry::Bias => self.run_bias(args),
        }
    }
}

/// Creates a package whose kernels run on the default wgpu adapter.
///
/// Returns `None` when no adapter or device is available.
pub fn gpu_package() -> Option<KernelPackage> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions::default())
        .block_on()?;
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor::default(), None)
        .block_on()
        .ok()?;
    info!("Using wgpu adapter '{}'", adapter.get_info().name);

    let runtime = Arc::new(GpuRuntime { device, queue });
    let kernel = |name: &'static str, entry: Entry| {
        get_kernel_wgsl(name).map(|source| GpuKernel {
            name,
            entry,
            pipeline: runtime.pipeline(name, source),
            runtime: Arc::clone(&runtime),
        })
    };

    Some(
        KernelPackage::new("wgpu")
            .with_kernel(kernel(MATMUL_KERNEL, Entry::Matmul)?)
            .with_kernel(kernel(BIAS_RELU6_KERNEL, Entry::Bias)?)
            .with_kernel(kernel(BIAS_SOFTMAX_KERNEL, Entry::Bias)?),
    )
}
