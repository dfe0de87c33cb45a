//! The execution context every pipeline operation is issued against.

use std::sync::Arc;

use log::info;

use crate::config::ContextConfig;
use crate::device::{CommandQueue, Device, Event, MemoryBank};
use crate::device::event::dependency_list;
use crate::device::queue::Work;
use crate::errors::{PipelineError, PipelineResult};
use crate::kernels::{
    BIAS_RELU6_KERNEL, BIAS_SOFTMAX_KERNEL, Kernel, KernelArg, KernelPackage, MATMUL_KERNEL,
};

/// Device, out-of-order queue and the three kernel handles, created once and
/// passed explicitly to every operation that touches the accelerator.
///
/// Dropping the context waits for all enqueued commands to finish.
pub struct ExecutionContext {
    device: Device,
    queue: CommandQueue,
    default_bank: MemoryBank,
    package_name: String,
    matmul: Arc<dyn Kernel>,
    bias_clamp: Arc<dyn Kernel>,
    bias_normalize: Arc<dyn Kernel>,
}

impl ExecutionContext {
    /// Loads the kernel handles from `package` using the default configuration.
    pub fn initialize(package: &KernelPackage) -> PipelineResult<Self> {
        Self::with_config(package, &ContextConfig::default())
    }

    pub fn with_config(package: &KernelPackage, config: &ContextConfig) -> PipelineResult<Self> {
        config.validate()?;

        let lookup = |name: &str| {
            package.get(name).ok_or_else(|| PipelineError::KernelNotFound {
                name: name.to_string(),
            })
        };
        let matmul = lookup(MATMUL_KERNEL)?;
        let bias_clamp = lookup(BIAS_RELU6_KERNEL)?;
        let bias_normalize = lookup(BIAS_SOFTMAX_KERNEL)?;

        let device = Device::new(config.get_device_name(), config.get_alignment());
        let queue = CommandQueue::new(config.get_compute_units())?;

        info!(
            "Initialized '{}' with kernel package '{}' ({}): alignment {} bytes, {} compute units, default bank {}",
            device.name(),
            package.name(),
            package.kernel_names().join(", "),
            device.required_alignment(),
            queue.compute_units(),
            config.get_default_bank()
        );

        Ok(Self {
            device,
            queue,
            default_bank: config.get_default_bank(),
            package_name: package.name().to_string(),
            matmul,
            bias_clamp,
            bias_normalize,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Byte alignment host memory must satisfy to be bound.
    pub fn required_alignment(&self) -> usize {
        self.device.required_alignment()
    }

    pub fn default_bank(&self) -> MemoryBank {
        self.default_bank
    }

    pub fn compute_units(&self) -> usize {
        self.queue.compute_units()
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn matmul_kernel(&self) -> &Arc<dyn Kernel> {
        &self.matmul
    }

    pub fn bias_clamp_kernel(&self) -> &Arc<dyn Kernel> {
        &self.bias_clamp
    }

    pub fn bias_normalize_kernel(&self) -> &Arc<dyn Kernel> {
        &self.bias_normalize
    }

    /// Launches `kernel` with `args` once every token in `wait_on` completed.
    ///
    /// Returns immediately with the launch's completion token. Every token in
    /// `wait_on` must have been issued by this context.
    pub fn enqueue_task(
        &self,
        kernel: &Arc<dyn Kernel>,
        args: Vec<KernelArg>,
        wait_on: &[Event],
    ) -> PipelineResult<Event> {
        let kernel = Arc::clone(kernel);
        let label = kernel.name().to_string();
        let work: Work = Box::new(move || kernel.execute(&args).map_err(|e| e.to_string()));
        self.queue.enqueue(&label, dependency_list(wait_on), work)
    }

    pub(crate) fn enqueue_migration(
        &self,
        label: &str,
        wait_on: &[Event],
        work: Work,
    ) -> PipelineResult<Event> {
        self.queue.enqueue(label, dependency_list(wait_on), work)
    }

    /// Blocks until every previously enqueued operation has resolved.
    ///
    /// Reports the first command failure seen since the last drain.
    pub fn drain(&self) -> PipelineResult<()> {
        self.queue.drain()
    }

    /// Same as [`drain`](Self::drain).
    pub fn enqueue_wait(&self) -> PipelineResult<()> {
        self.drain()
    }

    /// Blocks on specific tokens only, leaving unrelated work in flight.
    pub fn wait_for(&self, events: &[Event]) -> PipelineResult<()> {
        for event in events {
            event.wait()?;
        }
        Ok(())
    }
}
