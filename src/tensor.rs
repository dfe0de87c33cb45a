//! Row-major `f32` matrices with an optional device-resident mirror.
//!
//! A [`TensorBuffer`] owns page-aligned host memory. Binding it to the device
//! enqueues a host→device migration and records the resulting token as the
//! buffer's *ready* token; every later command that writes the device copy
//! replaces it. Enqueue helpers depend on the ready tokens of their operands,
//! so a chain of device operations never needs a host-side wait.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::DEFAULT_ALIGNMENT;
use crate::context::ExecutionContext;
use crate::device::{AlignedHostBuffer, DeviceBuffer, Event, MemoryBank};
use crate::errors::{PipelineError, PipelineResult};
use crate::weights;

/// Device-side state of a [`TensorBuffer`].
#[derive(Debug, Clone)]
pub enum DeviceBinding {
    Unbound,
    Bound {
        buffer: DeviceBuffer,
        /// Token of the last command that wrote `buffer`.
        ready: Event,
    },
}

pub struct TensorBuffer {
    rows: usize,
    cols: usize,
    host: Arc<RwLock<AlignedHostBuffer>>,
    binding: DeviceBinding,
    /// Last enqueued device→host copy. Later migrations are ordered after it,
    /// but host accessors do not wait: sync on its token or drain first.
    pending_readback: Option<Event>,
}

impl TensorBuffer {
    /// A zero-filled tensor with the default DMA alignment.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::constant(rows, cols, 0.0)
    }

    pub fn constant(rows: usize, cols: usize, value: f32) -> Self {
        Self::from_host(
            rows,
            cols,
            AlignedHostBuffer::filled(rows * cols, DEFAULT_ALIGNMENT, value),
        )
    }

    /// A zero-filled tensor whose host memory is aligned to `alignment` bytes.
    pub fn with_alignment(rows: usize, cols: usize, alignment: usize) -> PipelineResult<Self> {
        check_alignment(alignment)?;
        Ok(Self::from_host(
            rows,
            cols,
            AlignedHostBuffer::zeroed(rows * cols, alignment),
        ))
    }

    pub fn from_row_major(rows: usize, cols: usize, data: &[f32]) -> PipelineResult<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(PipelineError::DataLengthMismatch {
                rows,
                cols,
                actual: data.len(),
            });
        }
        let mut host = AlignedHostBuffer::zeroed(data.len(), DEFAULT_ALIGNMENT);
        host.as_mut_slice().copy_from_slice(data);
        Ok(Self::from_host(rows, cols, host))
    }

    /// Loads a 2-D `float32` array from a `.npy` file.
    pub fn from_npy(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let matrix = weights::read_npy(path)?;
        Self::from_row_major(matrix.rows, matrix.cols, &matrix.data)
    }

    /// Writes the host-resident values as a `.npy` file.
    pub fn save_npy(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let data = self.to_vec();
        weights::write_npy(path, self.rows, self.cols, &data)?;
        Ok(())
    }

    /// Returns the tensor with host memory aligned to at least `alignment` bytes.
    ///
    /// Tensors that already satisfy `alignment` are returned unchanged.
    /// Otherwise the host values are copied into a new allocation, after any
    /// pending readback has landed, and the device binding is dropped.
    pub fn realigned(self, alignment: usize) -> PipelineResult<Self> {
        check_alignment(alignment)?;
        if self.read_host(|host| host.satisfies_alignment(alignment)) {
            return Ok(self);
        }
        if let Some(readback) = &self.pending_readback {
            readback.wait()?;
        }
        let mut host = AlignedHostBuffer::zeroed(self.len(), alignment);
        self.read_host(|current| host.as_mut_slice().copy_from_slice(current.as_slice()));
        Ok(Self::from_host(self.rows, self.cols, host))
    }

    fn from_host(rows: usize, cols: usize, host: AlignedHostBuffer) -> Self {
        Self {
            rows,
            cols,
            host: Arc::new(RwLock::new(host)),
            binding: DeviceBinding::Unbound,
            pending_readback: None,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte alignment of the host allocation.
    pub fn alignment(&self) -> usize {
        self.read_host(|host| host.alignment())
    }

    pub fn get(&self, row: usize, col: usize) -> PipelineResult<f32> {
        let index = self.flat_index(row, col)?;
        Ok(self.read_host(|host| host.as_slice()[index]))
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) -> PipelineResult<()> {
        let index = self.flat_index(row, col)?;
        self.write_host(|host| host.as_mut_slice()[index] = value);
        Ok(())
    }

    /// Host-resident values in row-major order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.read_host(|host| host.as_slice().to_vec())
    }

    /// One line per row, each value followed by a space.
    pub fn to_display_string(&self) -> String {
        let data = self.to_vec();
        let mut out = String::new();
        if self.cols > 0 {
            for row in data.chunks_exact(self.cols) {
                for value in row {
                    out.push_str(&value.to_string());
                    out.push(' ');
                }
                out.push('\n');
            }
        } else {
            for _ in 0..self.rows {
                out.push('\n');
            }
        }
        out
    }

    /// Creates a device mirror in `bank` (or the context's default bank) and
    /// enqueues the host→device migration.
    ///
    /// Any previous binding is replaced; commands already enqueued against it
    /// keep their own reference and still run.
    pub fn bind_to_device(
        &mut self,
        context: &ExecutionContext,
        bank: Option<MemoryBank>,
    ) -> PipelineResult<Event> {
        let required = context.required_alignment();
        let (satisfied, alignment) =
            self.read_host(|host| (host.satisfies_alignment(required), host.alignment()));
        if !satisfied {
            return Err(PipelineError::Misaligned {
                alignment,
                required,
            });
        }

        let bank = bank.unwrap_or_else(|| context.default_bank());
        let buffer = context.device().allocate(self.len(), bank)?;

        let host = Arc::clone(&self.host);
        let target = buffer.clone();
        let wait_on: Vec<Event> = self.pending_readback.iter().cloned().collect();
        let event = context.enqueue_migration(
            "migrate host->device",
            &wait_on,
            Box::new(move || {
                let staged = host
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_slice()
                    .to_vec();
                target.write(|device| device.copy_from_slice(&staged));
                Ok(())
            }),
        )?;

        self.binding = DeviceBinding::Bound {
            buffer,
            ready: event.clone(),
        };
        Ok(event)
    }

    /// Drops the device mirror. Host memory is untouched.
    pub fn release_device_binding(&mut self) {
        self.binding = DeviceBinding::Unbound;
    }

    pub fn is_on_device(&self) -> bool {
        matches!(self.binding, DeviceBinding::Bound { .. })
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn device_handle(&self) -> PipelineResult<&DeviceBuffer> {
        match &self.binding {
            DeviceBinding::Bound { buffer, .. } => Ok(buffer),
            DeviceBinding::Unbound => Err(self.not_on_device()),
        }
    }

    /// Token of the last command that wrote the device copy.
    pub fn ready_event(&self) -> PipelineResult<&Event> {
        match &self.binding {
            DeviceBinding::Bound { ready, .. } => Ok(ready),
            DeviceBinding::Unbound => Err(self.not_on_device()),
        }
    }

    pub(crate) fn mark_written(&mut self, event: Event) {
        if let DeviceBinding::Bound { ready, .. } = &mut self.binding {
            *ready = event;
        }
    }

    /// Enqueues the device→host copy once the device copy is up to date.
    pub fn copy_to_host(&mut self, context: &ExecutionContext) -> PipelineResult<Event> {
        self.copy_to_host_after(context, &[])
    }

    /// Like [`copy_to_host`](Self::copy_to_host), additionally waiting on `wait_on`.
    pub fn copy_to_host_after(
        &mut self,
        context: &ExecutionContext,
        wait_on: &[Event],
    ) -> PipelineResult<Event> {
        let DeviceBinding::Bound { buffer, ready } = &self.binding else {
            return Err(self.not_on_device());
        };

        let mut deps: Vec<Event> = wait_on.to_vec();
        deps.push(ready.clone());
        deps.extend(self.pending_readback.iter().cloned());

        let host = Arc::clone(&self.host);
        let source = buffer.clone();
        let event = context.enqueue_migration(
            "migrate device->host",
            &deps,
            Box::new(move || {
                let staged = source.snapshot();
                host.write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_mut_slice()
                    .copy_from_slice(&staged);
                Ok(())
            }),
        )?;
        self.pending_readback = Some(event.clone());
        Ok(event)
    }

    fn flat_index(&self, row: usize, col: usize) -> PipelineResult<usize> {
        if row >= self.rows || col >= self.cols {
            return Err(PipelineError::IndexOutOfBounds {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(row * self.cols + col)
    }

    fn not_on_device(&self) -> PipelineError {
        PipelineError::NotOnDevice {
            rows: self.rows,
            cols: self.cols,
        }
    }

    fn read_host<R>(&self, f: impl FnOnce(&AlignedHostBuffer) -> R) -> R {
        let guard = self.host.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write_host<R>(&self, f: impl FnOnce(&mut AlignedHostBuffer) -> R) -> R {
        let mut guard = self.host.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

fn check_alignment(alignment: usize) -> PipelineResult<()> {
    if !alignment.is_power_of_two() || alignment < std::mem::align_of::<f32>() {
        return Err(PipelineError::Config {
            message: format!("alignment {alignment} must be a power of two of at least 4"),
        });
    }
    Ok(())
}

impl fmt::Display for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("binding", &self.binding)
            .finish()
    }
}
