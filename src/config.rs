//! Execution context configuration.

use std::path::Path;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::device::MemoryBank;
use crate::errors::{PipelineError, PipelineResult};

/// Page granularity required for zero-copy DMA on the reference accelerator.
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Settings used when an [`ExecutionContext`](crate::ExecutionContext) is created.
///
/// Every field is optional in the JSON form; missing fields fall back to the
/// defaults described on each accessor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compute_units: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alignment: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_bank: Option<MemoryBank>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| PipelineError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = Some(compute_units);
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn with_default_bank(mut self, bank: MemoryBank) -> Self {
        self.default_bank = Some(bank);
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Number of queue workers; defaults to the host's available parallelism.
    pub fn get_compute_units(&self) -> usize {
        self.compute_units.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// DMA alignment in bytes; defaults to [`DEFAULT_ALIGNMENT`].
    pub fn get_alignment(&self) -> usize {
        self.alignment.unwrap_or(DEFAULT_ALIGNMENT)
    }

    pub fn get_default_bank(&self) -> MemoryBank {
        self.default_bank.unwrap_or_default()
    }

    pub fn get_device_name(&self) -> &str {
        self.device_name.as_deref().unwrap_or("host-emulated accelerator")
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.get_compute_units() == 0 {
            return Err(PipelineError::Config {
                message: "compute_units must be at least 1".to_string(),
            });
        }
        let alignment = self.get_alignment();
        if !alignment.is_power_of_two() || alignment < std::mem::align_of::<f32>() {
            return Err(PipelineError::Config {
                message: format!("alignment {alignment} must be a power of two of at least 4"),
            });
        }
        Ok(())
    }
}
