//! GPU telemetry collaborator.
//!
//! The daemon only needs two queries: how many devices exist and which
//! compute processes are resident on one device. The trait keeps the NVML
//! dependency out of the attribution and enforcement logic.

use std::collections::HashMap;

use api_types::GpuProcess;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tracing::warn;

use crate::error::Result;
use crate::error::WardenError;

pub trait GpuTelemetry: Send + Sync {
    fn device_count(&self) -> Result<u32>;

    /// Compute processes resident on one device. An out-of-range index is
    /// `InvalidInput`.
    fn list_compute_processes(&self, gpu_id: u32) -> Result<Vec<GpuProcess>>;
}

/// Query every requested device. A per-device `InvalidInput` is logged and
/// skipped so one bad index cannot abort the batch; any other telemetry
/// failure propagates.
pub fn list_processes(
    telemetry: &dyn GpuTelemetry,
    gpu_ids: &[u32],
) -> Result<HashMap<u32, Vec<GpuProcess>>> {
    let mut processes = HashMap::new();
    for &gpu_id in gpu_ids {
        match telemetry.list_compute_processes(gpu_id) {
            Ok(list) => {
                processes.insert(gpu_id, list);
            }
            Err(WardenError::InvalidInput(message)) => {
                warn!(gpu_id, %message, "skipping invalid GPU index");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(processes)
}

/// NVML-backed telemetry.
pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self> {
        Ok(Self { nvml: Nvml::init()? })
    }
}

impl GpuTelemetry for NvmlTelemetry {
    fn device_count(&self) -> Result<u32> {
        Ok(self.nvml.device_count()?)
    }

    fn list_compute_processes(&self, gpu_id: u32) -> Result<Vec<GpuProcess>> {
        let device = match self.nvml.device_by_index(gpu_id) {
            Ok(device) => device,
            Err(NvmlError::InvalidArg) => {
                return Err(WardenError::InvalidInput(format!(
                    "GPU id {gpu_id} is invalid"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let processes = device
            .running_compute_processes()?
            .into_iter()
            .map(|info| GpuProcess {
                pid: info.pid,
                gpu_memory_used: match info.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect();
        Ok(processes)
    }
}
