use crate::data::{BusId, GpuSnapshot, ProcessEntry};
use crate::process;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("NVMLError: {0}")]
    Nvml(#[from] NvmlError),
    #[error("GPU {0} not found by NVML")]
    DeviceNotFound(BusId),
    #[error("Nouveau is not supported. Please install NVIDIA proprietary driver!")]
    Nouveau,
    #[error("Failed to read {path}: {source}")]
    Modules {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Sampler failed: {0}")]
    Failed(String),
}

/// Source of GPU telemetry for one bus id.
///
/// `Ok(None)` means the device is powered but its driver stack is not loaded
/// yet; the caller decides whether that is still expected.
pub trait DeviceSampler: Send + Sync {
    fn sample(&self, bus_id: &BusId) -> Result<Option<GpuSnapshot>, SamplerError>;
}

pub struct NvmlSampler {
    modules_path: PathBuf,
    device_node: PathBuf,
}

impl NvmlSampler {
    pub fn new(modules_path: impl Into<PathBuf>, device_node: impl Into<PathBuf>) -> Self {
        Self {
            modules_path: modules_path.into(),
            device_node: device_node.into(),
        }
    }

    fn collect(&self, nvml: &Nvml, bus_id: &BusId) -> Result<GpuSnapshot, SamplerError> {
        let device = match nvml.device_by_pci_bus_id(bus_id.as_str()) {
            Ok(device) => device,
            Err(NvmlError::NotFound) => return Err(SamplerError::DeviceNotFound(bus_id.clone())),
            Err(e) => return Err(e.into()),
        };

        let (util, mem, temp) = (
            device.utilization_rates()?,
            device.memory_info()?,
            device.temperature(TemperatureSensor::Gpu)?,
        );

        let power_draw = device.power_usage()? as f64 / 1000.0;
        let power_limit = device
            .enforced_power_limit()
            .map(|limit| limit as f64 / 1000.0)
            .unwrap_or(0.0);

        // compute and graphics lists overlap for C+G processes
        let mut processes: Vec<ProcessEntry> = Vec::new();
        let reported = device
            .running_compute_processes()?
            .into_iter()
            .chain(device.running_graphics_processes()?);
        for proc in reported {
            if processes.iter().any(|p| p.pid == proc.pid) {
                continue;
            }
            let memory_used = match proc.used_gpu_memory {
                UsedGpuMemory::Used(v) => Some(v),
                UsedGpuMemory::Unavailable => None,
            };
            processes.extend(identify(proc.pid, memory_used));
        }

        // NVML does not list every process holding the device open
        for pid in process::device_holders(&self.device_node) {
            if processes.iter().any(|p| p.pid == pid) {
                continue;
            }
            processes.extend(identify(pid, None));
        }

        Ok(GpuSnapshot {
            temperature: temp,
            power_draw,
            power_limit,
            memory_used: Some(mem.used),
            memory_total: Some(mem.total),
            utilization: util.gpu,
            modules: Vec::new(),
            processes,
        })
    }
}

impl DeviceSampler for NvmlSampler {
    fn sample(&self, bus_id: &BusId) -> Result<Option<GpuSnapshot>, SamplerError> {
        let modules = read_modules(&self.modules_path)?;

        // NVML is opened per poll: the driver may appear between two ticks
        let nvml = match Nvml::init() {
            Ok(nvml) => nvml,
            Err(NvmlError::DriverNotLoaded) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match self.collect(&nvml, bus_id) {
            Ok(mut snapshot) => {
                snapshot.modules = modules;
                Ok(Some(snapshot))
            }
            Err(SamplerError::Nvml(NvmlError::DriverNotLoaded)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// Processes that exited since NVML listed them have no command line left
fn identify(pid: u32, memory_used: Option<u64>) -> Option<ProcessEntry> {
    match process::cmdline(pid) {
        Some(cmdline) => Some(ProcessEntry {
            pid,
            cmdline,
            memory_used,
        }),
        None => {
            log::debug!("Process {} exited during sampling", pid);
            None
        }
    }
}

fn read_modules(path: &std::path::Path) -> Result<Vec<String>, SamplerError> {
    let contents = fs::read_to_string(path).map_err(|source| SamplerError::Modules {
        path: path.to_path_buf(),
        source,
    })?;
    parse_modules(&contents)
}

// Loaded NVIDIA kernel modules in /proc/modules order
fn parse_modules(contents: &str) -> Result<Vec<String>, SamplerError> {
    let mut modules = Vec::new();
    for line in contents.lines() {
        if line.starts_with("nvidia") {
            if let Some(name) = line.split(' ').next() {
                modules.push(name.to_string());
            }
        } else if line.starts_with("nouveau") {
            return Err(SamplerError::Nouveau);
        }
    }
    Ok(modules)
}
