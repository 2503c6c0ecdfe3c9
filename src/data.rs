use std::fmt;

// PCI location of the monitored GPU, e.g. "0000:01:00.0"
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BusId(String);

impl BusId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// One successful poll of the device. Never kept across ticks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpuSnapshot {
    pub temperature: u32,
    pub power_draw: f64,
    pub power_limit: f64,
    pub memory_used: Option<u64>,
    pub memory_total: Option<u64>,
    pub utilization: u32,
    pub modules: Vec<String>,
    pub processes: Vec<ProcessEntry>,
}

// Process holding the GPU, as reported by the sampler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub cmdline: String,
    pub memory_used: Option<u64>,
}

// Row of the displayed process table; `selected` is owned by the user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplayRow {
    pub pid: u32,
    pub memory: String,
    pub cmdline: String,
    pub selected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Polling,
    Degraded,
    Stopped,
}
