use crate::data::BusId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const NVIDIA_VENDOR: &str = "10de";
const DISPLAY_CLASS_PREFIX: &str = "0x03";

#[derive(Error, Debug)]
pub enum PciError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Name not found for PCI device {vendor}:{device}")]
    UnknownDevice { vendor: String, device: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PowerStateError {
    #[error("Failed to read {0}: {1}")]
    Read(PathBuf, String),
    #[error("Looks like \"{0}\" is empty")]
    Empty(PathBuf),
    #[error("Failed to parse \"{0}\"")]
    Malformed(PathBuf),
    #[error("Unknown bbswitch state \"{0}\"")]
    UnknownState(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerState {
    pub bus_id: BusId,
    pub enabled: bool,
}

/// Reads the GPU power state reported by the bbswitch module.
pub fn read_power_state(path: &Path) -> Result<PowerState, PowerStateError> {
    let contents =
        fs::read_to_string(path).map_err(|e| PowerStateError::Read(path.to_path_buf(), e.to_string()))?;
    parse_power_state(&contents, path)
}

fn parse_power_state(contents: &str, path: &Path) -> Result<PowerState, PowerStateError> {
    let line = contents
        .lines()
        .next()
        .ok_or_else(|| PowerStateError::Empty(path.to_path_buf()))?;
    let (bus_id, state) = line
        .split_once(' ')
        .ok_or_else(|| PowerStateError::Malformed(path.to_path_buf()))?;
    let enabled = match state {
        "ON" => true,
        "OFF" => false,
        other => return Err(PowerStateError::UnknownState(other.to_string())),
    };
    Ok(PowerState {
        bus_id: BusId::new(bus_id),
        enabled,
    })
}

// Vendor and device names of a GPU, from pci.ids
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GpuName {
    pub vendor: Option<String>,
    pub device: Option<String>,
}

impl GpuName {
    /// Marketing name when pci.ids has one, e.g. "GeForce GTX 1060 Mobile".
    pub fn title(&self, bus_id: &BusId) -> String {
        let bracketed = self.device.as_deref().and_then(|device| {
            let start = device.find('[')?;
            let end = device[start..].find(']')? + start;
            Some(device[start + 1..end].to_string())
        });
        match (bracketed, &self.device) {
            (Some(name), _) => name,
            (None, Some(device)) => device.clone(),
            (None, None) => format!("NVIDIA GPU on {}", bus_id),
        }
    }
}

pub struct PciDevices {
    sysfs_root: PathBuf,
    pci_ids: PathBuf,
}

impl PciDevices {
    pub fn new(sysfs_root: impl Into<PathBuf>, pci_ids: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            pci_ids: pci_ids.into(),
        }
    }

    fn read_id(&self, bus_id: &BusId, attribute: &str) -> Result<String, PciError> {
        let path = self.sysfs_root.join(bus_id.as_str()).join(attribute);
        let raw = fs::read_to_string(&path).map_err(|source| PciError::Io { path, source })?;
        Ok(raw.trim().trim_start_matches("0x").to_string())
    }

    /// Bus id of the `index`-th NVIDIA display controller, in bus order.
    pub fn resolve_bus_id(&self, index: usize) -> Option<BusId> {
        let entries = match fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot list {}: {}", self.sysfs_root.display(), e);
                return None;
            }
        };

        let mut candidates: Vec<BusId> = entries
            .filter_map(Result::ok)
            .map(|entry| BusId::new(entry.file_name().to_string_lossy()))
            .filter(|bus_id| {
                let vendor = self.read_id(bus_id, "vendor").ok();
                let class = fs::read_to_string(self.sysfs_root.join(bus_id.as_str()).join("class"));
                vendor.as_deref() == Some(NVIDIA_VENDOR)
                    && class.is_ok_and(|class| class.trim().starts_with(DISPLAY_CLASS_PREFIX))
            })
            .collect();
        candidates.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        candidates.into_iter().nth(index)
    }

    pub fn device_name(&self, bus_id: &BusId) -> Result<GpuName, PciError> {
        let vendor = self.read_id(bus_id, "vendor")?;
        let device = self.read_id(bus_id, "device")?;
        let contents = fs::read_to_string(&self.pci_ids).map_err(|source| PciError::Io {
            path: self.pci_ids.clone(),
            source,
        })?;
        lookup_pci_ids(&contents, &vendor, &device).ok_or(PciError::UnknownDevice { vendor, device })
    }

    /// Name of the GPU, empty when it cannot be looked up.
    pub fn gpu_name(&self, bus_id: &BusId) -> GpuName {
        self.device_name(bus_id).unwrap_or_else(|e| {
            log::warn!("{}", e);
            GpuName::default()
        })
    }
}

// pci.ids: "vvvv  Vendor" lines, "\tdddd  Device" below them, "\t\t" subsystems
fn lookup_pci_ids(contents: &str, vendor: &str, device: &str) -> Option<GpuName> {
    let mut vendor_name: Option<&str> = None;
    for line in contents.lines() {
        if line.starts_with('#') || line.starts_with("\t\t") || line.trim().is_empty() {
            continue;
        }
        if let Some(entry) = line.strip_prefix('\t') {
            if vendor_name.is_none() {
                continue;
            }
            let (id, name) = entry.split_once(char::is_whitespace)?;
            if id.eq_ignore_ascii_case(device) {
                return Some(GpuName {
                    vendor: vendor_name.map(str::to_string),
                    device: Some(name.trim().to_string()),
                });
            }
        } else {
            if vendor_name.is_some() {
                break;
            }
            let (id, name) = line.split_once(char::is_whitespace)?;
            if id.eq_ignore_ascii_case(vendor) {
                vendor_name = Some(name.trim());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PCI_IDS: &str = "\
# List of PCI ID's
1002  Advanced Micro Devices, Inc. [AMD/ATI]
\t67df  Ellesmere [Radeon RX 470/480/570/570X/580/580X/590]
10de  NVIDIA Corporation
\t1c20  GP106M [GeForce GTX 1060 Mobile]
\t\t1028 0819  GeForce GTX 1060 Mobile
\t1f91  TU117M [GeForce GTX 1650 Mobile / Max-Q]
\t25a2  GA107M
8086  Intel Corporation
\t1c20  6 Series/C200 Series Chipset Family High Definition Audio Controller
";

    fn sysfs_device(root: &Path, bus: &str, vendor: &str, device: &str, class: &str) {
        let dir = root.join(bus);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{vendor}\n")).unwrap();
        fs::write(dir.join("device"), format!("0x{device}\n")).unwrap();
        fs::write(dir.join("class"), format!("{class}\n")).unwrap();
    }

    #[test]
    fn parses_bbswitch_state() {
        let path = Path::new("/proc/acpi/bbswitch");
        assert_eq!(
            parse_power_state("0000:01:00.0 ON\n", path),
            Ok(PowerState {
                bus_id: BusId::new("0000:01:00.0"),
                enabled: true
            })
        );
        assert!(!parse_power_state("0000:01:00.0 OFF", path).unwrap().enabled);
    }

    #[test]
    fn rejects_broken_bbswitch_state() {
        let path = Path::new("/proc/acpi/bbswitch");
        assert_eq!(parse_power_state("", path), Err(PowerStateError::Empty(path.into())));
        assert_eq!(
            parse_power_state("0000:01:00.0", path),
            Err(PowerStateError::Malformed(path.into()))
        );
        assert_eq!(
            parse_power_state("0000:01:00.0 MAYBE", path),
            Err(PowerStateError::UnknownState("MAYBE".into()))
        );
    }

    #[test]
    fn reads_bbswitch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbswitch");
        assert!(matches!(read_power_state(&path), Err(PowerStateError::Read(..))));

        fs::write(&path, "0000:02:00.0 ON\n").unwrap();
        assert_eq!(read_power_state(&path).unwrap().bus_id.as_str(), "0000:02:00.0");
    }

    #[test]
    fn looks_up_names_under_the_right_vendor() {
        let name = lookup_pci_ids(PCI_IDS, "10de", "1c20").unwrap();
        assert_eq!(name.vendor.as_deref(), Some("NVIDIA Corporation"));
        assert_eq!(name.device.as_deref(), Some("GP106M [GeForce GTX 1060 Mobile]"));

        let intel = lookup_pci_ids(PCI_IDS, "8086", "1c20").unwrap();
        assert_eq!(intel.vendor.as_deref(), Some("Intel Corporation"));

        assert_eq!(lookup_pci_ids(PCI_IDS, "10de", "ffff"), None);
        assert_eq!(lookup_pci_ids(PCI_IDS, "abcd", "1c20"), None);
    }

    #[test]
    fn title_prefers_the_bracketed_name() {
        let bus = BusId::new("0000:01:00.0");
        let name = |device: Option<&str>| GpuName {
            vendor: Some("NVIDIA Corporation".into()),
            device: device.map(str::to_string),
        };
        assert_eq!(name(Some("GP106M [GeForce GTX 1060 Mobile]")).title(&bus), "GeForce GTX 1060 Mobile");
        assert_eq!(name(Some("GA107M")).title(&bus), "GA107M");
        assert_eq!(name(None).title(&bus), "NVIDIA GPU on 0000:01:00.0");
    }

    #[test]
    fn resolves_nvidia_display_controllers_in_bus_order() {
        let root = tempfile::tempdir().unwrap();
        sysfs_device(root.path(), "0000:00:02.0", "8086", "3e9b", "0x030000");
        sysfs_device(root.path(), "0000:02:00.0", "10de", "1f91", "0x030200");
        sysfs_device(root.path(), "0000:01:00.1", "10de", "10f1", "0x040300");
        sysfs_device(root.path(), "0000:01:00.0", "10de", "1c20", "0x030000");

        let pci = PciDevices::new(root.path(), root.path().join("pci.ids"));
        assert_eq!(pci.resolve_bus_id(0), Some(BusId::new("0000:01:00.0")));
        assert_eq!(pci.resolve_bus_id(1), Some(BusId::new("0000:02:00.0")));
        assert_eq!(pci.resolve_bus_id(2), None);
    }

    #[test]
    fn names_gpu_from_sysfs_ids() {
        let root = tempfile::tempdir().unwrap();
        sysfs_device(root.path(), "0000:01:00.0", "10de", "1c20", "0x030000");
        let ids = root.path().join("pci.ids");
        fs::write(&ids, PCI_IDS).unwrap();

        let pci = PciDevices::new(root.path(), &ids);
        let bus = BusId::new("0000:01:00.0");
        let name = pci.gpu_name(&bus);
        assert_eq!(name.vendor.as_deref(), Some("NVIDIA Corporation"));
        assert_eq!(name.title(&bus), "GeForce GTX 1060 Mobile");

        let missing = BusId::new("0000:09:00.0");
        assert!(matches!(pci.device_name(&missing), Err(PciError::Io { .. })));
        assert_eq!(pci.gpu_name(&missing).title(&missing), "NVIDIA GPU on 0000:09:00.0");
    }
}
