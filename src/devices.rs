use std::path::{Path, PathBuf};

use crate::launch::{DeviceCount, DeviceRequest};

/// Answers whether the host has devices for a capability tag.
pub trait DeviceProbe {
    fn available(&self, capability: &str) -> bool;
}

/// Looks for NVIDIA device nodes under `/dev` and `/proc`.
#[derive(Debug, Clone)]
pub struct HostDeviceProbe {
    dev_dir: PathBuf,
    driver_dir: PathBuf,
}

impl Default for HostDeviceProbe {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            driver_dir: PathBuf::from("/proc/driver/nvidia/gpus"),
        }
    }
}

impl HostDeviceProbe {
    #[cfg(test)]
    fn rooted(dev_dir: &Path, driver_dir: &Path) -> Self {
        Self {
            dev_dir: dev_dir.to_path_buf(),
            driver_dir: driver_dir.to_path_buf(),
        }
    }

    fn has_gpu(&self) -> bool {
        has_entries(&self.driver_dir) || has_nvidia_node(&self.dev_dir)
    }
}

impl DeviceProbe for HostDeviceProbe {
    fn available(&self, capability: &str) -> bool {
        match capability {
            "gpu" => self.has_gpu(),
            // Left for the engine to resolve.
            _ => true,
        }
    }
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn has_nvidia_node(dev_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dev_dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        name.strip_prefix("nvidia")
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()))
    })
}

/// One request per capability the host can satisfy. Missing devices are
/// skipped rather than failing the launch.
pub fn attachable<P: DeviceProbe + ?Sized>(
    probe: &P,
    capabilities: &[String],
    count: DeviceCount,
) -> Vec<DeviceRequest> {
    let mut requests = Vec::new();
    for capability in capabilities {
        if probe.available(capability) {
            requests.push(DeviceRequest::new(count, capability.clone()));
        } else {
            log::info!("no {capability} devices found on host; attaching none");
        }
    }
    requests
}
