use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Settings;
use crate::connection::PortMap;
use crate::image::ImageReference;

/// Where the connection file appears inside the container.
pub const CONTAINER_CONNECTION_SPEC_PATH: &str = "/kernel-connection-spec.json";

/// Reserved name for passing the connection file path through the
/// environment. Kernels currently receive the path as a command-line flag
/// value and nothing sets this variable.
#[allow(dead_code)]
pub const CONTAINER_CONNECTION_SPEC_ENV_VAR: &str = "DOCKERNEL_CONNECTION_FILE";

/// Where the host working directory appears inside the container.
pub const CONTAINER_WORKING_DIR: &str = "/working_dir";

/// Everything the engine needs for one kernel container run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub image: String,
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub mounts: Vec<Mount>,
    pub ports: PortMap,
    pub device_requests: Vec<DeviceRequest>,
    pub privileged: bool,
    pub ipc_host: bool,
    pub network_mode: String,
    pub auto_remove: bool,
    pub detach: bool,
}

/// Bind mount of a host path into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceCount {
    All,
    Exactly(u32),
}

/// Request for accelerator devices carrying a capability tag (e.g. `gpu`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRequest {
    pub count: DeviceCount,
    pub capabilities: Vec<String>,
}

impl DeviceRequest {
    pub fn new(count: DeviceCount, capability: impl Into<String>) -> Self {
        Self {
            count,
            capabilities: vec![capability.into()],
        }
    }

    pub fn all(capability: impl Into<String>) -> Self {
        Self::new(DeviceCount::All, capability)
    }
}

/// Assemble the launch parameters for a kernel container.
///
/// `connection_file` must already be absolute; it and `working_dir` are bound
/// read-write since some kernels open the connection file for writing.
pub fn build_launch_config(
    image: &ImageReference,
    connection_file: &Path,
    working_dir: &Path,
    ports: PortMap,
    device_requests: Vec<DeviceRequest>,
    settings: &Settings,
) -> LaunchConfig {
    let mut command = settings.kernel_command.clone();
    command.push(CONTAINER_CONNECTION_SPEC_PATH.to_string());

    LaunchConfig {
        image: image.to_string(),
        command,
        workdir: PathBuf::from(CONTAINER_WORKING_DIR),
        mounts: vec![
            Mount {
                source: working_dir.to_path_buf(),
                target: PathBuf::from(CONTAINER_WORKING_DIR),
                read_only: false,
            },
            Mount {
                source: connection_file.to_path_buf(),
                target: PathBuf::from(CONTAINER_CONNECTION_SPEC_PATH),
                read_only: false,
            },
        ],
        ports,
        device_requests,
        privileged: settings.privileged,
        ipc_host: settings.ipc_host,
        network_mode: settings.network_mode.clone(),
        auto_remove: settings.auto_remove,
        detach: settings.detach,
    }
}
