use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::connection::BIND_ALL_IP;
use crate::launch::DeviceCount;

/// Launcher settings after applying file and env overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Docker-compatible CLI used to pull and run.
    pub runtime: String,
    /// Address written into the connection file's `ip` field.
    pub bind_ip: IpAddr,
    pub privileged: bool,
    /// Share the host IPC namespace with the kernel.
    pub ipc_host: bool,
    pub network_mode: String,
    /// Capability tags of accelerator devices to request. Empty requests none.
    pub device_capabilities: Vec<String>,
    /// How many devices of each capability to request.
    pub device_count: DeviceCount,
    /// Kernel command prefix; the in-container connection file path is appended.
    pub kernel_command: Vec<String>,
    pub auto_remove: bool,
    pub detach: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            bind_ip: BIND_ALL_IP,
            privileged: true,
            ipc_host: true,
            network_mode: "bridge".to_string(),
            device_capabilities: vec!["gpu".to_string()],
            device_count: DeviceCount::All,
            kernel_command: ["python", "-m", "ipykernel_launcher", "-f"]
                .iter()
                .map(|word| word.to_string())
                .collect(),
            auto_remove: true,
            detach: false,
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

const CONFIG_NAMES: [&str; 2] = [".dockernel", "dockernel.conf"];
const ENV_SET_PREFIX: &str = "DOCKERNEL_OPT_SET_";
const ENV_ADD_PREFIX: &str = "DOCKERNEL_OPT_ADD_";
const ENV_DEL_PREFIX: &str = "DOCKERNEL_OPT_DEL_";

const KNOWN_KEYS: [&str; 10] = [
    "runtime",
    "bind_ip",
    "privileged",
    "ipc_host",
    "network_mode",
    "device_capabilities",
    "device_count",
    "kernel_command",
    "auto_remove",
    "detach",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EnvOpt {
    Set,
    Add,
    Del,
}

/// Load settings from `explicit` or the first config file found walking up
/// from `start_dir`, then apply `DOCKERNEL_OPT_*` overrides.
pub fn load(start_dir: &Path, explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let config_path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => discover_config(start_dir),
    };

    let mut params = match &config_path {
        Some(path) => {
            log::debug!("loading config from {}", path.display());
            parse_config(path)?
        }
        None => HashMap::new(),
    };

    apply_env_overrides(&mut params, env::vars())?;
    settings_from_params(&params)
}

fn discover_config(start_dir: &Path) -> Option<PathBuf> {
    let start = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());

    for dir in start.ancestors() {
        for name in CONFIG_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

fn parse_config(config_path: &Path) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let content = std::fs::read_to_string(config_path).map_err(|err| {
        ConfigError::new(format!(
            "failed to read config file {}: {err}",
            config_path.display()
        ))
    })?;

    let mut params = HashMap::new();
    for (idx, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts = shell_words::split(line).map_err(|err| {
            ConfigError::new(format!("failed to parse config line {}: {err}", idx + 1))
        })?;

        let Some((key, values)) = parts.split_first() else {
            continue;
        };
        if !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::new(format!(
                "unknown config key {key:?} on line {}",
                idx + 1
            )));
        }
        params.insert(key.clone(), values.to_vec());
    }

    Ok(params)
}

fn apply_env_overrides(
    params: &mut HashMap<String, Vec<String>>,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Result<(), ConfigError> {
    for (var, value) in vars {
        let Some((op, key)) = override_target(&var) else {
            continue;
        };
        if !KNOWN_KEYS.contains(&key) {
            log::warn!("ignoring {var}: unknown config key {key:?}");
            continue;
        }

        if op == EnvOpt::Del {
            params.remove(key);
            continue;
        }
        let words = shell_words::split(&value).map_err(|err| {
            ConfigError::new(format!("failed to parse env override {var}: {err}"))
        })?;
        let entry = params.entry(key.to_string()).or_default();
        if op == EnvOpt::Set {
            entry.clear();
        }
        entry.extend(words);
    }
    Ok(())
}

/// Split `DOCKERNEL_OPT_<OP>_<key>` into its operation and config key.
fn override_target(var: &str) -> Option<(EnvOpt, &str)> {
    [
        (ENV_SET_PREFIX, EnvOpt::Set),
        (ENV_ADD_PREFIX, EnvOpt::Add),
        (ENV_DEL_PREFIX, EnvOpt::Del),
    ]
    .into_iter()
    .find_map(|(prefix, op)| var.strip_prefix(prefix).map(|key| (op, key)))
}

fn settings_from_params(params: &HashMap<String, Vec<String>>) -> Result<Settings, ConfigError> {
    let mut settings = Settings::default();

    if let Some(runtime) = single_value(params, "runtime")? {
        settings.runtime = runtime;
    }
    if let Some(ip) = single_value(params, "bind_ip")? {
        settings.bind_ip = ip
            .parse()
            .map_err(|err| ConfigError::new(format!("invalid bind_ip {ip:?}: {err}")))?;
    }
    if let Some(flag) = bool_value(params, "privileged")? {
        settings.privileged = flag;
    }
    if let Some(flag) = bool_value(params, "ipc_host")? {
        settings.ipc_host = flag;
    }
    if let Some(mode) = single_value(params, "network_mode")? {
        settings.network_mode = mode;
    }
    if let Some(caps) = params.get("device_capabilities") {
        settings.device_capabilities = caps.clone();
    }
    if let Some(count) = single_value(params, "device_count")? {
        settings.device_count = match count.as_str() {
            "all" => DeviceCount::All,
            other => other.parse().map(DeviceCount::Exactly).map_err(|_| {
                ConfigError::new(format!("device_count expects \"all\" or a number, got {other:?}"))
            })?,
        };
    }
    if let Some(command) = params.get("kernel_command") {
        if command.is_empty() {
            return Err(ConfigError::new("kernel_command must not be empty"));
        }
        settings.kernel_command = command.clone();
    }
    if let Some(flag) = bool_value(params, "auto_remove")? {
        settings.auto_remove = flag;
    }
    if let Some(flag) = bool_value(params, "detach")? {
        settings.detach = flag;
    }

    if settings.bind_ip.is_loopback() {
        log::warn!(
            "bind_ip {} is loopback; the kernel will not be reachable through published ports",
            settings.bind_ip
        );
    }

    Ok(settings)
}

fn single_value(
    params: &HashMap<String, Vec<String>>,
    key: &str,
) -> Result<Option<String>, ConfigError> {
    match params.get(key).map(Vec::as_slice) {
        None => Ok(None),
        Some([value]) => Ok(Some(value.clone())),
        Some(values) => Err(ConfigError::new(format!(
            "{key} expects exactly one value, got {}",
            values.len()
        ))),
    }
}

fn bool_value(params: &HashMap<String, Vec<String>>, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = single_value(params, key)? else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(Some(true)),
        "false" | "no" | "0" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::new(format!(
            "{key} expects a boolean, got {value:?}"
        ))),
    }
}
