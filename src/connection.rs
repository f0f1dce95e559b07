use std::collections::BTreeMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::LaunchFailure;

/// Default bind-all address written into the connection file.
pub const BIND_ALL_IP: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Container port to host port. Always the identity over the spec's ports.
pub type PortMap = BTreeMap<u16, u16>;

/// Kernel connection file contents (transport, ip, ports, key, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    path: PathBuf,
    fields: Map<String, Value>,
}

impl ConnectionSpec {
    pub fn load(path: &Path) -> Result<Self, LaunchFailure> {
        let content = std::fs::read_to_string(path).map_err(|source| LaunchFailure::SpecRead {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value =
            serde_json::from_str(&content).map_err(|err| LaunchFailure::SpecParse {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        let Value::Object(fields) = value else {
            return Err(LaunchFailure::SpecParse {
                path: path.to_path_buf(),
                reason: "expected a JSON object".to_string(),
            });
        };
        Ok(Self {
            path: path.to_path_buf(),
            fields,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_ip(&mut self, ip: IpAddr) {
        self.fields
            .insert("ip".to_string(), Value::String(ip.to_string()));
    }

    /// Write the spec back to its file through a sibling temp file and rename,
    /// so readers never see a partial document. Symlinks are followed so the
    /// link target receives the new content.
    pub fn persist(&self) -> Result<(), LaunchFailure> {
        let write_err = |source| LaunchFailure::SpecWrite {
            path: self.path.clone(),
            source,
        };

        let body = serde_json::to_vec(&self.fields)
            .map_err(|err| write_err(std::io::Error::other(err)))?;
        let target = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        if let Ok(meta) = std::fs::metadata(&target) {
            tmp.as_file()
                .set_permissions(meta.permissions())
                .map_err(write_err)?;
        }
        tmp.write_all(&body).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&target).map_err(|err| write_err(err.error))?;
        Ok(())
    }

    /// Identity port map over every `*_port` key (`shell_port`, `hb_port`, ...).
    /// Keys like `transport` only contain the letters and are skipped.
    pub fn port_map(&self) -> Result<PortMap, LaunchFailure> {
        let mut ports = PortMap::new();
        for (key, value) in &self.fields {
            if !key.contains("_port") {
                continue;
            }
            let port = value
                .as_u64()
                .and_then(|raw| u16::try_from(raw).ok())
                .filter(|port| *port != 0)
                .ok_or_else(|| LaunchFailure::SpecParse {
                    path: self.path.clone(),
                    reason: format!("{key} is not a valid TCP port: {value}"),
                })?;
            ports.insert(port, port);
        }
        Ok(ports)
    }
}

/// Load the connection file, force its bind address to `ip`, write it back
/// and derive the port exposure map.
pub fn prepare(path: &Path, ip: IpAddr) -> Result<(ConnectionSpec, PortMap), LaunchFailure> {
    let mut spec = ConnectionSpec::load(path)?;
    if let Some(prior) = spec.fields.get("ip") {
        log::debug!("replacing connection ip {prior} with {ip}");
    }
    spec.set_ip(ip);
    spec.persist()?;
    let ports = spec.port_map()?;
    log::info!(
        "connection file {} rewritten, {} port(s) to publish",
        path.display(),
        ports.len()
    );
    Ok((spec, ports))
}
