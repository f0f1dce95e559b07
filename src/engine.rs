use std::cell::RefCell;
use std::io::{self, Write};
use std::process::{Command, ExitStatus};

use thiserror::Error;

use crate::image::ImageReference;
use crate::launch::{DeviceCount, DeviceRequest, LaunchConfig, Mount};

/// Statuses the docker CLI reserves for its own failures, as opposed to the
/// container's exit status.
const ENGINE_FAILURE_STATUSES: [i32; 3] = [125, 126, 127];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} {action} failed (exit {status})")]
    Failed {
        program: String,
        action: &'static str,
        status: String,
    },

    #[error("failed to write dry-run output")]
    Output(#[source] io::Error),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        EngineError::Other(message.into())
    }
}

/// How a container run ended, from the launcher's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Foreground run finished with the kernel's exit status.
    Exited(i32),
    /// Foreground run ended by a signal.
    Signaled,
    /// Container left running in the background.
    Detached,
    /// Nothing was executed.
    NotRun,
}

/// Container engine operations the launcher needs.
pub trait ContainerEngine {
    /// Make `image` available locally. May block on network transfers.
    fn pull(&self, image: &ImageReference) -> Result<(), EngineError>;

    /// Create and start a container. Blocks until exit unless `detach` is set.
    fn run(&self, config: &LaunchConfig) -> Result<RunOutcome, EngineError>;
}

/// Drives a docker-compatible command line client (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct CliEngine {
    program: String,
}

impl CliEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn status(&self, action: &'static str, args: &[String]) -> Result<ExitStatus, EngineError> {
        log::debug!("running {} {}", self.program, shell_words::join(args));
        Command::new(&self.program)
            .args(args)
            .status()
            .map_err(|source| EngineError::Spawn {
                program: format!("{} {action}", self.program),
                source,
            })
    }

    fn failed(&self, action: &'static str, status: &ExitStatus) -> EngineError {
        EngineError::Failed {
            program: self.program.clone(),
            action,
            status: format_exit_status(status),
        }
    }
}

impl ContainerEngine for CliEngine {
    fn pull(&self, image: &ImageReference) -> Result<(), EngineError> {
        let status = self.status("pull", &build_pull_args(image))?;
        if status.success() {
            Ok(())
        } else {
            Err(self.failed("pull", &status))
        }
    }

    fn run(&self, config: &LaunchConfig) -> Result<RunOutcome, EngineError> {
        let status = self.status("run", &build_run_args(config))?;
        match status.code() {
            Some(code) if ENGINE_FAILURE_STATUSES.contains(&code) => {
                Err(self.failed("run", &status))
            }
            Some(0) if config.detach => Ok(RunOutcome::Detached),
            Some(code) if config.detach => Err(EngineError::new(format!(
                "{} run -d exited with status {code} before the container started",
                self.program
            ))),
            Some(code) => Ok(RunOutcome::Exited(code)),
            None => Ok(RunOutcome::Signaled),
        }
    }
}

/// Writes the engine invocations, one `++++ ` line per argument, instead of
/// executing them.
#[derive(Debug)]
pub struct DryRunEngine<W> {
    program: String,
    out: RefCell<W>,
}

impl<W: Write> DryRunEngine<W> {
    pub fn new(program: impl Into<String>, out: W) -> Self {
        Self {
            program: program.into(),
            out: RefCell::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn print(&self, args: Vec<String>) -> Result<(), EngineError> {
        let mut out = self.out.borrow_mut();
        writeln!(out, "++++ {}", self.program).map_err(EngineError::Output)?;
        for arg in args {
            writeln!(out, "++++ {arg}").map_err(EngineError::Output)?;
        }
        out.flush().map_err(EngineError::Output)
    }
}

impl<W: Write> ContainerEngine for DryRunEngine<W> {
    fn pull(&self, image: &ImageReference) -> Result<(), EngineError> {
        self.print(build_pull_args(image))
    }

    fn run(&self, config: &LaunchConfig) -> Result<RunOutcome, EngineError> {
        self.print(build_run_args(config))?;
        Ok(RunOutcome::NotRun)
    }
}

pub fn build_pull_args(image: &ImageReference) -> Vec<String> {
    vec!["pull".to_string(), image.to_string()]
}

pub fn build_run_args(config: &LaunchConfig) -> Vec<String> {
    let mut args = vec!["run".to_string()];

    if config.detach {
        args.push("-d".to_string());
    }
    if config.auto_remove {
        args.push("--rm".to_string());
    }
    if config.privileged {
        args.push("--privileged=true".to_string());
    }
    if config.ipc_host {
        args.push("--ipc=host".to_string());
    }

    for request in &config.device_requests {
        args.push("--gpus".to_string());
        args.push(device_request_to_arg(request));
    }

    args.push("--network".to_string());
    args.push(config.network_mode.clone());

    for (container_port, host_port) in &config.ports {
        args.push("-p".to_string());
        args.push(format!("{host_port}:{container_port}"));
    }

    for mount in &config.mounts {
        args.push("--mount".to_string());
        args.push(mount_to_arg(mount));
    }

    args.push("-w".to_string());
    args.push(config.workdir.to_string_lossy().into_owned());

    args.push(config.image.clone());
    args.extend(config.command.iter().cloned());

    args
}

fn device_request_to_arg(request: &DeviceRequest) -> String {
    let count = match request.count {
        DeviceCount::All => "all".to_string(),
        DeviceCount::Exactly(n) => n.to_string(),
    };
    match request.capabilities.as_slice() {
        [] => count,
        [only] if only == "gpu" => count,
        caps => format!("{count},\"capabilities={}\"", caps.join(",")),
    }
}

fn mount_to_arg(mount: &Mount) -> String {
    let mut fields = vec![
        "type=bind".to_string(),
        csv_field(&format!("source={}", mount.source.to_string_lossy())),
        csv_field(&format!("target={}", mount.target.to_string_lossy())),
    ];
    if mount.read_only {
        fields.push("readonly".to_string());
    }
    fields.join(",")
}

/// Quote a `--mount` field the way the docker CLI's CSV reader expects.
fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{ContainerEngine, DryRunEngine, RunOutcome, build_pull_args, build_run_args};
    use crate::config::Settings;
    use crate::connection::PortMap;
    use crate::image::ImageReference;
    use crate::launch::{DeviceCount, DeviceRequest, LaunchConfig, Mount, build_launch_config};

    fn base_config() -> LaunchConfig {
        LaunchConfig {
            image: "busybox".to_string(),
            command: vec!["echo".to_string(), "ok".to_string()],
            workdir: PathBuf::from("/w"),
            mounts: Vec::new(),
            ports: PortMap::new(),
            device_requests: Vec::new(),
            privileged: false,
            ipc_host: false,
            network_mode: "bridge".to_string(),
            auto_remove: false,
            detach: false,
        }
    }

    #[test]
    fn build_pull_args_uses_reference_form() {
        let image = ImageReference::parse("myimage:latest").unwrap();
        assert_eq!(build_pull_args(&image), vec!["pull", "myimage:latest"]);

        let untagged = ImageReference::parse("myimage").unwrap();
        assert_eq!(build_pull_args(&untagged), vec!["pull", "myimage"]);
    }

    #[test]
    fn build_run_args_orders_flags_and_values() {
        let image = ImageReference::parse("myimage:latest").unwrap();
        let config = build_launch_config(
            &image,
            Path::new("/home/me/.local/share/jupyter/runtime/kernel-1.json"),
            Path::new("/home/me/notebooks"),
            PortMap::from([(5002, 5002), (5001, 5001)]),
            vec![DeviceRequest::all("gpu")],
            &Settings::default(),
        );

        assert_eq!(
            build_run_args(&config),
            vec![
                "run",
                "--rm",
                "--privileged=true",
                "--ipc=host",
                "--gpus",
                "all",
                "--network",
                "bridge",
                "-p",
                "5001:5001",
                "-p",
                "5002:5002",
                "--mount",
                "type=bind,source=/home/me/notebooks,target=/working_dir",
                "--mount",
                "type=bind,source=/home/me/.local/share/jupyter/runtime/kernel-1.json,target=/kernel-connection-spec.json",
                "-w",
                "/working_dir",
                "myimage:latest",
                "python",
                "-m",
                "ipykernel_launcher",
                "-f",
                "/kernel-connection-spec.json",
            ]
        );
    }

    #[test]
    fn build_run_args_publishes_nothing_for_empty_port_map() {
        let args = build_run_args(&base_config());
        assert_eq!(
            args,
            vec!["run", "--network", "bridge", "-w", "/w", "busybox", "echo", "ok"]
        );
        assert!(!args.iter().any(|arg| arg == "-p"));
    }

    #[test]
    fn build_run_args_detached_and_read_only_mount() {
        let mut config = base_config();
        config.detach = true;
        config.mounts = vec![Mount {
            source: PathBuf::from("/data"),
            target: PathBuf::from("/data"),
            read_only: true,
        }];

        let args = build_run_args(&config);

        assert_eq!(args[1], "-d");
        assert!(args.contains(&"type=bind,source=/data,target=/data,readonly".to_string()));
    }

    #[test]
    fn build_run_args_quotes_mount_paths_with_commas() {
        let mut config = base_config();
        config.mounts = vec![Mount {
            source: PathBuf::from("/home/me/a,b"),
            target: PathBuf::from("/working_dir"),
            read_only: false,
        }];

        let args = build_run_args(&config);

        assert!(args.contains(&"type=bind,\"source=/home/me/a,b\",target=/working_dir".to_string()));
    }

    #[test]
    fn build_run_args_renders_device_counts_and_capabilities() {
        let mut config = base_config();
        config.device_requests = vec![
            DeviceRequest {
                count: DeviceCount::Exactly(2),
                capabilities: vec!["gpu".to_string()],
            },
            DeviceRequest {
                count: DeviceCount::All,
                capabilities: vec!["compute".to_string(), "utility".to_string()],
            },
        ];

        let args = build_run_args(&config);

        assert_eq!(
            &args[1..5],
            &["--gpus", "2", "--gpus", "all,\"capabilities=compute,utility\""]
        );
    }

    #[test]
    fn dry_run_writes_prefixed_argv() {
        let engine = DryRunEngine::new("podman", Vec::new());
        let image = ImageReference::parse("myimage").unwrap();

        engine.pull(&image).unwrap();
        let outcome = engine.run(&base_config()).unwrap();

        assert_eq!(outcome, RunOutcome::NotRun);
        let printed = String::from_utf8(engine.into_inner()).unwrap();
        assert_eq!(
            printed,
            "++++ podman\n++++ pull\n++++ myimage\n\
             ++++ podman\n++++ run\n++++ --network\n++++ bridge\n++++ -w\n++++ /w\n\
             ++++ busybox\n++++ echo\n++++ ok\n"
        );
    }

    #[cfg(unix)]
    mod cli_engine {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        use tempfile::TempDir;

        use super::base_config;
        use crate::engine::{CliEngine, ContainerEngine, EngineError, RunOutcome};
        use crate::image::ImageReference;

        /// Stand-in engine binary: records its argv and runs `body`.
        fn fake_engine(dir: &TempDir, body: &str) -> (CliEngine, PathBuf) {
            let argv_log = dir.path().join("argv");
            let script = dir.path().join("fake-docker");
            fs::write(
                &script,
                format!(
                    "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n{body}\n",
                    argv_log.display()
                ),
            )
            .unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            (CliEngine::new(script.to_string_lossy()), argv_log)
        }

        fn recorded(argv_log: &Path) -> Vec<String> {
            fs::read_to_string(argv_log)
                .unwrap()
                .lines()
                .map(|line| line.to_string())
                .collect()
        }

        #[test]
        fn run_reports_kernel_exit_status() {
            let dir = TempDir::new().unwrap();
            let (engine, argv_log) = fake_engine(&dir, "exit 0");
            assert_eq!(engine.run(&base_config()).unwrap(), RunOutcome::Exited(0));
            assert_eq!(
                recorded(&argv_log),
                vec!["run", "--network", "bridge", "-w", "/w", "busybox", "echo", "ok"]
            );

            let (engine, _) = fake_engine(&dir, "exit 3");
            assert_eq!(engine.run(&base_config()).unwrap(), RunOutcome::Exited(3));
        }

        #[test]
        fn run_treats_reserved_statuses_as_engine_failures() {
            let dir = TempDir::new().unwrap();
            for code in [125, 126, 127] {
                let (engine, _) = fake_engine(&dir, &format!("exit {code}"));
                let err = engine.run(&base_config()).unwrap_err();
                assert!(
                    matches!(&err, EngineError::Failed { action: "run", status, .. } if *status == code.to_string()),
                    "unexpected error for {code}: {err:?}"
                );
            }
        }

        #[test]
        fn run_detached_nonzero_is_error() {
            let dir = TempDir::new().unwrap();
            let mut config = base_config();
            config.detach = true;

            let (engine, _) = fake_engine(&dir, "exit 1");
            let err = engine.run(&config).unwrap_err();
            assert!(err.to_string().contains("run -d exited with status 1"));

            let (engine, _) = fake_engine(&dir, "exit 0");
            assert_eq!(engine.run(&config).unwrap(), RunOutcome::Detached);
        }

        #[test]
        fn run_killed_by_signal_is_signaled() {
            let dir = TempDir::new().unwrap();
            let (engine, _) = fake_engine(&dir, "kill -TERM $$");

            assert_eq!(engine.run(&base_config()).unwrap(), RunOutcome::Signaled);
        }

        #[test]
        fn pull_nonzero_is_error() {
            let dir = TempDir::new().unwrap();
            let image = ImageReference::parse("private/image:1.0").unwrap();

            let (engine, argv_log) = fake_engine(&dir, "exit 1");
            let err = engine.pull(&image).unwrap_err();
            assert!(matches!(err, EngineError::Failed { action: "pull", .. }));
            assert_eq!(recorded(&argv_log), vec!["pull", "private/image:1.0"]);

            let (engine, _) = fake_engine(&dir, "exit 0");
            engine.pull(&image).unwrap();
        }

        #[test]
        fn missing_engine_binary_is_spawn_error() {
            let dir = TempDir::new().unwrap();
            let engine = CliEngine::new(dir.path().join("no-such-docker").to_string_lossy());

            let err = engine.run(&base_config()).unwrap_err();

            assert!(matches!(err, EngineError::Spawn { .. }));
        }
    }
}
