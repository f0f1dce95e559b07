use std::path::PathBuf;

use thiserror::Error;

/// What the invocation asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Start(StartOptions),
    Help,
}

/// Options for `dockernel start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub image: String,
    pub connection_file: PathBuf,
    /// Print engine invocations instead of running them.
    pub print: bool,
    pub runtime: Option<String>,
    pub config: Option<PathBuf>,
    pub no_privileged: bool,
    pub no_ipc_host: bool,
    pub no_devices: bool,
    pub detach: bool,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct CliError {
    message: String,
}

impl CliError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn parse_args(args: &[String]) -> Result<CliCommand, CliError> {
    let Some((subcommand, rest)) = args.split_first() else {
        return Err(CliError::new("missing subcommand (try `dockernel --help`)"));
    };

    match subcommand.as_str() {
        "--help" | "-h" | "help" => Ok(CliCommand::Help),
        "start" => parse_start(rest).map(CliCommand::Start),
        other => Err(CliError::new(format!("unknown subcommand {other:?}"))),
    }
}

fn parse_start(args: &[String]) -> Result<StartOptions, CliError> {
    let mut print = false;
    let mut runtime = None;
    let mut config = None;
    let mut no_privileged = false;
    let mut no_ipc_host = false;
    let mut no_devices = false;
    let mut detach = false;

    let mut idx = 0;
    while idx < args.len() {
        let arg = &args[idx];
        if arg == "--" {
            idx += 1;
            break;
        }
        if !arg.starts_with("--") {
            break;
        }

        if arg == "--print" {
            print = true;
        } else if let Some(rest) = arg.strip_prefix("--runtime=") {
            if rest.is_empty() {
                return Err(CliError::new("--runtime requires a value"));
            }
            runtime = Some(rest.to_string());
        } else if let Some(rest) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(rest));
        } else if arg == "--no-privileged" {
            no_privileged = true;
        } else if arg == "--no-ipc-host" {
            no_ipc_host = true;
        } else if arg == "--no-devices" {
            no_devices = true;
        } else if arg == "--detach" {
            detach = true;
        } else {
            return Err(CliError::new(format!("unknown flag {arg:?}")));
        }

        idx += 1;
    }

    let positionals = &args[idx..];
    let (image, connection_file) = match positionals {
        [image, connection_file] => (image.clone(), PathBuf::from(connection_file)),
        [] | [_] => {
            return Err(CliError::new(
                "start expects IMAGE and CONNECTION_FILE arguments",
            ));
        }
        [_, _, extra, ..] => {
            return Err(CliError::new(format!("unexpected argument {extra:?}")));
        }
    };

    Ok(StartOptions {
        image,
        connection_file,
        print,
        runtime,
        config,
        no_privileged,
        no_ipc_host,
        no_devices,
        detach,
    })
}

pub fn help_text() -> &'static str {
    r#"Start a Jupyter kernel inside a container.

Usage:
    dockernel start [FLAGS] IMAGE CONNECTION_FILE

Flags:
    --print            print the engine commands instead of executing them
    --runtime=BIN      container engine CLI (default: docker)
    --config=PATH      settings file (default: nearest .dockernel or dockernel.conf)
    --no-privileged    run without --privileged
    --no-ipc-host      keep a private IPC namespace
    --no-devices       do not request accelerator devices
    --detach           leave the kernel container running in the background

Environment:
    DOCKERNEL_LOG                  log filter (default: warn)
    DOCKERNEL_OPT_SET_<key>=VALUE  replace a setting
    DOCKERNEL_OPT_ADD_<key>=VALUE  append words to a setting
    DOCKERNEL_OPT_DEL_<key>=       reset a setting to its default
"#
}
