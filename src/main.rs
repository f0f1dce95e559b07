mod cli;
mod config;
mod connection;
mod devices;
mod engine;
mod error;
mod image;
mod launch;
mod launcher;

use std::env;
use std::error::Error;

use env_logger::Env;

use crate::cli::{CliCommand, StartOptions};
use crate::devices::HostDeviceProbe;
use crate::engine::{CliEngine, ContainerEngine, DryRunEngine};
use crate::error::LaunchFailure;
use crate::launcher::Launcher;

fn main() {
    env_logger::Builder::from_env(Env::new().filter_or("DOCKERNEL_LOG", "warn")).init();

    if let Err(failure) = run() {
        eprintln!("error: {failure}");
        let mut cause = failure.source();
        while let Some(err) = cause {
            eprintln!("caused by: {err}");
            cause = err.source();
        }
        std::process::exit(failure.exit_code());
    }
}

fn run() -> Result<(), LaunchFailure> {
    let args: Vec<String> = env::args().skip(1).collect();
    match cli::parse_args(&args)? {
        CliCommand::Help => {
            print!("{}", cli::help_text());
            Ok(())
        }
        CliCommand::Start(opts) => start(opts),
    }
}

fn start(opts: StartOptions) -> Result<(), LaunchFailure> {
    let working_dir = env::current_dir().map_err(|err| {
        config::ConfigError::new(format!("failed to resolve working directory: {err}"))
    })?;

    let mut settings = config::load(&working_dir, opts.config.as_deref())?;
    if let Some(runtime) = opts.runtime {
        settings.runtime = runtime;
    }
    if opts.no_privileged {
        settings.privileged = false;
    }
    if opts.no_ipc_host {
        settings.ipc_host = false;
    }
    if opts.no_devices {
        settings.device_capabilities.clear();
    }
    if opts.detach {
        settings.detach = true;
    }

    let engine: Box<dyn ContainerEngine> = if opts.print {
        Box::new(DryRunEngine::new(settings.runtime.clone(), std::io::stdout()))
    } else {
        Box::new(CliEngine::new(settings.runtime.clone()))
    };
    let probe = HostDeviceProbe::default();

    Launcher::new(engine.as_ref(), &probe, &settings).start(
        &opts.image,
        &opts.connection_file,
        &working_dir,
    )?;
    Ok(())
}
