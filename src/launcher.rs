use std::path::Path;

use crate::config::Settings;
use crate::connection;
use crate::devices::{self, DeviceProbe};
use crate::engine::{ContainerEngine, RunOutcome};
use crate::error::LaunchFailure;
use crate::image;
use crate::launch::build_launch_config;

/// Runs one kernel launch: resolve the image, rewrite the connection file,
/// then hand the assembled configuration to the engine.
pub struct Launcher<'a, E: ?Sized, P: ?Sized> {
    engine: &'a E,
    probe: &'a P,
    settings: &'a Settings,
}

impl<'a, E, P> Launcher<'a, E, P>
where
    E: ContainerEngine + ?Sized,
    P: DeviceProbe + ?Sized,
{
    pub fn new(engine: &'a E, probe: &'a P, settings: &'a Settings) -> Self {
        Self {
            engine,
            probe,
            settings,
        }
    }

    pub fn start(
        &self,
        image: &str,
        connection_file: &Path,
        working_dir: &Path,
    ) -> Result<RunOutcome, LaunchFailure> {
        let image = image::resolve(self.engine, image)?;

        let connection_file =
            std::path::absolute(connection_file).map_err(|source| LaunchFailure::SpecRead {
                path: connection_file.to_path_buf(),
                source,
            })?;
        let (spec, ports) = connection::prepare(&connection_file, self.settings.bind_ip)?;

        let device_requests = devices::attachable(
            self.probe,
            &self.settings.device_capabilities,
            self.settings.device_count,
        );
        let config = build_launch_config(
            &image,
            spec.path(),
            working_dir,
            ports,
            device_requests,
            self.settings,
        );
        if let Ok(rendered) = serde_json::to_string(&config) {
            log::debug!("launch config: {rendered}");
        }

        log::info!("starting kernel container from {image}");
        let outcome = self
            .engine
            .run(&config)
            .map_err(|source| LaunchFailure::Launch {
                image: config.image.clone(),
                source,
            })?;

        match outcome {
            RunOutcome::Exited(0) => log::info!("kernel container exited"),
            RunOutcome::Exited(code) => log::warn!("kernel container exited with status {code}"),
            RunOutcome::Signaled => log::warn!("kernel container run ended by signal"),
            RunOutcome::Detached => log::info!("kernel container running detached"),
            RunOutcome::NotRun => {}
        }
        Ok(outcome)
    }
}
