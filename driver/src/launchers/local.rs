use super::LauncherError;
use crate::{
    config::{parse_walltime, ModelConfig, StoreConfig},
    store::{self, StoreHandle},
};
use std::{
    path::Path,
    process::{Command, Stdio},
    time::Instant,
};
use tracing::{debug, info, instrument};
use wait_timeout::ChildExt;

/// Launcher that runs the whole MPMD job through mpirun on the current host.
/// Node counts collapse to task counts, placement constraints do not apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalLauncher;

/// the colon-separated mpirun MPMD argument list for a model config
pub fn mpirun_args(model: &ModelConfig) -> Vec<String> {
    let mut args = vec![
        "-np".to_owned(),
        model.model.tasks().to_string(),
        model.model.exec.to_string_lossy().into_owned(),
    ];

    if let Some(io_server) = &model.io_server {
        args.push(":".to_owned());
        args.push("-np".to_owned());
        args.push(io_server.tasks().to_string());
        args.push(io_server.exec.to_string_lossy().into_owned());
    }

    args
}

impl LocalLauncher {
    #[instrument(skip(self, model), level = "info")]
    pub fn start_model(&self, run_dir: &Path, model: &ModelConfig) -> Result<(), LauncherError> {
        let walltime = parse_walltime(&model.walltime)?;
        let args = mpirun_args(model);

        debug!("Launching mpirun {}", args.join(" "));

        let mut child = Command::new("mpirun")
            .args(&args)
            .current_dir(run_dir)
            .spawn()
            .map_err(|e| LauncherError::Spawn("mpirun".to_owned(), e))?;

        let start = Instant::now();
        match child.wait_timeout(walltime)? {
            Some(status) if status.success() => {
                info!("Run finished after {} s", start.elapsed().as_secs());

                Ok(())
            }
            Some(status) => Err(LauncherError::RunFailed(status)),
            None => {
                // child hasn't exited yet
                child.kill().map_err(LauncherError::Io)?;

                Err(LauncherError::Walltime(model.walltime.clone()))
            }
        }
    }

    /// a multi-node store collapses to a single server process locally
    #[instrument(skip(self, config), level = "info")]
    pub fn start_store(
        &self,
        run_dir: &Path,
        config: &StoreConfig,
    ) -> Result<StoreHandle, LauncherError> {
        let child = Command::new(&config.exec)
            .args(store::server_args(config))
            .current_dir(run_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                LauncherError::Spawn(config.exec.to_string_lossy().into_owned(), e)
            })?;

        info!("Store server running with pid {}", child.id());

        Ok(StoreHandle::Local { child })
    }

    pub fn stop_store(&self, handle: StoreHandle) -> Result<(), LauncherError> {
        match handle {
            StoreHandle::Local { mut child } => {
                nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(child.id() as i32),
                    nix::sys::signal::Signal::SIGTERM,
                )?;

                // reap it, forcefully if the server ignores the signal
                match child.wait_timeout(store::SHUTDOWN_GRACE)? {
                    Some(status) => debug!("Store server exited with {status}"),
                    None => {
                        child.kill().map_err(LauncherError::Io)?;
                        child.wait().map_err(LauncherError::Io)?;
                    }
                }

                Ok(())
            }
            StoreHandle::Batch { .. } => Err(LauncherError::ForeignHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterMap, ProcessGroup};
    use std::path::PathBuf;

    fn model(io_server: bool) -> ModelConfig {
        ModelConfig {
            name: "nemo".to_owned(),
            walltime: "02:00:00".to_owned(),
            model: ProcessGroup {
                exec: PathBuf::from("/opt/nemo/nemo.exe"),
                nodes: 2,
                tasks_per_node: 4,
                constraint: None,
            },
            io_server: io_server.then(|| ProcessGroup {
                exec: PathBuf::from("/opt/xios/xios_server.exe"),
                nodes: 1,
                tasks_per_node: 2,
                constraint: None,
            }),
            params: ParameterMap::new(),
        }
    }

    #[test]
    fn single_program_launch_line() {
        assert_eq!(mpirun_args(&model(false)), ["-np", "8", "/opt/nemo/nemo.exe"]);
    }

    #[test]
    fn paired_io_server_extends_the_mpmd_line() {
        assert_eq!(
            mpirun_args(&model(true)),
            ["-np", "8", "/opt/nemo/nemo.exe", ":", "-np", "2", "/opt/xios/xios_server.exe"]
        );
    }
}
