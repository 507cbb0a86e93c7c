pub mod local;
pub mod slurm;

use crate::{
    config::{ConfigErrors, ModelConfig, StoreConfig},
    store::StoreHandle,
};
use std::{env, path::Path};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Failed to spawn {0}")]
    Spawn(String, #[source] std::io::Error),
    #[error("Launch I/O failed")]
    Io(#[from] std::io::Error),
    #[error("Run exceeded its walltime of {0}")]
    Walltime(String),
    #[error("Run exited with {0}")]
    RunFailed(std::process::ExitStatus),
    #[error("Scheduler rejected the job: {0}")]
    SubmitRejected(String),
    #[error("Walltime was invalid")]
    InvalidWalltime(#[from] ConfigErrors),
    #[error("Failed to signal the store")]
    Signal(#[from] nix::Error),
    #[error("Cannot launch a process group with zero tasks")]
    NoTasks,
    #[error("Wrong handle for this launcher")]
    ForeignHandle,
}

/// All launch backends the driver can delegate to
/// (this is deliberately not made with dynamic dispatch to avoid the headache)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Launchers {
    Local(local::LocalLauncher),
    Slurm(slurm::SlurmLauncher),
}

impl Launchers {
    /// select a backend by name, with "auto" probing the environment
    pub fn load(name: &str) -> Result<Self, ConfigErrors> {
        match name {
            "auto" => Ok(Self::detect()),
            "local" => Ok(Self::Local(local::LocalLauncher)),
            "slurm" => Ok(Self::Slurm(slurm::SlurmLauncher)),
            _ => Err(ConfigErrors::UnsupportedLauncher(name.to_owned())),
        }
    }

    /// Slurm when we are inside an allocation or a cluster is configured,
    /// otherwise fall back to plain mpirun
    fn detect() -> Self {
        let slurm = env::var_os("SLURM_CLUSTER_NAME").is_some()
            || env::var_os("SLURM_JOB_ID").is_some();

        debug!(slurm = slurm, "Probed environment for a scheduler");

        if slurm {
            Self::Slurm(slurm::SlurmLauncher)
        } else {
            Self::Local(local::LocalLauncher)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
        }
    }

    /// launch the MPMD model job from `run_dir` and block until it finishes
    pub fn start_model(&self, run_dir: &Path, model: &ModelConfig) -> Result<(), LauncherError> {
        match self {
            Self::Local(launcher) => launcher.start_model(run_dir, model),
            Self::Slurm(launcher) => launcher.start_model(run_dir, model),
        }
    }

    /// bring up the auxiliary store without waiting for it
    pub fn start_store(
        &self,
        run_dir: &Path,
        store: &StoreConfig,
    ) -> Result<StoreHandle, LauncherError> {
        match self {
            Self::Local(launcher) => launcher.start_store(run_dir, store),
            Self::Slurm(launcher) => launcher.start_store(run_dir, store),
        }
    }

    /// tear the auxiliary store down again
    pub fn stop_store(&self, handle: StoreHandle) -> Result<(), LauncherError> {
        match self {
            Self::Local(launcher) => launcher.stop_store(handle),
            Self::Slurm(launcher) => launcher.stop_store(handle),
        }
    }
}
