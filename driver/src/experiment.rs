use crate::{
    config::{ConfigErrors, ModelConfig, StoreConfig},
    launchers::{LauncherError, Launchers},
    staging::{StagingError, StagingSpec},
    store::StoreHandle,
};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Failed to stage the run directory")]
    Staging(#[from] StagingError),
    #[error("Launch failed")]
    Launcher(#[from] LauncherError),
    #[error("Failed to write the run directory")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize the experiment manifest")]
    Manifest(#[from] serde_yaml::Error),
}

/// record of the assembled configuration, written next to the staged files
#[derive(Serialize)]
struct Manifest<'a> {
    experiment: &'a str,
    launcher: &'a str,
    host: String,
    model: &'a ModelConfig,
    store: Option<&'a StoreConfig>,
    staging: &'a StagingSpec,
}

/// Context that names the run and owns everything under its experiment
/// directory. Lifecycle calls are forwarded to the selected launcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Experiment {
    pub name: String,
    pub launcher: Launchers,
    pub exp_dir: PathBuf,
}

impl Experiment {
    pub fn new(name: &str, launcher: &str) -> Result<Self, ConfigErrors> {
        Ok(Self {
            name: name.to_owned(),
            launcher: Launchers::load(launcher)?,
            exp_dir: PathBuf::from(name),
        })
    }

    pub fn run_dir(&self, model: &ModelConfig) -> PathBuf {
        self.exp_dir.join(&model.name)
    }

    /// Materialize the run directory: stage all files, substitute the
    /// namelist tokens and record the assembled configuration. An existing
    /// run directory of the same name is replaced.
    pub fn generate(
        &self,
        model: &ModelConfig,
        staging: &StagingSpec,
        store: Option<&StoreConfig>,
    ) -> Result<PathBuf, ExperimentError> {
        let run_dir = self.run_dir(model);

        if run_dir.exists() {
            warn!(run_dir = ?run_dir, "Replacing existing run directory");
            fs::remove_dir_all(&run_dir)?;
        }
        fs::create_dir_all(&run_dir)?;

        staging.materialize(&run_dir, &model.params)?;

        let manifest = Manifest {
            experiment: &self.name,
            launcher: self.launcher.name(),
            host: hostname(),
            model,
            store,
            staging,
        };
        fs::write(
            run_dir.join("experiment.yaml"),
            serde_yaml::to_string(&manifest)?,
        )?;

        info!(
            "Generated run directory {} with {} staged files",
            run_dir.display(),
            staging.to_configure.len() + staging.to_copy.len() + staging.to_symlink.len()
        );

        Ok(run_dir)
    }

    /// submit the MPMD model job and block until it has finished
    pub fn start_model(&self, run_dir: &Path, model: &ModelConfig) -> Result<(), ExperimentError> {
        info!(
            "Starting {} with {} tasks on {} nodes",
            model.name,
            model.total_tasks(),
            model.total_nodes()
        );

        Ok(self.launcher.start_model(run_dir, model)?)
    }

    /// bring up the auxiliary store, no waiting
    pub fn start_store(
        &self,
        run_dir: &Path,
        store: &StoreConfig,
    ) -> Result<StoreHandle, ExperimentError> {
        info!(
            "Starting store {} on {} node(s), port {}",
            store.name, store.nodes, store.port
        );

        Ok(self.launcher.start_store(run_dir, store)?)
    }

    /// tear the auxiliary store down
    pub fn stop_store(&self, handle: StoreHandle) -> Result<(), ExperimentError> {
        info!("Stopping store ({handle})");

        Ok(self.launcher.stop_store(handle)?)
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}
