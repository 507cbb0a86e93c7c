use super::LauncherError;
use crate::{
    config::{ModelConfig, StoreConfig},
    store::{self, StoreHandle},
};
use itertools::Itertools;
use std::{
    fs,
    path::Path,
    process::{Command, Output},
};
use tracing::{debug, info, instrument};

const MPMD_CONF: &str = "mpmd.conf";
const MODEL_SCRIPT: &str = "model.sbatch";
const STORE_SCRIPT: &str = "store.sbatch";

/// Launcher that renders batch scripts into the run directory and submits
/// them with sbatch. The model job is submitted with --wait so the driver
/// blocks until the scheduler reports completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlurmLauncher;

/// srun --multi-prog configuration: one rank range per process group
pub fn mpmd_conf(model: &ModelConfig) -> Result<String, LauncherError> {
    let model_last = model
        .model
        .tasks()
        .checked_sub(1)
        .ok_or(LauncherError::NoTasks)?;
    let mut conf = format!("0-{} {}\n", model_last, model.model.exec.display());

    if let Some(io_server) = &model.io_server {
        let io_last = io_server.tasks().checked_sub(1).ok_or(LauncherError::NoTasks)?;
        conf.push_str(&format!(
            "{}-{} {}\n",
            model.model.tasks(),
            model.model.tasks() + io_last,
            io_server.exec.display()
        ));
    }

    Ok(conf)
}

/// the batch script for the MPMD model job
pub fn model_script(model: &ModelConfig) -> String {
    let mut directives = vec![
        format!("#SBATCH --job-name={}", model.name),
        format!("#SBATCH --time={}", model.walltime),
        format!("#SBATCH --nodes={}", model.total_nodes()),
        format!("#SBATCH --ntasks={}", model.total_tasks()),
    ];

    if let Some(constraint) = &model.model.constraint {
        directives.push(format!("#SBATCH --constraint={constraint}"));
    }

    format!(
        "#!/bin/bash\n{}\nsrun --ntasks={} --multi-prog {MPMD_CONF}\n",
        directives.iter().join("\n"),
        model.total_tasks()
    )
}

/// the batch script running one store server per allocated node
pub fn store_script(config: &StoreConfig) -> String {
    let mut directives = vec![
        format!("#SBATCH --job-name={}", config.name),
        format!("#SBATCH --time={}", config.walltime),
        format!("#SBATCH --nodes={}", config.nodes),
        format!("#SBATCH --ntasks={}", config.nodes),
        "#SBATCH --ntasks-per-node=1".to_owned(),
    ];

    if let Some(constraint) = &config.constraint {
        directives.push(format!("#SBATCH --constraint={constraint}"));
    }

    format!(
        "#!/bin/bash\n{}\nsrun {} {}\n",
        directives.iter().join("\n"),
        config.exec.display(),
        store::server_args(config).iter().join(" ")
    )
}

fn submit(run_dir: &Path, script: &str, wait: bool) -> Result<String, LauncherError> {
    let mut command = Command::new("sbatch");
    command.arg("--parsable").current_dir(run_dir);

    if wait {
        command.arg("--wait");
    }

    let Output {
        status,
        stdout,
        stderr,
    } = command
        .arg(script)
        .output()
        .map_err(|e| LauncherError::Spawn("sbatch".to_owned(), e))?;

    if status.success() {
        Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
    } else {
        Err(LauncherError::SubmitRejected(
            String::from_utf8_lossy(&stderr).trim().to_owned(),
        ))
    }
}

impl SlurmLauncher {
    #[instrument(skip(self, model), level = "info")]
    pub fn start_model(&self, run_dir: &Path, model: &ModelConfig) -> Result<(), LauncherError> {
        fs::write(run_dir.join(MPMD_CONF), mpmd_conf(model)?)?;
        fs::write(run_dir.join(MODEL_SCRIPT), model_script(model))?;

        debug!("Submitting {MODEL_SCRIPT} and waiting for it");
        let job_id = submit(run_dir, MODEL_SCRIPT, true)?;
        info!("Model job {job_id} completed");

        Ok(())
    }

    #[instrument(skip(self, config), level = "info")]
    pub fn start_store(
        &self,
        run_dir: &Path,
        config: &StoreConfig,
    ) -> Result<StoreHandle, LauncherError> {
        fs::write(run_dir.join(STORE_SCRIPT), store_script(config))?;

        let job_id = submit(run_dir, STORE_SCRIPT, false)?;
        info!("Store running as batch job {job_id}");

        Ok(StoreHandle::Batch { job_id })
    }

    pub fn stop_store(&self, handle: StoreHandle) -> Result<(), LauncherError> {
        match handle {
            StoreHandle::Batch { job_id } => {
                let status = Command::new("scancel")
                    .arg(&job_id)
                    .status()
                    .map_err(|e| LauncherError::Spawn("scancel".to_owned(), e))?;

                if status.success() {
                    debug!("Cancelled store job {job_id}");

                    Ok(())
                } else {
                    Err(LauncherError::RunFailed(status))
                }
            }
            StoreHandle::Local { .. } => Err(LauncherError::ForeignHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParameterMap, ProcessGroup};
    use std::path::PathBuf;

    fn model() -> ModelConfig {
        ModelConfig {
            name: "AI-EKE-NEMO".to_owned(),
            walltime: "02:00:00".to_owned(),
            model: ProcessGroup {
                exec: PathBuf::from("/opt/nemo/nemo.exe"),
                nodes: 25,
                tasks_per_node: 45,
                constraint: Some("haswell".to_owned()),
            },
            io_server: Some(ProcessGroup {
                exec: PathBuf::from("/opt/xios/xios_server.exe"),
                nodes: 1,
                tasks_per_node: 8,
                constraint: None,
            }),
            params: ParameterMap::new(),
        }
    }

    #[test]
    fn mpmd_conf_partitions_the_rank_range() {
        assert_eq!(
            mpmd_conf(&model()).unwrap(),
            "0-1124 /opt/nemo/nemo.exe\n1125-1132 /opt/xios/xios_server.exe\n"
        );
    }

    #[test]
    fn zero_task_groups_cannot_be_rendered() {
        let mut no_model_tasks = model();
        no_model_tasks.model.nodes = 0;
        assert!(matches!(mpmd_conf(&no_model_tasks), Err(LauncherError::NoTasks)));

        let mut no_io_tasks = model();
        no_io_tasks.io_server.as_mut().unwrap().tasks_per_node = 0;
        assert!(matches!(mpmd_conf(&no_io_tasks), Err(LauncherError::NoTasks)));
    }

    #[test]
    fn model_script_carries_the_allocation_and_constraint() {
        let script = model_script(&model());

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=AI-EKE-NEMO\n"));
        assert!(script.contains("#SBATCH --time=02:00:00\n"));
        assert!(script.contains("#SBATCH --nodes=26\n"));
        assert!(script.contains("#SBATCH --ntasks=1133\n"));
        assert!(script.contains("#SBATCH --constraint=haswell\n"));
        assert!(script.ends_with("srun --ntasks=1133 --multi-prog mpmd.conf\n"));
    }

    #[test]
    fn store_script_runs_one_server_per_node() {
        let config = StoreConfig {
            name: "AI-EKE-NEMO-store".to_owned(),
            exec: PathBuf::from("redis-server"),
            nodes: 3,
            port: 6780,
            interface: "ipogif0".to_owned(),
            constraint: Some("P100".to_owned()),
            walltime: "02:00:00".to_owned(),
        };

        let script = store_script(&config);

        assert!(script.contains("#SBATCH --job-name=AI-EKE-NEMO-store\n"));
        assert!(script.contains("#SBATCH --nodes=3\n"));
        assert!(script.contains("#SBATCH --ntasks-per-node=1\n"));
        assert!(script.contains("#SBATCH --constraint=P100\n"));
        assert!(script.ends_with("srun redis-server --port 6780 --bind ipogif0\n"));
    }
}
