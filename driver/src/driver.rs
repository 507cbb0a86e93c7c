use crate::{
    config::{
        check_executable, ConfigErrors, ModelConfig, ProcessGroup, RunParameters, StoreConfig,
    },
    experiment::{Experiment, ExperimentError},
    staging::{StagingError, StagingSpec},
};
use clap::Args;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info, warn};

/// experiment name of the reference eORCA025 configuration
pub const EXPERIMENT_NAME: &str = "AI-EKE-NEMO";

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid driver configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to assemble the staging sets")]
    Staging(#[from] StagingError),
    #[error("Experiment failed")]
    Experiment(#[from] ExperimentError),
}

/// Parameters of a clustered eORCA025 run. Defaults reproduce the reference
/// two-hour, 25-node segment next to a three-node store.
#[derive(Args, Clone, Debug)]
pub struct ClusteredArgs {
    /// how long to allocate for the run, "hh:mm:ss"
    #[arg(long, default_value = "02:00:00")]
    pub walltime: String,

    /// number of nodes allocated to the model
    #[arg(long, default_value_t = 25)]
    pub num_nodes: usize,

    /// how many MPI ranks to run per node
    #[arg(long, default_value_t = 45)]
    pub tasks_per_node: usize,

    /// full path to the NEMO configuration directory
    #[arg(
        long,
        default_value = "/home/users/shao/dev/m2lines/NEMO_4.0.6_IMHOTEP/cfgs/eORCA025.L75-IMHOTEP02"
    )]
    pub cfg_path: PathBuf,

    /// full path to the NEMO forcing directory
    #[arg(
        long,
        default_value = "/lus/scratch/shao/model_inputs/NEMO4/ORCA025.L75/eORCA025.L75-IMHOTEP02-I"
    )]
    pub forcing_path: PathBuf,

    /// job number (nn_no) of the experiment
    #[arg(long, default_value_t = 1)]
    pub job_number: u32,

    /// first time step of the segment
    #[arg(long, default_value_t = 1)]
    pub first_time_step: u64,

    /// last time step of the segment
    #[arg(long, default_value_t = 72)]
    pub last_time_step: u64,

    /// ".true." marks the segment as a restart, Fortran notation
    #[arg(long, default_value = ".false.")]
    pub restart_flag: String,

    /// directory holding the restart files
    #[arg(long, default_value = "")]
    pub restart_directory: String,

    /// path for the model feedback files used in data assimilation
    #[arg(long, default_value = "")]
    pub output_feedback_files: String,

    /// path for the iceberg trajectory files
    #[arg(long, default_value = "./")]
    pub iceberg_output_directory: String,

    /// placement constraint for the model nodes (Slurm only)
    #[arg(long)]
    pub model_node_features: Option<String>,

    /// executable of the XIOS I/O server, co-scheduled in the MPMD launch
    #[arg(long)]
    pub xios_exec: Option<PathBuf>,

    /// number of nodes allocated to XIOS
    #[arg(long, default_value_t = 1)]
    pub xios_nodes: usize,

    /// XIOS server ranks per node
    #[arg(long, default_value_t = 8)]
    pub xios_tasks_per_node: usize,

    /// store server executable
    #[arg(long, default_value = "redis-server")]
    pub orchestrator_exec: PathBuf,

    /// port the store will listen on
    #[arg(long, default_value_t = 6780)]
    pub orchestrator_port: u16,

    /// network interface bound by the store
    #[arg(long, default_value = "ipogif0")]
    pub orchestrator_interface: String,

    /// number of store nodes, 0 disables the store
    #[arg(long, default_value_t = 3)]
    pub orchestrator_nodes: usize,

    /// node features requested for the store nodes (Slurm only), empty for none
    #[arg(long, default_value = "P100")]
    pub orchestrator_node_features: String,

    /// launch backend: auto, slurm or local
    #[arg(long, default_value = "auto")]
    pub launcher: String,

    /// only generate the run directory, start nothing
    #[arg(long)]
    pub configure_only: bool,
}

/// Everything the driver assembled for one invocation. Returned unchanged in
/// configure-only mode.
#[derive(Debug)]
pub struct Assembly {
    pub experiment: Experiment,
    pub model: ModelConfig,
    pub staging: StagingSpec,
    pub store: Option<StoreConfig>,
}

/// build the model process groups and the staging sets from the
/// configuration and forcing directories
fn create_model(args: &ClusteredArgs) -> Result<(ModelConfig, StagingSpec), DriverError> {
    let model = ModelConfig {
        name: EXPERIMENT_NAME.to_owned(),
        walltime: args.walltime.clone(),
        model: ProcessGroup {
            exec: args.cfg_path.join("BLD/bin/nemo.exe"),
            nodes: args.num_nodes,
            tasks_per_node: args.tasks_per_node,
            constraint: args.model_node_features.clone(),
        },
        io_server: args.xios_exec.as_ref().map(|exec| ProcessGroup {
            exec: exec.clone(),
            nodes: args.xios_nodes,
            tasks_per_node: args.xios_tasks_per_node,
            constraint: None,
        }),
        params: Default::default(),
    };

    // a group without any ranks cannot be expressed in an MPMD launch
    if model.model.tasks() == 0 {
        return Err(ConfigErrors::ZeroTasks("model".to_owned()).into());
    }
    if let Some(io_server) = &model.io_server {
        if io_server.tasks() == 0 {
            return Err(ConfigErrors::ZeroTasks("io_server".to_owned()).into());
        }
    }

    // missing binaries still fail at launch time, this only front-loads the hint
    match check_executable(&model.model.exec) {
        Ok(true) => {}
        Ok(false) => warn!(
            "Model target {} is not executable, this might cause problems",
            model.model.exec.display()
        ),
        Err(e) => warn!(
            "Failed to determine if {} is an executable: {e}",
            model.model.exec.display()
        ),
    }

    let staging = StagingSpec::from_layout(&args.cfg_path, &args.forcing_path)?;

    Ok((model, staging))
}

/// overlay the per-segment namelist parameters onto the model
fn configure_model(model: &mut ModelConfig, args: &ClusteredArgs) {
    let parameters = RunParameters {
        job_number: args.job_number,
        first_time_step: args.first_time_step,
        last_time_step: args.last_time_step,
        restart_flag: args.restart_flag.clone(),
        restart_directory: args.restart_directory.clone(),
        output_feedback_files: args.output_feedback_files.clone(),
        iceberg_output_directory: args.iceberg_output_directory.clone(),
    };

    model.params = parameters.to_parameter_map();
}

/// the auxiliary store, if any nodes were requested for it
fn create_store(args: &ClusteredArgs) -> Option<StoreConfig> {
    (args.orchestrator_nodes > 0).then(|| StoreConfig {
        name: format!("{EXPERIMENT_NAME}-store"),
        exec: args.orchestrator_exec.clone(),
        nodes: args.orchestrator_nodes,
        port: args.orchestrator_port,
        interface: args.orchestrator_interface.clone(),
        constraint: (!args.orchestrator_node_features.is_empty())
            .then(|| args.orchestrator_node_features.clone()),
        walltime: args.walltime.clone(),
    })
}

/// assemble all configuration objects for one invocation, no side effects
pub fn assemble(args: &ClusteredArgs) -> Result<Assembly, DriverError> {
    let experiment = Experiment::new(EXPERIMENT_NAME, &args.launcher)?;
    let (mut model, staging) = create_model(args)?;
    configure_model(&mut model, args);
    let store = create_store(args);

    Ok(Assembly {
        experiment,
        model,
        staging,
        store,
    })
}

/// Run a NEMO eORCA025 segment next to a clustered in-memory store:
/// assemble, generate the run directory, then start the store and the
/// blocking model job. The store is stopped whenever it was started, also
/// when the model job fails.
pub fn clustered(args: &ClusteredArgs) -> Result<Assembly, DriverError> {
    let assembly = assemble(args)?;
    let run_dir = assembly.experiment.generate(
        &assembly.model,
        &assembly.staging,
        assembly.store.as_ref(),
    )?;

    if args.configure_only {
        info!("Configure-only run, leaving {} untouched", run_dir.display());

        return Ok(assembly);
    }

    let handle = assembly
        .store
        .as_ref()
        .map(|store| assembly.experiment.start_store(&run_dir, store))
        .transpose()?;

    let outcome = assembly.experiment.start_model(&run_dir, &assembly.model);

    if let Some(handle) = handle {
        if let Err(stop_error) = assembly.experiment.stop_store(handle) {
            error!(error = ?stop_error, "Failed to stop the store");
        }
    }

    outcome?;

    Ok(assembly)
}
