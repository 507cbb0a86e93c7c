use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap, fs::File, io::Error, os::unix::fs::MetadataExt, path::Path,
    path::PathBuf, time::Duration,
};
use thiserror::Error;

/// map of namelist token -> value, substituted verbatim at generation time
pub type ParameterMap = BTreeMap<String, String>;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Launcher not supported")]
    UnsupportedLauncher(String),
    #[error("Walltime must be of the form hh:mm:ss")]
    InvalidWalltime(String),
    #[error("Process group {0} allocates zero tasks")]
    ZeroTasks(String),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
}

/// parse a scheduler walltime ("hh:mm:ss") into a Duration
pub fn parse_walltime(walltime: &str) -> Result<Duration, ConfigErrors> {
    let parts: Vec<u64> = walltime
        .splitn(3, ':')
        .map(|part| part.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ConfigErrors::InvalidWalltime(walltime.to_owned()))?;

    match parts.as_slice() {
        [hours, minutes, seconds] => hours
            .checked_mul(3600)
            .zip(minutes.checked_mul(60))
            .and_then(|(hours, minutes)| hours.checked_add(minutes))
            .and_then(|total| total.checked_add(*seconds))
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigErrors::InvalidWalltime(walltime.to_owned())),
        _ => Err(ConfigErrors::InvalidWalltime(walltime.to_owned())),
    }
}

/// The seven per-segment values injected into the namelist templates.
/// Values are forwarded verbatim, Fortran notation included.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunParameters {
    pub job_number: u32,
    pub first_time_step: u64,
    pub last_time_step: u64,
    pub restart_flag: String,
    pub restart_directory: String,
    pub output_feedback_files: String,
    pub iceberg_output_directory: String,
}

impl RunParameters {
    /// flatten into the token map used for namelist substitution
    pub fn to_parameter_map(&self) -> ParameterMap {
        ParameterMap::from([
            ("NN_NO".to_owned(), self.job_number.to_string()),
            ("NIT000".to_owned(), self.first_time_step.to_string()),
            ("NITEND".to_owned(), self.last_time_step.to_string()),
            ("RESTART".to_owned(), self.restart_flag.clone()),
            ("CN_DIRRST".to_owned(), self.restart_directory.clone()),
            ("CN_DIAOBS".to_owned(), self.output_feedback_files.clone()),
            ("CN_DIRICB".to_owned(), self.iceberg_output_directory.clone()),
        ])
    }
}

/// One executable of an MPMD launch with its node allocation
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProcessGroup {
    pub exec: PathBuf,
    pub nodes: usize,
    pub tasks_per_node: usize,
    #[serde(default)]
    pub constraint: Option<String>,
}

impl ProcessGroup {
    pub fn tasks(&self) -> usize {
        self.nodes * self.tasks_per_node
    }
}

/// The simulation side of the experiment: the model executable, the optional
/// co-scheduled I/O server, and the namelist parameters to inject.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub walltime: String,
    pub model: ProcessGroup,
    pub io_server: Option<ProcessGroup>,
    #[serde(default)]
    pub params: ParameterMap,
}

impl ModelConfig {
    /// task count over all process groups of the MPMD launch
    pub fn total_tasks(&self) -> usize {
        self.model.tasks()
            + self
                .io_server
                .as_ref()
                .map(ProcessGroup::tasks)
                .unwrap_or(0)
    }

    /// node count over all process groups of the MPMD launch
    pub fn total_nodes(&self) -> usize {
        self.model.nodes + self.io_server.as_ref().map(|group| group.nodes).unwrap_or(0)
    }
}

/// The auxiliary in-memory store provisioned next to the simulation.
/// Port and interface are forwarded verbatim to the store server.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub name: String,
    pub exec: PathBuf,
    pub nodes: usize,
    pub port: u16,
    pub interface: String,
    #[serde(default)]
    pub constraint: Option<String>,
    pub walltime: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters() -> RunParameters {
        RunParameters {
            job_number: 3,
            first_time_step: 73,
            last_time_step: 144,
            restart_flag: ".true.".to_owned(),
            restart_directory: "/scratch/restarts".to_owned(),
            output_feedback_files: "".to_owned(),
            iceberg_output_directory: "./".to_owned(),
        }
    }

    #[test]
    fn parameter_map_has_exactly_the_expected_keys() {
        let map = parameters().to_parameter_map();

        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["CN_DIAOBS", "CN_DIRICB", "CN_DIRRST", "NIT000", "NITEND", "NN_NO", "RESTART"]
        );
        assert_eq!(map["NN_NO"], "3");
        assert_eq!(map["NIT000"], "73");
        assert_eq!(map["NITEND"], "144");
        assert_eq!(map["RESTART"], ".true.");
        assert_eq!(map["CN_DIRRST"], "/scratch/restarts");
        assert_eq!(map["CN_DIAOBS"], "");
        assert_eq!(map["CN_DIRICB"], "./");
    }

    #[test]
    fn parameter_map_is_deterministic() {
        assert_eq!(parameters().to_parameter_map(), parameters().to_parameter_map());
    }

    #[test]
    fn tasks_multiply_out_per_group() {
        let model = ModelConfig {
            name: "nemo".to_owned(),
            walltime: "02:00:00".to_owned(),
            model: ProcessGroup {
                exec: PathBuf::from("/opt/nemo/nemo.exe"),
                nodes: 25,
                tasks_per_node: 45,
                constraint: None,
            },
            io_server: Some(ProcessGroup {
                exec: PathBuf::from("/opt/xios/xios_server.exe"),
                nodes: 2,
                tasks_per_node: 8,
                constraint: None,
            }),
            params: ParameterMap::new(),
        };

        assert_eq!(model.model.tasks(), 1125);
        assert_eq!(model.io_server.as_ref().unwrap().tasks(), 16);
        assert_eq!(model.total_tasks(), 1141);
        assert_eq!(model.total_nodes(), 27);
    }

    #[test]
    fn walltime_parses_to_seconds() {
        assert_eq!(parse_walltime("02:00:00").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_walltime("00:10:30").unwrap(), Duration::from_secs(630));
    }

    #[test]
    fn malformed_walltime_is_rejected() {
        assert!(parse_walltime("2h").is_err());
        assert!(parse_walltime("02:00").is_err());
        assert!(parse_walltime("aa:bb:cc").is_err());
    }

    #[test]
    fn overflowing_walltime_is_rejected() {
        assert!(parse_walltime("9999999999999999999:00:00").is_err());
        assert!(parse_walltime(&format!("{}:00:00", u64::MAX)).is_err());
    }
}
