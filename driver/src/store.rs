use crate::config::StoreConfig;
use std::{fmt, process::Child, time::Duration};

/// how long a signalled store server gets before it is killed outright
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Running instance of the auxiliary store, as handed out by the launcher
/// that started it. The handle is consumed on teardown.
#[derive(Debug)]
pub enum StoreHandle {
    /// a server process on the current host
    Local { child: Child },
    /// a batch job owned by the scheduler
    Batch { job_id: String },
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { child } => write!(f, "pid {}", child.id()),
            Self::Batch { job_id } => write!(f, "job {job_id}"),
        }
    }
}

/// Arguments forwarded verbatim to the store server executable. The driver
/// only hands the parameters over, their interpretation is the server's
/// business.
pub fn server_args(config: &StoreConfig) -> Vec<String> {
    vec![
        "--port".to_owned(),
        config.port.to_string(),
        "--bind".to_owned(),
        config.interface.clone(),
    ]
}
