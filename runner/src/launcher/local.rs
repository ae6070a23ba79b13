use super::{usize_parameter, LauncherError};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    process::{Child, Command, Stdio},
};
use tracing::{debug, info};

/// Starts workers as child processes of the controller
#[derive(Clone, Debug, PartialEq)]
pub struct LocalLauncher {
    pub workers: usize,
}

impl LocalLauncher {
    /// `workers` defaults to the number of CPUs
    pub fn load(parameter: &BTreeMap<String, Value>) -> Result<Self, LauncherError> {
        let workers = usize_parameter(parameter, "workers")?.unwrap_or_else(num_cpus::get);

        Ok(Self { workers })
    }

    /// run `command` through `sh -c` once per worker
    pub fn spawn_local(&self, command: &str) -> Result<Vec<Child>, LauncherError> {
        debug!("Starting {} local workers", self.workers);

        let children = (0..self.workers)
            .map(|_| {
                Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(|source| LauncherError::Spawn {
                        program: String::from("sh"),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            workers = children.len(),
            pids = ?children.iter().map(Child::id).collect::<Vec<_>>(),
            "Started local workers"
        );

        Ok(children)
    }
}
