mod local;
mod slurm;

pub use local::LocalLauncher;
pub use slurm::SlurmLauncher;

use crate::{
    config::{ConfigErrors, LauncherConfig},
    membership::Cookie,
};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    env, fmt, io,
    net::SocketAddr,
    path::PathBuf,
    process::Child,
};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("launcher.parameter.{name} {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("Failed to determine the worker executable")]
    CurrentExe(#[source] io::Error),
    #[error("Failed to start `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sbatch exited with {status}: {stderr}")]
    Sbatch { status: String, stderr: String },
    #[error("sbatch didn't finish within {0:?}")]
    Timeout(std::time::Duration),
}

/// The command line starting one worker that joins the controller at `controller`
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerCommand {
    pub exe: PathBuf,
    pub controller: SocketAddr,
    pub cookie: String,
}

impl WorkerCommand {
    /// command for the currently running executable
    pub fn current(controller: SocketAddr, cookie: &Cookie) -> Result<Self, LauncherError> {
        Ok(Self {
            exe: env::current_exe().map_err(LauncherError::CurrentExe)?,
            controller,
            cookie: cookie.to_string(),
        })
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            String::from("worker"),
            String::from("--controller"),
            self.controller.to_string(),
            String::from("--cookie"),
            self.cookie.clone(),
        ]
    }
}

impl fmt::Display for WorkerCommand {
    /// renders as a single shell command line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.exe.to_string_lossy()))?;

        for arg in self.args() {
            write!(f, " {}", shell_quote(&arg))?;
        }

        Ok(())
    }
}

/// quote `value` for `sh` unless it only consists of safe characters
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));

    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Ways to bring up workers for a controller
#[derive(Clone, Debug, PartialEq)]
pub enum Launcher {
    Local(LocalLauncher),
    Slurm(SlurmLauncher),
    /// workers are started by an operator
    Manual,
}

impl Launcher {
    pub fn load(config: &LauncherConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalLauncher::load(&config.parameter)?)),
            "slurm" => Ok(Self::Slurm(SlurmLauncher::load(&config.parameter)?)),
            "manual" => Ok(Self::Manual),
            _ => Err(ConfigErrors::UnsupportedLauncher(config.name.clone())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Slurm(_) => "slurm",
            Self::Manual => "manual",
        }
    }

    /// number of workers the launcher brings up, 0 if unknown
    pub fn expected_worker_count(&self) -> usize {
        match self {
            Self::Local(launcher) => launcher.workers,
            Self::Slurm(launcher) => launcher.workers,
            Self::Manual => 0,
        }
    }

    /// the shell command that starts the workers
    pub fn build_start_command(&self, command: &WorkerCommand) -> String {
        match self {
            Self::Local(_) | Self::Manual => command.to_string(),
            Self::Slurm(launcher) => launcher.sbatch_command(command),
        }
    }

    /// Start the workers. Returns the local child processes, if any were spawned.
    #[instrument(skip(self, command), fields(launcher = self.name()), level = "info")]
    pub fn launch(&self, command: &WorkerCommand) -> Result<Vec<Child>, LauncherError> {
        match self {
            Self::Local(launcher) => launcher.spawn_local(&command.to_string()),
            Self::Slurm(launcher) => {
                launcher.submit(command)?;

                Ok(Vec::new())
            }
            Self::Manual => {
                info!("Start workers with: {command}");

                Ok(Vec::new())
            }
        }
    }
}

pub(crate) fn usize_parameter(
    parameter: &BTreeMap<String, Value>,
    name: &str,
) -> Result<Option<usize>, LauncherError> {
    match parameter.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|number| usize::try_from(number).ok())
            .map(Some)
            .ok_or_else(|| LauncherError::InvalidParameter {
                name: name.to_string(),
                reason: String::from("must be a non-negative integer"),
            }),
    }
}

pub(crate) fn string_parameter(
    parameter: &BTreeMap<String, Value>,
    name: &str,
) -> Result<Option<String>, LauncherError> {
    match parameter.get(name) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(_) => Err(LauncherError::InvalidParameter {
            name: name.to_string(),
            reason: String::from("must be a string"),
        }),
    }
}
