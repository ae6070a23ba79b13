use super::{shell_quote, string_parameter, usize_parameter, LauncherError, WorkerCommand};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    io::Read,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info};
use wait_timeout::ChildExt;

const SBATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Submits a batch job whose tasks each run one worker
#[derive(Clone, Debug, PartialEq)]
pub struct SlurmLauncher {
    pub workers: usize,
    pub partition: Option<String>,
    pub time_limit: Option<String>,
    pub extra: Vec<String>,
}

impl SlurmLauncher {
    pub fn load(parameter: &BTreeMap<String, Value>) -> Result<Self, LauncherError> {
        let workers = usize_parameter(parameter, "workers")?.unwrap_or(1);

        if workers == 0 {
            return Err(LauncherError::InvalidParameter {
                name: String::from("workers"),
                reason: String::from("must be at least 1"),
            });
        }

        let extra = match parameter.get("extra") {
            None => Vec::new(),
            Some(Value::Sequence(values)) => values
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| LauncherError::InvalidParameter {
                            name: String::from("extra"),
                            reason: String::from("must be a list of strings"),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(LauncherError::InvalidParameter {
                    name: String::from("extra"),
                    reason: String::from("must be a list of strings"),
                })
            }
        };

        Ok(Self {
            workers,
            partition: string_parameter(parameter, "partition")?,
            time_limit: string_parameter(parameter, "time_limit")?,
            extra,
        })
    }

    /// arguments passed to `sbatch`
    pub fn sbatch_args(&self, command: &WorkerCommand) -> Vec<String> {
        let mut args = vec![
            String::from("--job-name=flock-worker"),
            format!("--ntasks={}", self.workers),
        ];

        if let Some(partition) = &self.partition {
            args.push(format!("--partition={partition}"));
        }

        if let Some(time_limit) = &self.time_limit {
            args.push(format!("--time={time_limit}"));
        }

        args.extend(self.extra.iter().cloned());
        args.push(format!("--wrap=srun {command}"));

        args
    }

    pub fn sbatch_command(&self, command: &WorkerCommand) -> String {
        std::iter::once(String::from("sbatch"))
            .chain(self.sbatch_args(command).iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// run `sbatch` and return its output, usually the job id
    pub fn submit(&self, command: &WorkerCommand) -> Result<String, LauncherError> {
        debug!("Submitting: {}", self.sbatch_command(command));

        let mut child = Command::new("sbatch")
            .args(self.sbatch_args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LauncherError::Spawn {
                program: String::from("sbatch"),
                source,
            })?;

        let status = match child.wait_timeout(SBATCH_TIMEOUT) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();

                return Err(LauncherError::Timeout(SBATCH_TIMEOUT));
            }
            Err(source) => {
                return Err(LauncherError::Spawn {
                    program: String::from("sbatch"),
                    source,
                })
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout);
        }

        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        if !status.success() {
            return Err(LauncherError::Sbatch {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        info!(workers = self.workers, "Submitted worker job: {}", stdout.trim());

        Ok(stdout.trim().to_string())
    }
}
