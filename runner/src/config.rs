use crate::{
    launcher::LauncherError,
    membership::{Cookie, MembershipError, MembershipOptions},
    pool::PoolConfig,
    scheduler::{ActivityOptions, SchedulerConfig},
    task::{Task, TaskRegistry},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    fs::File,
    io,
    path::Path,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// seconds, overrides the default worker timeout
pub const WORKER_TIMEOUT_ENV: &str = "FLOCK_WORKER_TIMEOUT";
/// shared secret used when the config file doesn't define one
pub const COOKIE_ENV: &str = "FLOCK_COOKIE";

const DEFAULT_WORKER_TIMEOUT_SECS: f64 = 60.0;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to open config file")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid cookie")]
    InvalidCookie(#[from] MembershipError),
    #[error("Launcher not supported")]
    UnsupportedLauncher(String),
    #[error("Launcher failed to load")]
    FailedLoadLauncher(#[from] LauncherError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // address the membership manager listens on
    #[serde(default = "default_bind")]
    pub bind: String,
    // shared secret, falls back to FLOCK_COOKIE and then to a random one
    #[serde(default)]
    pub cookie: Option<String>,
    // bound for the join handshake, falls back to FLOCK_WORKER_TIMEOUT
    #[serde(default)]
    pub worker_timeout_secs: Option<f64>,
    #[serde(default = "default_true")]
    pub signal_on_terminate: bool,

    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,

    // init steps registered in order when the controller starts
    #[serde(default)]
    pub init: Vec<Task>,
    // activities the controller binary runs
    #[serde(default)]
    pub activities: Vec<ActivityConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    // Name of the selected launcher, see Launcher::load for the selection process
    pub name: String,
    // launcher specific parameters
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActivityConfig {
    pub label: Option<String>,
    pub task: Task,
    #[serde(default = "default_tries")]
    pub tries: u32,
    // seconds
    pub max_time: Option<f64>,
}

impl ActivityConfig {
    pub fn options(&self) -> ActivityOptions {
        let mut options = ActivityOptions::default().tries(self.tries);

        if let Some(label) = &self.label {
            options = options.label(label.clone());
        }

        if let Some(max_time) = self.max_time.filter(|seconds| *seconds > 0.0) {
            options = options.max_time(Duration::from_secs_f64(max_time));
        }

        options
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            name: String::from("manual"),
            parameter: BTreeMap::new(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            cookie: None,
            worker_timeout_secs: None,
            signal_on_terminate: true,
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            launcher: LauncherConfig::default(),
            init: Vec::new(),
            activities: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Config value, then FLOCK_WORKER_TIMEOUT, then 60 seconds
    pub fn worker_timeout(&self) -> Duration {
        let seconds = self.worker_timeout_secs.or_else(|| {
            env::var(WORKER_TIMEOUT_ENV)
                .ok()
                .and_then(|value| match value.trim().parse::<f64>() {
                    Ok(seconds) => Some(seconds),
                    Err(error) => {
                        warn!("{WORKER_TIMEOUT_ENV}={value} is not a number ({error}), using the default");
                        None
                    }
                })
        });

        match seconds {
            Some(seconds) if seconds.is_finite() && seconds > 0.0 => {
                Duration::from_secs_f64(seconds)
            }
            _ => Duration::from_secs_f64(DEFAULT_WORKER_TIMEOUT_SECS),
        }
    }

    /// Config value, then FLOCK_COOKIE, then a fresh random cookie
    pub fn cookie(&self) -> Result<Cookie, ConfigErrors> {
        match self.cookie.clone().or_else(|| env::var(COOKIE_ENV).ok()) {
            Some(cookie) => Ok(Cookie::from_str(&cookie)?),
            None => Ok(Cookie::generate()),
        }
    }

    pub fn membership_options(&self) -> Result<MembershipOptions, ConfigErrors> {
        Ok(MembershipOptions {
            cookie: self.cookie()?,
            worker_timeout: self.worker_timeout(),
            signal_on_terminate: self.signal_on_terminate,
        })
    }

    /// Check the config against the tasks `registry` knows. Every problem is logged, returns
    /// true if any of them is fatal.
    pub fn preflight_checks(&mut self, registry: &TaskRegistry) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.bind.trim().is_empty() {
            error!("bind must not be empty, use e.g. 127.0.0.1:0");
            contains_error = true;
        }

        if let Some(cookie) = &self.cookie {
            if let Err(e) = Cookie::from_str(cookie) {
                error!("cookie is invalid: {e}");
                contains_error = true;
            }
        }

        if let Some(seconds) = self.worker_timeout_secs {
            if !(seconds.is_finite() && seconds > 0.0) {
                error!("worker_timeout_secs ({seconds}) must be a positive number of seconds");
                contains_error = true;
            }
        }

        if self.pool.max_occupancy == 0 {
            warn!("pool.max_occupancy cannot be 0. Falling back to 1");
            self.pool.max_occupancy = 1;
        }

        if self.scheduler.idle_backoff_max_us < self.scheduler.idle_backoff_min_us {
            warn!(
                "scheduler.idle_backoff_max_us ({}) is below idle_backoff_min_us ({}). Using the minimum for both",
                self.scheduler.idle_backoff_max_us, self.scheduler.idle_backoff_min_us
            );
            self.scheduler.idle_backoff_max_us = self.scheduler.idle_backoff_min_us;
        }

        self.launcher.name = self.launcher.name.to_lowercase();

        match self.launcher.name.as_str() {
            "local" | "slurm" | "manual" => {}
            launcher_name => {
                error!("launcher.name ({launcher_name}) is not supported, please use `local`, `slurm` or `manual`");
                contains_error = true;
            }
        }

        for (index, task) in self.init.iter().enumerate() {
            if !registry.contains(&task.function) {
                error!("init[{index}] references the unknown task `{}`", task.function);
                contains_error = true;
            }
        }

        let mut labels = BTreeSet::new();

        for (index, activity) in self.activities.iter_mut().enumerate() {
            if !registry.contains(&activity.task.function) {
                error!(
                    "activities[{index}] references the unknown task `{}`",
                    activity.task.function
                );
                contains_error = true;
            }

            if activity.tries == 0 {
                warn!("activities[{index}].tries cannot be 0. Falling back to a single attempt");
                activity.tries = 1;
            }

            if let Some(max_time) = activity.max_time {
                if !(max_time.is_finite() && max_time > 0.0) {
                    error!("activities[{index}].max_time ({max_time}) must be a positive number of seconds");
                    contains_error = true;
                }
            }

            if let Some(label) = &activity.label {
                if !labels.insert(label.clone()) {
                    warn!("Activity label {label} is used more than once, results will be hard to tell apart");
                }
            }
        }

        if self.activities.is_empty() {
            warn!("No activities were defined, the controller will only run the init steps");
        }

        contains_error
    }
}

fn default_bind() -> String {
    String::from("127.0.0.1:0")
}

fn default_true() -> bool {
    true
}

fn default_tries() -> u32 {
    1
}
