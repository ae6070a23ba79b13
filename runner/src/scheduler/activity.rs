use crate::{
    membership::WorkerId,
    promise::Promise,
    task::{Task, TaskError},
};
use serde_yaml::Value;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;

/// Why a single attempt of an activity failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Failure {
    /// the task itself failed, holds the root cause
    #[error("{0}")]
    Task(TaskError),
    #[error("timed out after {elapsed:?} on worker {worker} (budget {budget:?})")]
    Timeout {
        worker: WorkerId,
        elapsed: Duration,
        budget: Duration,
    },
    #[error("worker {worker} was lost while running the activity")]
    WorkerLost { worker: WorkerId },
}

impl Failure {
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Task(error) => error.is_kind(TaskError::TIMEOUT),
            Self::WorkerLost { .. } => false,
        }
    }
}

/// Terminal error of an activity, delivered exactly once
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActivityError {
    #[error("activity {label} failed: {cause}")]
    Failed {
        label: String,
        #[source]
        cause: Failure,
    },
    #[error("activity {label} failed after {attempts} attempts (max attempts exceeded): {cause}")]
    Exhausted {
        label: String,
        attempts: u32,
        #[source]
        cause: Failure,
    },
    #[error("scheduler shut down before activity {label} completed")]
    Shutdown { label: String },
}

impl ActivityError {
    pub fn cause(&self) -> Option<&Failure> {
        match self {
            Self::Failed { cause, .. } | Self::Exhausted { cause, .. } => Some(cause),
            Self::Shutdown { .. } => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Failed { label, .. } | Self::Exhausted { label, .. } | Self::Shutdown { label } => {
                label
            }
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// Timeouts and lost workers are retried, application errors are not
pub fn default_retry(failure: &Failure) -> bool {
    match failure {
        Failure::Timeout { .. } | Failure::WorkerLost { .. } => true,
        Failure::Task(error) => error.root_cause().is_kind(TaskError::TIMEOUT),
    }
}

/// Retry and timeout policy of an activity
#[derive(Clone)]
pub struct ActivityOptions {
    pub label: Option<String>,
    pub tries: u32,
    pub max_time: Option<Duration>,
    pub retry: RetryPredicate,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            label: None,
            tries: 1,
            max_time: None,
            retry: Arc::new(default_retry),
        }
    }
}

impl fmt::Debug for ActivityOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityOptions")
            .field("label", &self.label)
            .field("tries", &self.tries)
            .field("max_time", &self.max_time)
            .finish_non_exhaustive()
    }
}

impl ActivityOptions {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// maximum number of attempts, values below 1 are treated as 1
    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// decide retriability with `predicate`, it sees failures with wrapper layers removed
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.retry = Arc::new(predicate);
        self
    }
}

static NEXT_ACTIVITY: AtomicU64 = AtomicU64::new(1);

/// A submitted unit of work with its retry state
pub struct Activity {
    pub(super) id: u64,
    pub(super) task: Task,
    pub(super) label: String,
    pub(super) max_attempts: u32,
    pub(super) max_time: Option<Duration>,
    pub(super) attempts: u32,
    pub(super) retry: RetryPredicate,
    promise: Promise<Result<Value, ActivityError>>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("task", &self.task.function)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Activity {
    pub fn new(task: Task, options: ActivityOptions) -> Self {
        let id = NEXT_ACTIVITY.fetch_add(1, Ordering::SeqCst);
        let label = options
            .label
            .unwrap_or_else(|| format!("{}#{id}", task.function));

        Self {
            id,
            task,
            label,
            max_attempts: options.tries.max(1),
            max_time: options.max_time,
            attempts: 0,
            retry: options.retry,
            promise: Promise::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn handle(&self) -> ActivityHandle {
        ActivityHandle {
            label: self.label.clone(),
            promise: self.promise.clone(),
        }
    }

    pub(super) fn is_retriable(&self, failure: &Failure) -> bool {
        (self.retry)(failure)
    }

    /// hand the terminal result to the waiting caller
    pub(super) fn deliver(self, result: Result<Value, ActivityError>) {
        self.promise.fulfil(result);
    }
}

impl Drop for Activity {
    /// an activity dropped without result still releases its caller
    fn drop(&mut self) {
        self.promise.fulfil(Err(ActivityError::Shutdown {
            label: self.label.clone(),
        }));
    }
}

/// Caller side of a submitted activity
#[derive(Debug)]
pub struct ActivityHandle {
    label: String,
    promise: Promise<Result<Value, ActivityError>>,
}

impl ActivityHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_ready(&self) -> bool {
        self.promise.is_ready()
    }

    /// block until the activity resolved
    pub fn wait(&self) -> Result<Value, ActivityError> {
        self.promise.wait().unwrap_or_else(|| {
            Err(ActivityError::Shutdown {
                label: self.label.clone(),
            })
        })
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, ActivityError>> {
        self.promise.wait_timeout(timeout)
    }
}
