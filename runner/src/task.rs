pub mod builtin;

use crate::{ledger::InitStep, membership::WorkerId};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, warn};

/// A unit of work that can be shipped to any process of the cluster: the name of a function
/// registered in a `TaskRegistry` together with its argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

impl Task {
    pub fn new(function: impl Into<String>, args: impl Into<Value>) -> Self {
        Self {
            function: function.into(),
            args: args.into(),
        }
    }

    /// task without an argument
    pub fn call(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Value::Null,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.function)
    }
}

/// Failure raised by a task, possibly wrapping the failure that caused it.
///
/// Errors cross process and thread boundaries by value, each boundary may add a wrapper layer.
/// Use `root_cause`/`unwrap_chain` to get back to the failure the task itself reported.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    #[source]
    pub cause: Option<Box<TaskError>>,
}

impl TaskError {
    pub const TIMEOUT: &'static str = "Timeout";
    pub const PANIC: &'static str = "Panic";
    pub const UNKNOWN_TASK: &'static str = "UnknownTask";
    pub const INVALID_ARGUMENT: &'static str = "InvalidArgument";
    pub const UNDEFINED_BINDING: &'static str = "UndefinedBinding";
    pub const INIT_STEP: &'static str = "InitStepFailed";
    pub const REMOTE: &'static str = "RemoteException";
    pub const IO: &'static str = "Io";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// add a wrapper layer on top of `cause`
    pub fn wrap(kind: impl Into<String>, message: impl Into<String>, cause: TaskError) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_ARGUMENT, message)
    }

    pub fn root_cause(&self) -> &TaskError {
        let mut current = self;

        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }

        current
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// number of wrapper layers above the root cause
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;

        while let Some(cause) = current.cause.as_deref() {
            depth += 1;
            current = cause;
        }

        depth
    }
}

/// Strip every wrapper layer and return the original failure.
///
/// Applied whenever an error crosses a boundary (remote reply, background thread join,
/// initialization reply) before it is shown to a caller or a retry predicate.
pub fn unwrap_chain(mut error: TaskError) -> TaskError {
    while let Some(cause) = error.cause.take() {
        error = *cause;
    }

    error
}

/// turn a panic payload into a task error
pub fn panic_error(payload: Box<dyn Any + Send>) -> TaskError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    };

    TaskError::new(TaskError::PANIC, message)
}

/// deserialize a task argument into a typed structure
pub fn parse_args<T: DeserializeOwned>(args: &Value) -> Result<T, TaskError> {
    serde_yaml::from_value(args.clone())
        .map_err(|error| TaskError::invalid_argument(error.to_string()))
}

/// Named values owned by a process, created by initialization steps and read by later tasks
#[derive(Debug, Default)]
pub struct Bindings(RwLock<BTreeMap<String, Value>>);

impl Bindings {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.write().insert(name.into(), value)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// What a running task can see of the process executing it
pub struct TaskContext<'a> {
    pub worker: WorkerId,
    pub bindings: &'a Bindings,
}

impl TaskContext<'_> {
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.bindings.set(name, value);
    }

    pub fn binding(&self, name: &str) -> Result<Value, TaskError> {
        self.bindings.get(name).ok_or_else(|| {
            TaskError::new(
                TaskError::UNDEFINED_BINDING,
                format!("{name} is not bound on worker {}", self.worker),
            )
        })
    }
}

pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>, &Value) -> Result<Value, TaskError> + Send + Sync>;

/// Table of callable functions.
/// Controller and workers have to build the same table, tasks refer to its entries by name.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    functions: BTreeMap<String, TaskFn>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl TaskRegistry {
    /// empty registry, see `with_builtins` for the default functions
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        builtin::register_all(Self::new())
    }

    pub fn register<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&TaskContext<'_>, &Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.insert(name, function);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&TaskContext<'_>, &Value) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        let name = name.into();

        if self.functions.insert(name.clone(), Arc::new(function)).is_some() {
            warn!(function = %name, "Replaced already registered task function");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// run a task in the calling thread, panics are turned into `TaskError::PANIC`
    pub fn run(&self, context: &TaskContext, task: &Task) -> Result<Value, TaskError> {
        let function = self.functions.get(&task.function).ok_or_else(|| {
            TaskError::new(
                TaskError::UNKNOWN_TASK,
                format!("no function named {} is registered", task.function),
            )
        })?;

        match catch_unwind(AssertUnwindSafe(|| function(context, &task.args))) {
            Ok(result) => result,
            Err(payload) => Err(panic_error(payload)),
        }
    }
}

/// Per process execution state: identity, reached initialization level and bindings
#[derive(Debug)]
pub struct ProcessState {
    worker: WorkerId,
    level: Mutex<u64>,
    bindings: Bindings,
}

impl ProcessState {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            level: Mutex::new(0),
            bindings: Bindings::default(),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn level(&self) -> u64 {
        *self.level.lock()
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn run(&self, registry: &TaskRegistry, task: &Task) -> Result<Value, TaskError> {
        let context = TaskContext {
            worker: self.worker,
            bindings: &self.bindings,
        };

        registry.run(&context, task)
    }

    /// Apply initialization steps in order, skipping every step at or below the reached level.
    /// The level only moves past steps that succeeded.
    pub fn apply_steps(&self, registry: &TaskRegistry, steps: &[InitStep]) -> Result<u64, TaskError> {
        let mut level = self.level.lock();

        for step in steps {
            if step.level <= *level {
                debug!(worker = %self.worker, level = step.level, "Skipping already applied init step");
                continue;
            }

            if let Err(error) = self.run(registry, &step.task) {
                return Err(TaskError::wrap(
                    TaskError::INIT_STEP,
                    format!(
                        "init step {} ({}) failed on worker {}",
                        step.level, step.task, self.worker
                    ),
                    error,
                ));
            }

            *level = step.level;
        }

        Ok(*level)
    }
}
