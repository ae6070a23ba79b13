use super::{Reply, RpcError};
use crate::{
    ledger::InitStep,
    membership::WorkerId,
    task::{ProcessState, Task, TaskError, TaskRegistry},
};
use serde_yaml::Value;
use std::{sync::Arc, thread};
use tracing::debug;

/// Executes calls inside the controller's own process, each call on a background thread
#[derive(Debug)]
pub struct LocalEndpoint {
    state: ProcessState,
    registry: Arc<TaskRegistry>,
}

impl LocalEndpoint {
    pub fn new(worker: WorkerId, registry: Arc<TaskRegistry>) -> Self {
        Self {
            state: ProcessState::new(worker),
            registry,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.state.worker()
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn call(self: &Arc<Self>, task: Task) -> Result<Reply, RpcError> {
        let reply = Reply::pending(self.worker());
        let promise = reply.promise().clone();
        let endpoint = self.clone();

        debug!(worker = %self.worker(), task = %task, "Running task on the controller");

        thread::Builder::new()
            .name(format!("flock-local-{}", task.function))
            .spawn(move || {
                let result = endpoint.state.run(&endpoint.registry, &task);

                promise.fulfil(Ok(result.map_err(|error| {
                    TaskError::wrap(
                        TaskError::REMOTE,
                        format!("{task} failed on the controller"),
                        error,
                    )
                })));
            })?;

        Ok(reply)
    }

    /// apply steps synchronously, the returned reply is already resolved
    pub fn initialize(&self, steps: &[InitStep]) -> Reply {
        let result = self
            .state
            .apply_steps(&self.registry, steps)
            .map(Value::from);

        Reply::ready(self.worker(), Ok(result))
    }
}
