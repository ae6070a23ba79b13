pub mod local;
pub mod remote;
pub mod wire;

use crate::{
    ledger::InitStep,
    membership::WorkerId,
    promise::Promise,
    task::{Task, TaskError},
};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;

pub use local::LocalEndpoint;
pub use remote::RemoteEndpoint;

pub type CallId = u64;

/// What a task evaluated to on the worker
pub type Outcome = Result<Value, TaskError>;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Worker {0} is not connected")]
    Disconnected(WorkerId),
    #[error("Connection failed")]
    Io(#[from] io::Error),
    #[error("Failed to encode or decode a message")]
    Codec(#[from] serde_yaml::Error),
    #[error("Frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl RpcError {
    /// true if the error only means that the other side went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected(_) => true,
            Self::Io(error) => matches!(
                error.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Call { id: CallId, task: Task },
    Initialize { id: CallId, steps: Vec<InitStep> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: CallId,
    pub result: Outcome,
}

/// Future of a single remote call
#[derive(Debug, Clone)]
pub struct Reply {
    worker: WorkerId,
    promise: Promise<Result<Outcome, RpcError>>,
}

impl Reply {
    pub(crate) fn pending(worker: WorkerId) -> Self {
        Self {
            worker,
            promise: Promise::new(),
        }
    }

    pub(crate) fn ready(worker: WorkerId, result: Result<Outcome, RpcError>) -> Self {
        let reply = Self::pending(worker);
        reply.promise.fulfil(result);

        reply
    }

    pub(crate) fn promise(&self) -> &Promise<Result<Outcome, RpcError>> {
        &self.promise
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn is_ready(&self) -> bool {
        self.promise.is_ready()
    }

    pub fn try_take(&self) -> Option<Result<Outcome, RpcError>> {
        self.promise.try_take()
    }

    pub fn wait(&self) -> Result<Outcome, RpcError> {
        self.promise
            .wait()
            .unwrap_or(Err(RpcError::Disconnected(self.worker)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Outcome, RpcError>> {
        self.promise.wait_timeout(timeout)
    }
}

/// Request/response channel to one process of the cluster.
/// The controller's own process is reached through `Local`, every joined worker through `Remote`.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Local(Arc<LocalEndpoint>),
    Remote(Arc<RemoteEndpoint>),
}

impl Endpoint {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Local(endpoint) => endpoint.worker(),
            Self::Remote(endpoint) => endpoint.worker(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Remote(endpoint) => endpoint.is_alive(),
        }
    }

    /// start a task, an error means the call could not be issued at all
    pub fn call(&self, task: Task) -> Result<Reply, RpcError> {
        match self {
            Self::Local(endpoint) => endpoint.call(task),
            Self::Remote(endpoint) => endpoint.call(task),
        }
    }

    /// ask the process to apply init steps, the reply carries the reached level
    pub fn initialize(&self, steps: Vec<InitStep>) -> Result<Reply, RpcError> {
        match self {
            Self::Local(endpoint) => Ok(endpoint.initialize(&steps)),
            Self::Remote(endpoint) => endpoint.initialize(steps),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Self::Local(_) => {}
            Self::Remote(endpoint) => endpoint.shutdown(),
        }
    }
}
