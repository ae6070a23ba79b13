use crate::{
    membership::{Cookie, WorkerId},
    rpc::{
        wire::{read_frame, write_frame, Hello, Welcome},
        Request, Response, RpcError,
    },
    task::{ProcessState, TaskError, TaskRegistry},
};
use parking_lot::Mutex;
use serde_yaml::Value;
use std::{
    fmt,
    io::{self, BufReader, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to connect to controller at {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Controller rejected the connection")]
    Rejected,
    #[error("Connection to controller failed")]
    Io(#[from] io::Error),
    #[error("Failed to talk to controller")]
    Rpc(#[from] RpcError),
}

/// The worker side of a cluster connection
pub struct Worker {
    stream: TcpStream,
    state: Arc<ProcessState>,
    registry: Arc<TaskRegistry>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.state.worker())
            .field("controller", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl Worker {
    /// Dial the controller and run the join protocol: cookie, `Hello`, `Welcome`.
    #[instrument(skip(cookie, registry), level = "info")]
    pub fn connect<A: ToSocketAddrs + fmt::Debug>(
        controller: A,
        cookie: &Cookie,
        registry: Arc<TaskRegistry>,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let mut stream = TcpStream::connect(&controller).map_err(|source| WorkerError::Connect {
            address: format!("{controller:?}"),
            source,
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        stream.write_all(cookie.as_bytes())?;
        write_frame(
            &mut stream,
            &Hello {
                pid: std::process::id(),
                hostname: hostname(),
            },
        )?;

        let welcome: Welcome = match read_frame(&mut stream) {
            Ok(welcome) => welcome,
            Err(error) if error.is_disconnect() => return Err(WorkerError::Rejected),
            Err(error) => return Err(error.into()),
        };

        stream.set_read_timeout(None)?;
        info!(worker = %welcome.worker, "Joined cluster");

        Ok(Self {
            stream,
            state: Arc::new(ProcessState::new(welcome.worker)),
            registry,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.state.worker()
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Execute requests until the controller closes the connection or asks us to stop.
    /// Calls run concurrently on their own threads, init steps are applied in order.
    pub fn serve(self) -> Result<(), WorkerError> {
        let worker = self.id();
        let writer = Arc::new(Mutex::new(self.stream.try_clone()?));
        let mut reader = BufReader::new(self.stream.try_clone()?);

        loop {
            let request = match read_frame::<_, Request>(&mut reader) {
                Ok(request) => request,
                Err(error) if error.is_disconnect() => {
                    info!(worker = %worker, "Controller closed the connection");
                    return Ok(());
                }
                Err(error) => {
                    error!(worker = %worker, error = ?error, "Failed to read request");
                    let _ = self.stream.shutdown(Shutdown::Both);

                    return Err(error.into());
                }
            };

            match request {
                Request::Call { id, task } => {
                    let state = self.state.clone();
                    let registry = self.registry.clone();
                    let writer = writer.clone();

                    debug!(worker = %worker, call = id, task = %task, "Running task");

                    thread::Builder::new()
                        .name(format!("flock-task-{id}"))
                        .spawn(move || {
                            let result = state.run(&registry, &task);

                            respond(&writer, worker, id, remote(worker, result));
                        })?;
                }
                Request::Initialize { id, steps } => {
                    debug!(worker = %worker, call = id, steps = steps.len(), "Applying init steps");

                    let result = self
                        .state
                        .apply_steps(&self.registry, &steps)
                        .map(Value::from);

                    respond(&writer, worker, id, remote(worker, result));
                }
                Request::Shutdown => {
                    info!(worker = %worker, "Controller asked us to shut down");
                    let _ = self.stream.shutdown(Shutdown::Both);

                    return Ok(());
                }
            }
        }
    }
}

/// mark failures as coming from this worker
fn remote(worker: WorkerId, result: Result<Value, TaskError>) -> Result<Value, TaskError> {
    result.map_err(|error| {
        TaskError::wrap(
            TaskError::REMOTE,
            format!("on worker {worker}"),
            error,
        )
    })
}

fn respond(writer: &Mutex<TcpStream>, worker: WorkerId, id: u64, result: Result<Value, TaskError>) {
    if let Err(error) = write_frame(&mut *writer.lock(), &Response { id, result }) {
        // the controller may have abandoned us already
        warn!(worker = %worker, call = id, error = ?error, "Failed to send reply");
    }
}

pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname");
            String::from("localhost")
        }
    }
}
