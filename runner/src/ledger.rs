use crate::{
    membership::{Membership, MembershipEvent, WorkerId, CONTROLLER},
    rpc::RpcError,
    task::{unwrap_chain, Task, TaskError},
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// A registered piece of setup code and the level it raises a process to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitStep {
    pub level: u64,
    pub task: Task,
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("Init step failed on the controller")]
    Local(#[source] TaskError),
    #[error("Worker {worker} failed to initialize")]
    Failed {
        worker: WorkerId,
        #[source]
        cause: TaskError,
    },
    #[error("Worker {0} is not a member of the cluster")]
    UnknownWorker(WorkerId),
    #[error("Worker {worker} did not finish initializing within {timeout:?}")]
    Timeout { worker: WorkerId, timeout: Duration },
    #[error("Lost connection to worker {worker} during initialization")]
    Rpc {
        worker: WorkerId,
        #[source]
        source: RpcError,
    },
}

impl InitError {
    pub fn worker(&self) -> Option<WorkerId> {
        match self {
            Self::Local(_) => Some(CONTROLLER),
            Self::Failed { worker, .. } | Self::Rpc { worker, .. } | Self::Timeout { worker, .. } => {
                Some(*worker)
            }
            Self::UnknownWorker(worker) => Some(*worker),
        }
    }
}

/// Ordered list of init steps plus the level every worker reached.
///
/// The global level equals the number of registered steps. A worker is brought up to date by
/// sending it every step above its recorded level in one request; the worker skips steps it
/// already applied, so a repeated delivery is harmless.
pub struct InitLedger {
    membership: Arc<Membership>,
    steps: RwLock<Vec<InitStep>>,
    levels: Mutex<BTreeMap<WorkerId, u64>>,
    locks: Mutex<BTreeMap<WorkerId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for InitLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitLedger")
            .field("level", &self.level())
            .field("workers", &*self.levels.lock())
            .finish()
    }
}

impl InitLedger {
    /// create a ledger that forgets workers once they leave
    pub fn new(membership: Arc<Membership>) -> Arc<Self> {
        let ledger = Arc::new(Self {
            membership: membership.clone(),
            steps: RwLock::new(Vec::new()),
            levels: Mutex::new(BTreeMap::from([(CONTROLLER, 0)])),
            locks: Mutex::new(BTreeMap::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&ledger);
        membership.on_membership_change(move |worker, event| {
            if let (MembershipEvent::Left, Some(ledger)) = (event, weak.upgrade()) {
                ledger.forget(worker);
            }
        });

        ledger
    }

    /// current global level
    pub fn level(&self) -> u64 {
        self.steps.read().len() as u64
    }

    pub fn steps(&self) -> Vec<InitStep> {
        self.steps.read().clone()
    }

    /// level recorded for `worker`, 0 if it was never initialized
    pub fn worker_level(&self, worker: WorkerId) -> u64 {
        self.levels.lock().get(&worker).copied().unwrap_or(0)
    }

    /// true if `worker` already reached the global level
    pub fn is_current(&self, worker: WorkerId) -> bool {
        worker == CONTROLLER || self.worker_level(worker) >= self.level()
    }

    /// Register a new step: run it on the controller, then append it and raise the level.
    /// A step failing on the controller is not registered.
    #[instrument(skip(self), level = "debug")]
    pub fn add_init_step(&self, task: Task) -> Result<u64, InitError> {
        let mut steps = self.steps.write();
        let step = InitStep {
            level: steps.len() as u64 + 1,
            task,
        };

        let local = self.membership.local();

        if let Err(error) = local
            .state()
            .apply_steps(local.registry(), std::slice::from_ref(&step))
        {
            error!(level = step.level, task = %step.task, error = %error, "Init step failed on the controller");

            return Err(InitError::Local(unwrap_chain(error)));
        }

        let level = step.level;
        info!(level = level, task = %step.task, "Registered init step");

        steps.push(step);
        self.levels.lock().insert(CONTROLLER, level);

        Ok(level)
    }

    /// Bring `worker` up to the global level, blocking until it acknowledged the missing steps.
    /// No-op for a worker that is already current.
    ///
    /// The wait is bounded by the worker timeout. A worker that doesn't answer in time is
    /// terminated, its state is unknown from then on.
    pub fn ensure_initialized(&self, worker: WorkerId) -> Result<(), InitError> {
        if worker == CONTROLLER {
            // steps run on the controller when they are registered
            return Ok(());
        }

        let lock = self.worker_lock(worker);
        let _guard = lock.lock();

        let current = self.worker_level(worker);
        let missing: Vec<InitStep> = self
            .steps
            .read()
            .iter()
            .filter(|step| step.level > current)
            .cloned()
            .collect();

        let Some(target) = missing.last().map(|step| step.level) else {
            return Ok(());
        };

        let endpoint = self
            .membership
            .endpoint(worker)
            .ok_or(InitError::UnknownWorker(worker))?;

        debug!(worker = %worker, from = current, to = target, "Initializing worker");

        let lost = |source: RpcError| {
            error!(worker = %worker, error = ?source, "Lost worker during initialization");

            InitError::Rpc { worker, source }
        };

        let timeout = self.membership.options().worker_timeout;
        let reply = endpoint.initialize(missing).map_err(lost)?;

        let result = match reply.wait_timeout(timeout) {
            Some(result) => result.map_err(lost)?,
            None => {
                error!(worker = %worker, timeout = ?timeout, "Worker did not finish initializing in time");
                self.membership.terminate(worker);

                return Err(InitError::Timeout { worker, timeout });
            }
        };

        match result {
            Ok(level) => {
                let reached = level.as_u64().unwrap_or(target).min(target);

                if self.membership.is_active(worker) {
                    self.levels.lock().insert(worker, reached);
                }

                debug!(worker = %worker, level = reached, "Worker initialized");

                Ok(())
            }
            Err(error) => {
                error!(worker = %worker, error = %error, cause = %error.root_cause(), "Worker failed to initialize");

                Err(InitError::Failed {
                    worker,
                    cause: unwrap_chain(error),
                })
            }
        }
    }

    /// like `ensure_initialized` but removes a failing worker from the cluster instead of
    /// returning the error
    pub fn ensure_initialized_or_evict(&self, worker: WorkerId) -> bool {
        match self.ensure_initialized(worker) {
            Ok(()) => true,
            Err(error) => {
                warn!(worker = %worker, error = %error, "Evicting worker that failed to initialize");
                self.membership.terminate(worker);

                false
            }
        }
    }

    /// best effort initialization of every active worker, in parallel
    pub fn initialize_all(&self) -> Vec<(WorkerId, Result<(), InitError>)> {
        let workers = self.membership.workers();

        thread::scope(|scope| {
            let handles = workers
                .into_iter()
                .map(|worker| (worker, scope.spawn(move || self.ensure_initialized(worker))))
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .map(|(worker, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or(Err(InitError::UnknownWorker(worker)));

                    (worker, result)
                })
                .collect()
        })
    }

    /// drop all state kept for `worker`
    pub fn forget(&self, worker: WorkerId) {
        if worker == CONTROLLER {
            return;
        }

        self.levels.lock().remove(&worker);
        self.locks.lock().remove(&worker);
        debug!(worker = %worker, "Forgot init state of worker");
    }

    fn worker_lock(&self, worker: WorkerId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(worker).or_default().clone()
    }
}
