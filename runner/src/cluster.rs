use crate::{
    config::{ClusterConfig, ConfigErrors},
    ledger::{InitError, InitLedger},
    membership::{Membership, MembershipError},
    pool::WorkerPool,
    scheduler::{Activity, ActivityError, ActivityHandle, ActivityOptions, Scheduler},
    task::{Task, TaskRegistry},
};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_yaml::Value;
use std::{fmt, io, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid cluster configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to start membership manager")]
    Membership(#[from] MembershipError),
    #[error("Failed to start scheduler")]
    Scheduler(#[source] io::Error),
}

/// Everything a controller needs: membership, init ledger, worker pool and scheduler
pub struct Cluster {
    config: ClusterConfig,
    address: SocketAddr,
    membership: Arc<Membership>,
    ledger: Arc<InitLedger>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("address", &self.address)
            .field("membership", &self.membership)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Cluster {
    /// Start listening for workers and bring up the scheduler
    #[instrument(skip_all, fields(bind = %config.bind), level = "info")]
    pub fn start(config: &ClusterConfig, registry: TaskRegistry) -> Result<Arc<Self>, ClusterError> {
        let membership = Membership::new(config.membership_options()?, Arc::new(registry));
        let address = membership.listen(config.bind.as_str())?;

        let ledger = InitLedger::new(membership.clone());
        let pool = WorkerPool::new(config.pool.clone(), membership.clone(), ledger.clone());
        pool.attach();

        let scheduler = Scheduler::start(config.scheduler.clone(), pool.clone(), membership.clone())
            .map_err(ClusterError::Scheduler)?;

        info!(address = %address, "Cluster started");

        Ok(Arc::new(Self {
            config: config.clone(),
            address,
            membership,
            ledger,
            pool,
            scheduler,
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// address workers have to dial
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn ledger(&self) -> &Arc<InitLedger> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn add_init_step(&self, task: Task) -> Result<u64, InitError> {
        self.ledger.add_init_step(task)
    }

    pub fn submit(&self, task: Task, options: ActivityOptions) -> ActivityHandle {
        self.scheduler.submit(Activity::new(task, options))
    }

    pub fn on_worker(&self, task: Task, options: ActivityOptions) -> Result<Value, ActivityError> {
        self.scheduler.on_worker(task, options)
    }

    /// stop scheduling and terminate every worker
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.membership.terminate_all();
        info!("Cluster shut down");
    }
}

static DEFAULT: Lazy<RwLock<Option<Arc<Cluster>>>> = Lazy::new(|| RwLock::new(None));

/// make `cluster` the process wide default, returns the previous one
pub fn set_default(cluster: Option<Arc<Cluster>>) -> Option<Arc<Cluster>> {
    std::mem::replace(&mut *DEFAULT.write(), cluster)
}

pub fn default() -> Option<Arc<Cluster>> {
    DEFAULT.read().clone()
}

/// run `task` on the default cluster
pub fn on_worker(task: Task, options: ActivityOptions) -> Result<Value, ActivityError> {
    match default() {
        Some(cluster) => cluster.on_worker(task, options),
        None => Err(ActivityError::Shutdown {
            label: task.function,
        }),
    }
}
