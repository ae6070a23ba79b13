use crate::{
    ledger::InitLedger,
    membership::{Membership, MembershipEvent, WorkerId, CONTROLLER},
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// number of leases a single worker may hand out at the same time
    #[serde(default = "default_max_occupancy")]
    pub max_occupancy: usize,
    /// offer the controller's own process while no remote worker exists
    #[serde(default = "default_true")]
    pub controller_fallback: bool,
    /// bring workers up to the current init level before handing them out
    #[serde(default = "default_true")]
    pub initialize: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_occupancy: default_max_occupancy(),
            controller_fallback: true,
            initialize: true,
        }
    }
}

fn default_max_occupancy() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Lease bookkeeping.
///
/// For every member: occupancy + entries in `free` + `spare` permits == max_occupancy.
#[derive(Debug, Default)]
struct PoolState {
    members: BTreeSet<WorkerId>,
    free: VecDeque<WorkerId>,
    spare: BTreeMap<WorkerId, usize>,
    occupancy: BTreeMap<WorkerId, usize>,
    controller_leases: usize,
}

impl PoolState {
    fn checkout(&mut self, config: &PoolConfig) -> Option<WorkerId> {
        if self.members.is_empty() {
            if config.controller_fallback && self.controller_leases < config.max_occupancy {
                self.controller_leases += 1;

                return Some(CONTROLLER);
            }

            return None;
        }

        if self.free.is_empty() {
            self.promote_spare();
        }

        let worker = self.free.pop_front()?;
        *self.occupancy.entry(worker).or_default() += 1;

        Some(worker)
    }

    /// move one spare permit per worker into the free queue
    fn promote_spare(&mut self) {
        for (worker, permits) in self.spare.iter_mut() {
            if *permits > 0 {
                *permits -= 1;
                self.free.push_back(*worker);
            }
        }

        self.spare.retain(|_, permits| *permits > 0);
    }

    fn checkin(&mut self, worker: WorkerId) -> bool {
        if worker == CONTROLLER {
            if self.controller_leases == 0 {
                return false;
            }

            self.controller_leases -= 1;

            return true;
        }

        match self.occupancy.get_mut(&worker) {
            Some(occupancy) if *occupancy > 0 => {
                *occupancy -= 1;
                self.free.push_back(worker);

                true
            }
            _ => false,
        }
    }

    fn insert(&mut self, worker: WorkerId, max_occupancy: usize) -> bool {
        if !self.members.insert(worker) {
            return false;
        }

        self.free.push_back(worker);
        self.occupancy.insert(worker, 0);

        if max_occupancy > 1 {
            self.spare.insert(worker, max_occupancy - 1);
        }

        true
    }

    fn purge(&mut self, worker: WorkerId) -> bool {
        let removed = self.members.remove(&worker);

        self.free.retain(|free| *free != worker);
        self.spare.remove(&worker);
        self.occupancy.remove(&worker);

        removed
    }
}

/// Hands out worker ids for exclusive or bounded shared use.
///
/// Membership changes are absorbed transparently: departed workers disappear from the pool,
/// workers failing to initialize are evicted and `take` moves on to the next one.
pub struct WorkerPool {
    config: PoolConfig,
    membership: Arc<Membership>,
    ledger: Arc<InitLedger>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl WorkerPool {
    /// create an empty pool, see `attach` to follow the membership
    pub fn new(config: PoolConfig, membership: Arc<Membership>, ledger: Arc<InitLedger>) -> Arc<Self> {
        Arc::new(Self {
            config,
            membership,
            ledger,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        })
    }

    /// Keep the pool in sync with the membership: joined workers are added, departed ones
    /// removed. Already active workers are added right away.
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);

        self.membership.on_membership_change(move |worker, event| {
            if let Some(pool) = weak.upgrade() {
                match event {
                    MembershipEvent::Joined => pool.add(worker),
                    MembershipEvent::Left => pool.remove(worker),
                }
            }
        });

        for worker in self.membership.workers() {
            self.add(worker);
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// register a worker, the controller is handled by the fallback rule instead
    pub fn add(&self, worker: WorkerId) {
        if worker == CONTROLLER {
            return;
        }

        let mut state = self.state.lock();

        // checked under the pool lock, so a concurrent `Left` purges after us
        if !self.membership.is_active(worker) {
            debug!(worker = %worker, "Not adding inactive worker to pool");
            return;
        }

        if state.insert(worker, self.config.max_occupancy.max(1)) {
            debug!(worker = %worker, members = state.members.len(), "Added worker to pool");
            self.available.notify_all();
        }
    }

    /// forget a worker, outstanding leases of it are ignored when returned
    pub fn remove(&self, worker: WorkerId) {
        let mut state = self.state.lock();

        if state.purge(worker) {
            debug!(worker = %worker, members = state.members.len(), "Removed worker from pool");

            // waiters may fall back to the controller now
            self.available.notify_all();
        }
    }

    /// Block until a worker is available, initialize it and hand it out
    pub fn take(&self) -> WorkerId {
        loop {
            let worker = {
                let mut state = self.state.lock();

                loop {
                    if let Some(worker) = state.checkout(&self.config) {
                        break worker;
                    }

                    self.available.wait(&mut state);
                }
            };

            if self.prepare(worker) {
                return worker;
            }
        }
    }

    /// like `take` but gives up after `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> Option<WorkerId> {
        let deadline = Instant::now() + timeout;

        loop {
            let worker = {
                let mut state = self.state.lock();

                loop {
                    if let Some(worker) = state.checkout(&self.config) {
                        break worker;
                    }

                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        return state.checkout(&self.config);
                    }
                }
            };

            if self.prepare(worker) {
                return Some(worker);
            }
        }
    }

    /// Hand out an initialized worker only if one is available right now, never blocks.
    ///
    /// A worker behind the init level is brought up to date on a background thread which holds
    /// the lease and returns it once the worker is current.
    pub fn try_take(self: &Arc<Self>) -> Option<WorkerId> {
        loop {
            let worker = self.state.lock().checkout(&self.config)?;

            if !self.config.initialize || self.ledger.is_current(worker) {
                return Some(worker);
            }

            if !self.prepare_in_background(worker) {
                return None;
            }
        }
    }

    /// return a lease obtained from `take`
    pub fn put(&self, worker: WorkerId) {
        let mut state = self.state.lock();

        if state.checkin(worker) {
            trace!(worker = %worker, "Worker returned to pool");
            self.available.notify_one();
        } else {
            debug!(worker = %worker, "Ignoring return of a worker without lease");
        }
    }

    /// number of remote workers in the pool
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.state.lock().members.contains(&worker)
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.state.lock().members.iter().copied().collect()
    }

    /// current number of leases of `worker`
    pub fn occupancy(&self, worker: WorkerId) -> usize {
        let state = self.state.lock();

        if worker == CONTROLLER {
            state.controller_leases
        } else {
            state.occupancy.get(&worker).copied().unwrap_or(0)
        }
    }

    /// true while `take` would fall back to the controller
    pub fn offers_controller(&self) -> bool {
        self.config.controller_fallback && self.state.lock().members.is_empty()
    }

    fn prepare_in_background(self: &Arc<Self>, worker: WorkerId) -> bool {
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("flock-init-{worker}"))
            .spawn(move || {
                if pool.prepare(worker) {
                    pool.put(worker);
                }
            });

        match spawned {
            Ok(_) => {
                debug!(worker = %worker, "Initializing worker in the background");
                true
            }
            Err(error) => {
                warn!(worker = %worker, error = %error, "Failed to start initialization thread");
                self.put(worker);
                false
            }
        }
    }

    /// initialize a freshly checked out worker, evicting it on failure
    fn prepare(&self, worker: WorkerId) -> bool {
        if !self.config.initialize || worker == CONTROLLER {
            return true;
        }

        match self.ledger.ensure_initialized(worker) {
            Ok(()) => true,
            Err(error) => {
                warn!(worker = %worker, error = %error, "Evicting worker that failed to initialize");
                self.remove(worker);
                self.membership.terminate(worker);

                false
            }
        }
    }
}
