mod listener;

use crate::{
    rpc::{Endpoint, LocalEndpoint, RemoteEndpoint},
    task::TaskRegistry,
};
use itertools::Itertools;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    str::FromStr,
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// length of the shared secret a worker has to send first
pub const COOKIE_LEN: usize = 16;

/// the controller's own process, offered as fallback worker
pub const CONTROLLER: WorkerId = WorkerId(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Failed to bind listener to {address}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Membership manager is already listening on {0}")]
    AlreadyListening(SocketAddr),
    #[error("Cookie must be at most {COOKIE_LEN} bytes, got {0}")]
    CookieTooLong(usize),
    #[error("Failed to start background loop")]
    Spawn(#[from] io::Error),
}

/// Shared secret authenticating joining workers
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// random alphanumeric cookie
    pub fn generate() -> Self {
        let mut bytes = [0u8; COOKIE_LEN];

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(COOKIE_LEN)
            .zip(bytes.iter_mut())
            .for_each(|(value, byte)| *byte = value);

        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    /// byte for byte comparison that doesn't stop at the first difference
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == COOKIE_LEN
            && self
                .0
                .iter()
                .zip(candidate.iter())
                .fold(0u8, |difference, (left, right)| difference | (left ^ right))
                == 0
    }
}

impl FromStr for Cookie {
    type Err = MembershipError;

    /// shorter cookies are padded with spaces
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = value.as_bytes();

        if bytes.len() > COOKIE_LEN {
            return Err(MembershipError::CookieTooLong(bytes.len()));
        }

        let mut cookie = [b' '; COOKIE_LEN];
        cookie[..bytes.len()].copy_from_slice(bytes);

        Ok(Self(cookie))
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0).trim_end())
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cookie(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined,
    Left,
}

pub type MembershipCallback = Arc<dyn Fn(WorkerId, MembershipEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MembershipOptions {
    pub cookie: Cookie,
    /// bound for reading the cookie and the join handshake
    pub worker_timeout: Duration,
    /// send SIGTERM to terminated workers running on this host
    pub signal_on_terminate: bool,
}

impl MembershipOptions {
    pub fn new(cookie: Cookie) -> Self {
        Self {
            cookie,
            worker_timeout: Duration::from_secs(60),
            signal_on_terminate: true,
        }
    }
}

/// A joined worker
#[derive(Debug)]
pub struct Member {
    pub id: WorkerId,
    pub peer: SocketAddr,
    pub pid: u32,
    pub hostname: String,
    pub joined: SystemTime,
    pub endpoint: Arc<RemoteEndpoint>,
}

#[derive(Debug)]
struct PendingConnection {
    stream: TcpStream,
    peer: SocketAddr,
    accepted: Instant,
}

#[derive(Debug)]
struct Registry {
    active: BTreeMap<WorkerId, Arc<Member>>,
    pending: VecDeque<PendingConnection>,
    terminated: BTreeSet<WorkerId>,
    next_id: u64,
}

/// Accepts, authenticates and tracks the workers of a cluster.
///
/// Worker ids start at 2 and are never reused, id 1 is the controller itself.
pub struct Membership {
    options: MembershipOptions,
    registry: Mutex<Registry>,
    changed: Condvar,
    local: Arc<LocalEndpoint>,
    address: OnceCell<SocketAddr>,
    events: Mutex<mpsc::Sender<(WorkerId, MembershipEvent)>>,
    callbacks: Arc<RwLock<Vec<MembershipCallback>>>,
}

impl fmt::Debug for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membership")
            .field("address", &self.address.get())
            .field("workers", &self.workers())
            .finish()
    }
}

impl Membership {
    pub fn new(options: MembershipOptions, registry: Arc<TaskRegistry>) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<(WorkerId, MembershipEvent)>();
        let callbacks: Arc<RwLock<Vec<MembershipCallback>>> = Arc::default();
        let notified = callbacks.clone();

        // callbacks never run on the accept or join loop
        let spawned = thread::Builder::new()
            .name("flock-membership-events".to_string())
            .spawn(move || {
                for (worker, event) in receiver {
                    let callbacks = notified.read().clone();

                    for callback in callbacks {
                        callback(worker, event);
                    }
                }
            });

        if let Err(error) = spawned {
            error!(error = ?error, "Failed to start membership notifier, callbacks won't run");
        }

        Arc::new(Self {
            options,
            registry: Mutex::new(Registry {
                active: BTreeMap::new(),
                pending: VecDeque::new(),
                terminated: BTreeSet::new(),
                next_id: CONTROLLER.0 + 1,
            }),
            changed: Condvar::new(),
            local: Arc::new(LocalEndpoint::new(CONTROLLER, registry)),
            address: OnceCell::new(),
            events: Mutex::new(sender),
            callbacks,
        })
    }

    /// Bind a listening socket and start accepting workers.
    /// Returns the address workers have to dial.
    #[instrument(skip(self), level = "info")]
    pub fn listen<A: ToSocketAddrs + fmt::Debug>(
        self: &Arc<Self>,
        bind: A,
    ) -> Result<SocketAddr, MembershipError> {
        if let Some(address) = self.address.get() {
            return Err(MembershipError::AlreadyListening(*address));
        }

        let listener = TcpListener::bind(&bind).map_err(|source| MembershipError::Bind {
            address: format!("{bind:?}"),
            source,
        })?;
        let address = listener.local_addr()?;

        if self.address.set(address).is_err() {
            return Err(MembershipError::AlreadyListening(address));
        }

        listener::start(Arc::downgrade(self), listener)?;
        info!(address = %address, "Listening for workers");

        Ok(address)
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address.get().copied()
    }

    pub fn cookie(&self) -> &Cookie {
        &self.options.cookie
    }

    pub fn options(&self) -> &MembershipOptions {
        &self.options
    }

    pub fn local(&self) -> &Arc<LocalEndpoint> {
        &self.local
    }

    /// register a callback for joins and departures, called on a background thread in event order
    pub fn on_membership_change<F>(&self, callback: F)
    where
        F: Fn(WorkerId, MembershipEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// ids of all active workers, ascending
    pub fn workers(&self) -> Vec<WorkerId> {
        self.registry.lock().active.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        self.registry.lock().pending.len()
    }

    pub fn member(&self, worker: WorkerId) -> Option<Arc<Member>> {
        self.registry.lock().active.get(&worker).cloned()
    }

    pub fn is_active(&self, worker: WorkerId) -> bool {
        self.registry.lock().active.contains_key(&worker)
    }

    pub fn is_terminated(&self, worker: WorkerId) -> bool {
        self.registry.lock().terminated.contains(&worker)
    }

    /// channel to `worker`, the controller is always reachable
    pub fn endpoint(&self, worker: WorkerId) -> Option<Endpoint> {
        if worker == CONTROLLER {
            return Some(Endpoint::Local(self.local.clone()));
        }

        self.member(worker)
            .map(|member| Endpoint::Remote(member.endpoint.clone()))
    }

    /// block until at least `count` workers are active, false on timeout
    pub fn wait_for_workers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry.lock();

        while registry.active.len() < count {
            if self.changed.wait_until(&mut registry, deadline).timed_out() {
                return registry.active.len() >= count;
            }
        }

        true
    }

    /// Remove a worker from the cluster for good: close its connection and, if it runs on this
    /// host, signal the process. Returns false if the worker wasn't active.
    pub fn terminate(&self, worker: WorkerId) -> bool {
        let Some(member) = self.retire(worker) else {
            return false;
        };

        warn!(worker = %worker, pid = member.pid, host = %member.hostname, "Terminating worker");
        member.endpoint.shutdown();

        if self.options.signal_on_terminate {
            signal_member(&member);
        }

        self.notify(worker, MembershipEvent::Left);

        true
    }

    /// terminate every active worker
    pub fn terminate_all(&self) {
        let workers = self.workers();

        if !workers.is_empty() {
            info!(workers = %workers.iter().join(", "), "Terminating all workers");
        }

        for worker in workers {
            self.terminate(worker);
        }
    }

    /// connection of `worker` closed on its own
    fn disconnected(&self, worker: WorkerId) {
        if self.retire(worker).is_some() {
            info!(worker = %worker, "Worker left the cluster");
            self.notify(worker, MembershipEvent::Left);
        }
    }

    fn retire(&self, worker: WorkerId) -> Option<Arc<Member>> {
        let mut registry = self.registry.lock();
        let member = registry.active.remove(&worker)?;

        registry.terminated.insert(worker);
        self.changed.notify_all();

        Some(member)
    }

    fn enqueue(&self, connection: PendingConnection) {
        let mut registry = self.registry.lock();

        debug!(peer = %connection.peer, "Queued authenticated connection");
        registry.pending.push_back(connection);
        self.changed.notify_all();
    }

    fn next_pending(&self, timeout: Duration) -> Option<PendingConnection> {
        let mut registry = self.registry.lock();

        if registry.pending.is_empty() {
            self.changed.wait_for(&mut registry, timeout);
        }

        registry.pending.pop_front()
    }

    fn next_id(&self) -> WorkerId {
        let mut registry = self.registry.lock();
        let id = WorkerId(registry.next_id);
        registry.next_id += 1;

        id
    }

    fn admit(&self, member: Member) {
        let worker = member.id;

        {
            let mut registry = self.registry.lock();

            if !member.endpoint.is_alive() {
                debug!(worker = %worker, "Connection closed before the worker was admitted");
                registry.terminated.insert(worker);
                return;
            }

            registry.active.insert(worker, Arc::new(member));
            self.changed.notify_all();
        }

        self.notify(worker, MembershipEvent::Joined);
    }

    fn notify(&self, worker: WorkerId, event: MembershipEvent) {
        debug!(worker = %worker, event = ?event, "Membership changed");

        if self.events.lock().send((worker, event)).is_err() {
            warn!(worker = %worker, "Membership notifier is gone, dropping event");
        }
    }
}

fn signal_member(member: &Member) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::{gethostname, Pid},
    };

    if member.pid == std::process::id() {
        return;
    }

    match gethostname() {
        Ok(hostname) if hostname.to_string_lossy() == member.hostname.as_str() => {
            match kill(Pid::from_raw(member.pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(worker = %member.id, pid = member.pid, "Sent SIGTERM"),
                Err(error) => {
                    debug!(worker = %member.id, pid = member.pid, error = ?error, "Failed to signal worker")
                }
            }
        }
        Ok(_) => {}
        Err(error) => warn!(error = ?error, "Failed to retrieve hostname, not signalling worker"),
    }
}
