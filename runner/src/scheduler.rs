pub mod activity;

use crate::{
    membership::{Membership, WorkerId, CONTROLLER},
    pool::WorkerPool,
    rpc::{Reply, RpcError},
    task::{unwrap_chain, Task},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

pub use activity::{
    default_retry, Activity, ActivityError, ActivityHandle, ActivityOptions, Failure,
    RetryPredicate,
};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// first sleep of the dispatch loop after a pass without progress
    #[serde(default = "default_idle_backoff_min_us")]
    pub idle_backoff_min_us: u64,
    /// ceiling for the idle sleep, bounds the dispatch latency
    #[serde(default = "default_idle_backoff_max_us")]
    pub idle_backoff_max_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_backoff_min_us: default_idle_backoff_min_us(),
            idle_backoff_max_us: default_idle_backoff_max_us(),
        }
    }
}

impl SchedulerConfig {
    pub fn idle_backoff_min(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_min_us.max(1))
    }

    pub fn idle_backoff_max(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_max_us).max(self.idle_backoff_min())
    }
}

fn default_idle_backoff_min_us() -> u64 {
    10
}

fn default_idle_backoff_max_us() -> u64 {
    5_000
}

/// A dispatched activity and the worker running it
struct Job {
    activity: Activity,
    worker: WorkerId,
    reply: Reply,
    started: Instant,
}

/// Runs activities on pool workers with retry and timeout handling.
///
/// A single background loop owns dispatching: it polls running jobs, hands queued activities
/// to free workers and sleeps with a growing backoff when a pass did nothing.
pub struct Scheduler {
    config: SchedulerConfig,
    pool: Arc<WorkerPool>,
    membership: Arc<Membership>,
    queue: Mutex<VecDeque<Activity>>,
    jobs: Mutex<Vec<Job>>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// create the scheduler and start its dispatch loop
    pub fn start(
        config: SchedulerConfig,
        pool: Arc<WorkerPool>,
        membership: Arc<Membership>,
    ) -> Result<Arc<Self>, std::io::Error> {
        let scheduler = Arc::new(Self {
            config,
            pool,
            membership,
            queue: Mutex::new(VecDeque::new()),
            jobs: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&scheduler);
        let handle = thread::Builder::new()
            .name("flock-scheduler".to_string())
            .spawn(move || dispatch_loop(weak))?;

        *scheduler.handle.lock() = Some(handle);

        Ok(scheduler)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// activities waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// activities currently running on a worker
    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    /// queue an activity, the handle resolves once it succeeded or failed for good
    pub fn submit(&self, activity: Activity) -> ActivityHandle {
        let handle = activity.handle();

        if !self.is_running() {
            activity.deliver(Err(ActivityError::Shutdown {
                label: handle.label().to_string(),
            }));

            return handle;
        }

        debug!(activity = activity.id, label = %activity.label, "Queued activity");
        self.queue.lock().push_back(activity);

        handle
    }

    /// submit `task` and wait for it, returns the value or the single terminal error
    pub fn on_worker(&self, task: Task, options: ActivityOptions) -> Result<Value, ActivityError> {
        self.submit(Activity::new(task, options)).wait()
    }

    /// Stop the dispatch loop. Activities still queued or running are resolved with
    /// `ActivityError::Shutdown`.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Dispatch loop panicked");
            }
        }

        let queued = std::mem::take(&mut *self.queue.lock());
        let jobs = std::mem::take(&mut *self.jobs.lock());

        info!(
            queued = queued.len(),
            in_flight = jobs.len(),
            "Scheduler shut down"
        );

        for job in jobs {
            self.pool.put(job.worker);
            drop(job.activity);
        }

        // dropping an activity resolves its handle with `Shutdown`
        drop(queued);
    }

    /// One pass of the dispatch loop, returns true if anything happened
    fn step(&self) -> bool {
        let polled = self.poll_jobs();
        let dispatched = self.dispatch();

        polled || dispatched
    }

    fn poll_jobs(&self) -> bool {
        let jobs = std::mem::take(&mut *self.jobs.lock());

        if jobs.is_empty() {
            return false;
        }

        let mut progressed = false;
        let mut running = Vec::with_capacity(jobs.len());

        for job in jobs {
            if let Some(result) = job.reply.try_take() {
                progressed = true;
                self.pool.put(job.worker);

                match result {
                    Ok(Ok(value)) => {
                        debug!(
                            activity = job.activity.id,
                            worker = %job.worker,
                            elapsed = ?job.started.elapsed(),
                            "Activity completed"
                        );
                        job.activity.deliver(Ok(value));
                    }
                    Ok(Err(error)) => {
                        debug!(activity = job.activity.id, worker = %job.worker, error = %error, "Activity raised an error");
                        self.fail(job.activity, Failure::Task(unwrap_chain(error)));
                    }
                    Err(error) => {
                        warn!(activity = job.activity.id, worker = %job.worker, error = ?error, "Lost worker while running activity");
                        self.pool.remove(job.worker);
                        self.fail(job.activity, Failure::WorkerLost { worker: job.worker });
                    }
                }

                continue;
            }

            match job.activity.max_time {
                Some(budget) if job.started.elapsed() > budget => {
                    progressed = true;
                    self.time_out(job, budget);
                }
                _ => running.push(job),
            }
        }

        self.jobs.lock().extend(running);

        progressed
    }

    /// The worker may still be busy with the abandoned call: remote workers are killed,
    /// the controller's own slot can only be released.
    fn time_out(&self, job: Job, budget: Duration) {
        let elapsed = job.started.elapsed();

        warn!(
            activity = job.activity.id,
            label = %job.activity.label,
            worker = %job.worker,
            elapsed = ?elapsed,
            budget = ?budget,
            "Activity timed out"
        );

        if job.worker == CONTROLLER {
            self.pool.put(CONTROLLER);
        } else {
            self.pool.remove(job.worker);
            self.membership.terminate(job.worker);
        }

        self.fail(
            job.activity,
            Failure::Timeout {
                worker: job.worker,
                elapsed,
                budget,
            },
        );
    }

    /// retry the activity if the failure allows it, otherwise deliver the terminal error
    fn fail(&self, activity: Activity, failure: Failure) {
        let retriable = activity.is_retriable(&failure);

        if retriable && activity.attempts < activity.max_attempts {
            warn!(
                activity = activity.id,
                label = %activity.label,
                attempt = activity.attempts,
                max_attempts = activity.max_attempts,
                failure = %failure,
                "Retrying activity"
            );
            self.queue.lock().push_back(activity);
        } else if retriable {
            error!(
                activity = activity.id,
                label = %activity.label,
                attempts = activity.attempts,
                failure = %failure,
                "Activity exhausted its attempts"
            );

            let error = ActivityError::Exhausted {
                label: activity.label.clone(),
                attempts: activity.attempts,
                cause: failure,
            };
            activity.deliver(Err(error));
        } else {
            warn!(activity = activity.id, label = %activity.label, failure = %failure, "Activity failed");

            let error = ActivityError::Failed {
                label: activity.label.clone(),
                cause: failure,
            };
            activity.deliver(Err(error));
        }
    }

    /// hand queued activities to free workers until one of both runs out
    fn dispatch(&self) -> bool {
        let mut progressed = false;

        while !self.queue.lock().is_empty() {
            let Some(worker) = self.pool.try_take() else {
                break;
            };

            let Some(activity) = self.queue.lock().pop_front() else {
                self.pool.put(worker);
                break;
            };

            progressed = true;
            self.launch(worker, activity);
        }

        progressed
    }

    /// send `activity` to the leased `worker` and track the running job
    pub(crate) fn launch(&self, worker: WorkerId, mut activity: Activity) {
        let sent = match self.membership.endpoint(worker) {
            Some(endpoint) => endpoint.call(activity.task.clone()),
            None => Err(RpcError::Disconnected(worker)),
        };

        match sent {
            Ok(reply) => {
                activity.attempts += 1;
                trace!(
                    activity = activity.id,
                    worker = %worker,
                    attempt = activity.attempts,
                    "Dispatched activity"
                );

                self.jobs.lock().push(Job {
                    activity,
                    worker,
                    reply,
                    started: Instant::now(),
                });
            }
            Err(error) => self.undispatched(worker, activity, error),
        }
    }

    /// The activity never started, so this is not an attempt: it goes back to the head of the
    /// queue. A remote worker that can't be reached is evicted, the controller's lease is
    /// returned.
    pub(crate) fn undispatched(&self, worker: WorkerId, activity: Activity, error: RpcError) {
        if worker == CONTROLLER {
            warn!(activity = activity.id, error = ?error, "Failed to dispatch activity on the controller");
            self.pool.put(CONTROLLER);
        } else {
            warn!(activity = activity.id, worker = %worker, error = ?error, "Failed to dispatch activity, evicting worker");
            self.pool.remove(worker);
            self.membership.terminate(worker);
        }

        self.queue.lock().push_front(activity);
    }
}

fn dispatch_loop(scheduler: Weak<Scheduler>) {
    let mut backoff: Option<Duration> = None;

    loop {
        let (progressed, min, max) = match scheduler.upgrade() {
            Some(scheduler) if scheduler.is_running() => (
                scheduler.step(),
                scheduler.config.idle_backoff_min(),
                scheduler.config.idle_backoff_max(),
            ),
            _ => break,
        };

        if progressed {
            backoff = None;
        } else {
            let sleep = backoff.map_or(min, |previous| (previous * 2).min(max));
            thread::sleep(sleep);
            backoff = Some(sleep);
        }
    }

    debug!("Dispatch loop stopped");
}
