use crate::{
    membership::{Cookie, Membership, MembershipOptions, WorkerId, CONTROLLER},
    task::{TaskError, TaskRegistry},
    worker::{Worker, WorkerError},
};
use serde_yaml::Value;
use std::{
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub const COOKIE: &str = "test-cookie";

pub fn cookie() -> Cookie {
    Cookie::from_str(COOKIE).unwrap()
}

/// builtins plus a few functions the tests rely on
pub fn registry() -> TaskRegistry {
    TaskRegistry::with_builtins()
        // append the argument to the `log` binding
        .register("append", |context, args| {
            let mut log = match context.bindings.get("log") {
                Some(Value::Sequence(log)) => log,
                _ => Vec::new(),
            };
            log.push(args.clone());
            context.bind("log", Value::Sequence(log));

            Ok(Value::Null)
        })
        .register("fail", |_, args| {
            let kind = args.as_str().unwrap_or("Custom");

            Err(TaskError::new(kind, "failed on purpose"))
        })
        .register("whoami", |context, _| Ok(Value::from(context.worker.0)))
        // succeeds on the controller only
        .register("controller_only", |context, _| {
            if context.worker == CONTROLLER {
                Ok(Value::Null)
            } else {
                Err(TaskError::new("NotHere", "only runs on the controller"))
            }
        })
        // sleep for the given milliseconds everywhere but on the controller
        .register("stall", |context, args| {
            if context.worker != CONTROLLER {
                thread::sleep(Duration::from_millis(args.as_u64().unwrap_or(0)));
            }

            Ok(Value::Null)
        })
        // the argument together with the process that saw it
        .register("tag", |context, args| {
            Ok(Value::Sequence(vec![args.clone(), Value::from(context.worker.0)]))
        })
        .register("panic", |_, _| panic!("boom"))
}

pub fn options() -> MembershipOptions {
    MembershipOptions {
        cookie: cookie(),
        worker_timeout: Duration::from_secs(5),
        signal_on_terminate: false,
    }
}

pub fn membership(registry: TaskRegistry) -> (Arc<Membership>, SocketAddr) {
    membership_with(options(), registry)
}

pub fn membership_with(
    options: MembershipOptions,
    registry: TaskRegistry,
) -> (Arc<Membership>, SocketAddr) {
    let membership = Membership::new(options, Arc::new(registry));
    let address = membership.listen("127.0.0.1:0").unwrap();

    (membership, address)
}

/// connect a worker running on a thread of the test process
pub fn spawn_worker(
    address: SocketAddr,
    registry: TaskRegistry,
) -> JoinHandle<Result<WorkerId, WorkerError>> {
    thread::spawn(move || {
        let worker = Worker::connect(address, &cookie(), Arc::new(registry), Duration::from_secs(5))?;
        let id = worker.id();
        worker.serve()?;

        Ok(id)
    })
}

/// poll `condition` until it holds or `timeout` passed
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(10));
    }

    condition()
}

/// spawn `count` workers and wait until the membership admitted all of them
pub fn join_workers(
    membership: &Membership,
    address: SocketAddr,
    count: usize,
) -> Vec<JoinHandle<Result<WorkerId, WorkerError>>> {
    let expected = membership.len() + count;
    let handles = (0..count)
        .map(|_| spawn_worker(address, registry()))
        .collect::<Vec<_>>();

    assert!(membership.wait_for_workers(expected, Duration::from_secs(10)));

    handles
}
