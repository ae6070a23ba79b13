use crate::{
    membership::{Cookie, Membership, MembershipError, MembershipEvent, WorkerId, CONTROLLER, COOKIE_LEN},
    rpc::Endpoint,
    task::{Task, TaskRegistry},
    test_util::{cookie, eventually, join_workers, membership, registry, spawn_worker},
    worker::Worker,
};
use serde_yaml::Value;
use std::{
    io::{Read, Write},
    net::TcpStream,
    str::FromStr,
    sync::{mpsc, Arc},
    time::Duration,
};

#[test]
pub fn cookie_is_padded_to_fixed_length() {
    let short = Cookie::from_str("abc").unwrap();

    assert_eq!(short.as_bytes().len(), COOKIE_LEN);
    assert_eq!(&short.as_bytes()[..3], b"abc");
    assert!(short.as_bytes()[3..].iter().all(|byte| *byte == b' '));
    assert_eq!(short.to_string(), "abc");
    assert!(short.matches(b"abc             "));
    assert!(!short.matches(b"abd             "));
    assert!(!short.matches(b"abc"));

    assert!(matches!(
        Cookie::from_str("this cookie is way too long"),
        Err(MembershipError::CookieTooLong(_))
    ));
}

#[test]
pub fn generated_cookies_are_alphanumeric() {
    let first = Cookie::generate();
    let second = Cookie::generate();

    assert!(first.as_bytes().iter().all(u8::is_ascii_alphanumeric));
    assert_ne!(first, second);
    assert_eq!(format!("{first:?}"), "Cookie(<redacted>)");
}

#[test]
pub fn wrong_cookie_is_rejected_without_an_id() {
    let (membership, address) = membership(registry());

    let mut stream = TcpStream::connect(address).unwrap();
    stream.write_all(b"not-the-cookie!!").unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut buffer = [0u8; 16];
    assert!(matches!(stream.read(&mut buffer), Ok(0) | Err(_)));

    assert_eq!(membership.len(), 0);
    assert_eq!(membership.pending(), 0);

    // the rejected peer did not consume an id
    let handle = spawn_worker(address, registry());
    assert!(membership.wait_for_workers(1, Duration::from_secs(10)));
    assert_eq!(membership.workers(), vec![WorkerId(2)]);

    membership.terminate_all();
    assert_eq!(handle.join().unwrap().unwrap(), WorkerId(2));
}

#[test]
pub fn worker_with_wrong_cookie_fails_to_join() {
    let (membership, address) = membership(registry());
    let wrong = Cookie::from_str("wrong").unwrap();

    let result = Worker::connect(
        address,
        &wrong,
        Arc::new(TaskRegistry::new()),
        Duration::from_secs(5),
    );

    assert!(result.is_err());
    assert!(membership.is_empty());
}

#[test]
pub fn ids_start_at_two_and_are_not_reused() {
    let (membership, address) = membership(registry());

    let first = join_workers(&membership, address, 1);
    assert_eq!(membership.workers(), vec![WorkerId(2)]);

    assert!(membership.terminate(WorkerId(2)));
    assert!(membership.is_terminated(WorkerId(2)));
    assert!(!membership.is_active(WorkerId(2)));

    let second = join_workers(&membership, address, 1);
    assert_eq!(membership.workers(), vec![WorkerId(3)]);

    membership.terminate_all();

    for handle in first.into_iter().chain(second) {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn joins_and_departures_are_announced() {
    let (membership, address) = membership(registry());
    let (sender, receiver) = mpsc::channel();

    membership.on_membership_change(move |worker, event| {
        let _ = sender.send((worker, event));
    });

    let handles = join_workers(&membership, address, 2);
    let timeout = Duration::from_secs(5);

    let mut joined = vec![
        receiver.recv_timeout(timeout).unwrap(),
        receiver.recv_timeout(timeout).unwrap(),
    ];
    joined.sort_by_key(|(worker, _)| *worker);
    assert_eq!(
        joined,
        vec![
            (WorkerId(2), MembershipEvent::Joined),
            (WorkerId(3), MembershipEvent::Joined)
        ]
    );

    assert!(membership.terminate(WorkerId(3)));
    assert!(!membership.terminate(WorkerId(3)));
    assert_eq!(
        receiver.recv_timeout(timeout).unwrap(),
        (WorkerId(3), MembershipEvent::Left)
    );
    assert_eq!(membership.workers(), vec![WorkerId(2)]);

    membership.terminate_all();
    assert_eq!(
        receiver.recv_timeout(timeout).unwrap(),
        (WorkerId(2), MembershipEvent::Left)
    );

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn closed_connection_leaves_the_cluster() {
    let (membership, address) = membership(registry());

    let worker = Worker::connect(
        address,
        &cookie(),
        Arc::new(registry()),
        Duration::from_secs(5),
    )
    .unwrap();
    let id = worker.id();

    assert!(membership.wait_for_workers(1, Duration::from_secs(10)));
    assert!(membership.is_active(id));

    drop(worker);

    assert!(eventually(Duration::from_secs(5), || membership.is_terminated(id)));
    assert!(membership.is_empty());
    assert!(membership.endpoint(id).is_none());
}

#[test]
pub fn controller_is_always_reachable() {
    let membership = Membership::new(crate::test_util::options(), Arc::new(registry()));

    let endpoint = membership.endpoint(CONTROLLER).unwrap();
    assert!(matches!(endpoint, Endpoint::Local(_)));
    assert!(endpoint.is_alive());

    let result = endpoint
        .call(Task::call("whoami"))
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from(CONTROLLER.0));
}

#[test]
pub fn remote_calls_run_on_the_worker() {
    let (membership, address) = membership(registry());
    let handles = join_workers(&membership, address, 1);
    let worker = membership.workers()[0];

    let endpoint = membership.endpoint(worker).unwrap();
    let result = endpoint
        .call(Task::call("whoami"))
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from(worker.0));

    let member = membership.member(worker).unwrap();
    assert_eq!(member.pid, std::process::id());

    membership.terminate_all();

    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
}
