use crate::{
    cluster::{self, Cluster},
    config::ClusterConfig,
    membership::WorkerId,
    pool::PoolConfig,
    scheduler::{ActivityError, ActivityOptions},
    task::Task,
    test_util::{join_workers, registry, COOKIE},
};
use serde_yaml::Value;
use std::{collections::BTreeSet, thread, time::Duration};

fn config(controller_fallback: bool) -> ClusterConfig {
    ClusterConfig {
        cookie: Some(COOKIE.to_string()),
        worker_timeout_secs: Some(5.0),
        signal_on_terminate: false,
        pool: PoolConfig {
            controller_fallback,
            ..PoolConfig::default()
        },
        ..ClusterConfig::default()
    }
}

#[test]
pub fn activities_run_on_late_workers() {
    let cluster = Cluster::start(&config(false), registry()).unwrap();
    assert_eq!(cluster.add_init_step(Task::new("append", "ready")).unwrap(), 1);

    let handles = (1..=8u64)
        .map(|index| {
            cluster.submit(
                Task::new("tag", index),
                ActivityOptions::default().label(format!("activity-{index}")),
            )
        })
        .collect::<Vec<_>>();

    thread::sleep(Duration::from_millis(200));
    assert!(handles.iter().all(|handle| !handle.is_ready()));

    let workers = join_workers(cluster.membership(), cluster.address(), 2);

    let mut values = BTreeSet::new();
    let mut used = BTreeSet::new();

    for handle in handles.iter() {
        let Value::Sequence(tagged) = handle.wait().unwrap() else {
            panic!("tag returns a sequence");
        };

        values.insert(tagged[0].as_u64().unwrap());
        used.insert(WorkerId(tagged[1].as_u64().unwrap()));
    }

    assert_eq!(values, (1..=8).collect::<BTreeSet<u64>>());
    assert!(used.iter().all(|worker| *worker == WorkerId(2) || *worker == WorkerId(3)));

    // every worker that ran an activity went through the init step first
    for worker in used {
        assert_eq!(cluster.ledger().worker_level(worker), 1);

        let log = cluster
            .membership()
            .endpoint(worker)
            .unwrap()
            .call(Task::new("binding", "log"))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(log.unwrap(), Value::Sequence(vec![Value::from("ready")]));
    }

    cluster.shutdown();
    assert!(cluster.membership().is_empty());

    for handle in workers {
        assert!(handle.join().unwrap().is_ok());
    }
}

#[test]
pub fn default_cluster_serves_free_functions() {
    let cluster = Cluster::start(&config(true), registry()).unwrap();

    assert!(cluster::set_default(Some(cluster.clone())).is_none());
    assert!(cluster::default().is_some());

    let result = cluster::on_worker(Task::new("echo", 7), ActivityOptions::default());
    assert_eq!(result.unwrap(), Value::from(7));

    assert!(cluster::set_default(None).is_some());
    assert!(matches!(
        cluster::on_worker(Task::call("whoami"), ActivityOptions::default()),
        Err(ActivityError::Shutdown { .. })
    ));

    cluster.shutdown();
}

#[test]
pub fn late_init_steps_reach_running_workers() {
    let cluster = Cluster::start(&config(false), registry()).unwrap();
    let workers = join_workers(cluster.membership(), cluster.address(), 1);
    let worker = WorkerId(2);

    assert_eq!(
        cluster
            .on_worker(Task::call("whoami"), ActivityOptions::default())
            .unwrap(),
        Value::from(worker.0)
    );

    cluster.add_init_step(Task::new("append", 1)).unwrap();

    let log = cluster
        .on_worker(Task::new("binding", "log"), ActivityOptions::default())
        .unwrap();
    assert_eq!(log, Value::Sequence(vec![Value::from(1)]));
    assert_eq!(cluster.ledger().worker_level(worker), 1);

    cluster.shutdown();

    for handle in workers {
        assert!(handle.join().unwrap().is_ok());
    }
}
