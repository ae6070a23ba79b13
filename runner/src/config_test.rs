use crate::{
    config::{ClusterConfig, ConfigErrors, COOKIE_ENV, WORKER_TIMEOUT_ENV},
    launcher::Launcher,
    task::TaskRegistry,
};
use std::{env, time::Duration};

const CONFIG: &str = r#"
bind: 0.0.0.0:7000
cookie: secret
pool:
  max_occupancy: 2
launcher:
  name: Local
  parameter:
    workers: 3
init:
  - function: bind
    args: {name: base, value: 1}
activities:
  - label: first
    task: {function: echo, args: 1}
    tries: 3
    max_time: 1.5
  - task: {function: sleep, args: 10}
"#;

#[test]
pub fn parses_with_defaults() {
    let config: ClusterConfig = serde_yaml::from_str(CONFIG).unwrap();

    assert_eq!(config.bind, "0.0.0.0:7000");
    assert_eq!(config.pool.max_occupancy, 2);
    assert!(config.pool.controller_fallback);
    assert!(config.pool.initialize);
    assert!(config.signal_on_terminate);
    assert_eq!(config.scheduler.idle_backoff_min_us, 10);
    assert_eq!(config.init.len(), 1);
    assert_eq!(config.activities.len(), 2);
    assert_eq!(config.activities[1].tries, 1);

    let options = config.activities[0].options();
    assert_eq!(options.label.as_deref(), Some("first"));
    assert_eq!(options.tries, 3);
    assert_eq!(options.max_time, Some(Duration::from_millis(1500)));

    let empty: ClusterConfig = serde_yaml::from_str("{}").unwrap();
    assert_eq!(empty, ClusterConfig::default());
}

#[test]
pub fn unknown_fields_are_rejected() {
    assert!(serde_yaml::from_str::<ClusterConfig>("workers: 3").is_err());
    assert!(serde_yaml::from_str::<ClusterConfig>("pool: {size: 3}").is_err());
}

#[test]
pub fn missing_file_is_an_io_error() {
    assert!(matches!(
        ClusterConfig::load("/nonexistent/flock.yml"),
        Err(ConfigErrors::Io(_))
    ));
}

#[test]
pub fn preflight_accepts_a_valid_config() {
    let mut config: ClusterConfig = serde_yaml::from_str(CONFIG).unwrap();

    assert!(!config.preflight_checks(&TaskRegistry::with_builtins()));
    assert_eq!(config.launcher.name, "local");
    assert!(matches!(
        Launcher::load(&config.launcher).unwrap(),
        Launcher::Local(ref launcher) if launcher.workers == 3
    ));
}

#[test]
pub fn preflight_reports_every_problem() {
    let mut config: ClusterConfig = serde_yaml::from_str(
        r#"
launcher: {name: kubernetes}
init:
  - function: missing
activities:
  - task: {function: also_missing}
    tries: 0
"#,
    )
    .unwrap();

    assert!(config.preflight_checks(&TaskRegistry::with_builtins()));
    // fixable problems are fixed
    assert_eq!(config.activities[0].tries, 1);
}

#[test]
pub fn preflight_fixes_zero_occupancy() {
    let mut config: ClusterConfig = serde_yaml::from_str("pool: {max_occupancy: 0}").unwrap();

    assert!(!config.preflight_checks(&TaskRegistry::with_builtins()));
    assert_eq!(config.pool.max_occupancy, 1);
}

#[test]
pub fn environment_provides_fallbacks() {
    let mut config = ClusterConfig::default();

    config.worker_timeout_secs = Some(2.5);
    assert_eq!(config.worker_timeout(), Duration::from_millis(2500));

    config.worker_timeout_secs = None;
    env::set_var(WORKER_TIMEOUT_ENV, "0.25");
    assert_eq!(config.worker_timeout(), Duration::from_millis(250));

    env::set_var(WORKER_TIMEOUT_ENV, "soon");
    assert_eq!(config.worker_timeout(), Duration::from_secs(60));
    env::remove_var(WORKER_TIMEOUT_ENV);
    assert_eq!(config.worker_timeout(), Duration::from_secs(60));

    env::set_var(COOKIE_ENV, "from-env");
    assert_eq!(config.cookie().unwrap().to_string(), "from-env");
    env::remove_var(COOKIE_ENV);

    config.cookie = Some(String::from("from-config"));
    assert_eq!(config.cookie().unwrap().to_string(), "from-config");

    config.cookie = Some(String::from("a cookie that is far too long"));
    assert!(matches!(config.cookie(), Err(ConfigErrors::InvalidCookie(_))));
}
