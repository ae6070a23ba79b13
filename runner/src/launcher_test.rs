use crate::{
    config::{ConfigErrors, LauncherConfig},
    launcher::{shell_quote, Launcher, LauncherError, WorkerCommand},
};
use std::{collections::BTreeMap, path::PathBuf};

fn launcher(yaml: &str) -> Result<Launcher, ConfigErrors> {
    let config: LauncherConfig = serde_yaml::from_str(yaml).unwrap();

    Launcher::load(&config)
}

fn command() -> WorkerCommand {
    WorkerCommand {
        exe: PathBuf::from("/opt/flock/bin/flock"),
        controller: "10.0.0.1:4000".parse().unwrap(),
        cookie: String::from("s3cret"),
    }
}

#[test]
pub fn quoting_only_where_needed() {
    assert_eq!(shell_quote("plain-value_1.2"), "plain-value_1.2");
    assert_eq!(shell_quote("two words"), "'two words'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
    assert_eq!(shell_quote(""), "''");
}

#[test]
pub fn worker_command_renders_as_shell_line() {
    assert_eq!(
        command().to_string(),
        "/opt/flock/bin/flock worker --controller 10.0.0.1:4000 --cookie s3cret"
    );

    let spaced = WorkerCommand {
        cookie: String::from("with space"),
        ..command()
    };
    assert!(spaced.to_string().ends_with("--cookie 'with space'"));
}

#[test]
pub fn local_launcher_defaults_to_cpu_count() {
    let local = launcher("name: local").unwrap();

    assert_eq!(local.expected_worker_count(), num_cpus::get());
    assert_eq!(local.build_start_command(&command()), command().to_string());

    let sized = launcher("{name: local, parameter: {workers: 4}}").unwrap();
    assert_eq!(sized.expected_worker_count(), 4);
}

#[test]
pub fn invalid_parameters_are_rejected() {
    assert!(matches!(
        launcher("{name: local, parameter: {workers: many}}"),
        Err(ConfigErrors::FailedLoadLauncher(LauncherError::InvalidParameter { .. }))
    ));
    assert!(matches!(
        launcher("{name: slurm, parameter: {workers: 0}}"),
        Err(ConfigErrors::FailedLoadLauncher(LauncherError::InvalidParameter { .. }))
    ));
    assert!(matches!(
        launcher("name: kubernetes"),
        Err(ConfigErrors::UnsupportedLauncher(name)) if name == "kubernetes"
    ));
}

#[test]
pub fn slurm_builds_a_batch_command() {
    let slurm = launcher(
        r#"
name: slurm
parameter:
  workers: 16
  partition: short
  time_limit: "01:00:00"
  extra: ["--mem=4G"]
"#,
    )
    .unwrap();

    assert_eq!(slurm.expected_worker_count(), 16);
    assert_eq!(
        slurm.build_start_command(&command()),
        "sbatch --job-name=flock-worker --ntasks=16 --partition=short --time=01:00:00 --mem=4G \
         '--wrap=srun /opt/flock/bin/flock worker --controller 10.0.0.1:4000 --cookie s3cret'"
    );
}

#[test]
pub fn manual_launcher_expects_nobody() {
    let manual = Launcher::load(&LauncherConfig {
        name: String::from("Manual"),
        parameter: BTreeMap::new(),
    })
    .unwrap();

    assert_eq!(manual, Launcher::Manual);
    assert_eq!(manual.expected_worker_count(), 0);
    assert!(manual.launch(&command()).unwrap().is_empty());
}

#[test]
pub fn local_launcher_spawns_shell_children() {
    let Launcher::Local(local) = launcher("{name: local, parameter: {workers: 2}}").unwrap() else {
        panic!("expected a local launcher");
    };

    let children = local.spawn_local("exit 3").unwrap();
    assert_eq!(children.len(), 2);

    for mut child in children {
        assert_eq!(child.wait().unwrap().code(), Some(3));
    }
}
