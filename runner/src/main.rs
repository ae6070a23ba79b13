use clap::{Parser, Subcommand};
use flock::{
    cluster::{self, Cluster},
    config::{ClusterConfig, COOKIE_ENV},
    launcher::{Launcher, WorkerCommand},
    membership::Cookie,
    task::TaskRegistry,
    worker::Worker,
};
use serde_yaml::{Mapping, Value};
use std::{env, path::PathBuf, process::exit, str::FromStr, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::{OptionExt, ResultExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run tasks on an elastic pool of worker processes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a controller, run the configured activities and print their results as YAML
    Controller {
        /// cluster configuration, defaults are used if omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// only print the command that starts a worker
        #[arg(long)]
        print_command: bool,
    },
    /// Join a controller and execute tasks until it lets us go
    Worker {
        /// address of the controller, as printed by it
        #[arg(long)]
        controller: String,
        /// shared secret, falls back to FLOCK_COOKIE
        #[arg(long)]
        cookie: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Controller {
            config,
            print_command,
        } => controller(config, print_command),
        Commands::Worker { controller, cookie } => worker(controller, cookie),
    }
}

fn controller(path: Option<PathBuf>, print_command: bool) {
    let mut config = match path {
        Some(path) => ClusterConfig::load(&path).unwrap_or_log(),
        None => ClusterConfig::default(),
    };
    let registry = TaskRegistry::with_builtins();

    if config.preflight_checks(&registry) {
        error!("Aborting, the configuration contains errors");
        exit(1);
    }

    let launcher = Launcher::load(&config.launcher).unwrap_or_log();
    let cluster = Cluster::start(&config, registry).unwrap_or_log();
    cluster::set_default(Some(cluster.clone()));

    let command =
        WorkerCommand::current(cluster.address(), cluster.membership().cookie()).unwrap_or_log();

    if print_command {
        println!("{}", launcher.build_start_command(&command));
        cluster.shutdown();

        return;
    }

    for task in config.init.iter() {
        if let Err(e) = cluster.add_init_step(task.clone()) {
            error!("Init step {task} failed on the controller: {e}");
            cluster.shutdown();
            exit(1);
        }
    }

    let mut children = launcher.launch(&command).unwrap_or_log();
    let expected = launcher.expected_worker_count();

    if expected > 0
        && !cluster
            .membership()
            .wait_for_workers(expected, config.worker_timeout())
    {
        warn!(
            "Only {} of {expected} workers joined within {:?}, continuing anyway",
            cluster.membership().len(),
            config.worker_timeout()
        );
    }

    let handles = config
        .activities
        .iter()
        .map(|activity| cluster.submit(activity.task.clone(), activity.options()))
        .collect::<Vec<_>>();

    let mut results = Mapping::new();
    let mut failed = 0;

    for handle in handles {
        let entry = match handle.wait() {
            Ok(value) => Mapping::from_iter([(Value::from("ok"), value)]),
            Err(e) => {
                failed += 1;
                Mapping::from_iter([(Value::from("error"), Value::from(e.to_string()))])
            }
        };

        results.insert(Value::from(handle.label()), Value::Mapping(entry));
    }

    match serde_yaml::to_string(&results) {
        Ok(output) => print!("{output}"),
        Err(e) => error!("Failed to serialize results: {e}"),
    }

    cluster.shutdown();
    cluster::set_default(None);

    for child in children.iter_mut() {
        if let Err(e) = child.wait() {
            warn!("Failed to wait for worker process {}: {e}", child.id());
        }
    }

    info!("Done, {failed} of {} activities failed", config.activities.len());

    if failed > 0 {
        exit(2);
    }
}

fn worker(controller: String, cookie: Option<String>) {
    let cookie = cookie
        .or_else(|| env::var(COOKIE_ENV).ok())
        .expect_or_log("A cookie is required, pass --cookie or set FLOCK_COOKIE");
    let cookie = Cookie::from_str(&cookie).unwrap_or_log();
    let timeout = ClusterConfig::default().worker_timeout();

    let worker = Worker::connect(
        controller.as_str(),
        &cookie,
        Arc::new(TaskRegistry::with_builtins()),
        timeout,
    )
    .unwrap_or_log();

    worker.serve().unwrap_or_log();
}
