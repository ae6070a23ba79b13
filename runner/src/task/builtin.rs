use super::{parse_args, TaskContext, TaskError, TaskRegistry};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    io::Read,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// register every builtin function
pub fn register_all(registry: TaskRegistry) -> TaskRegistry {
    registry
        .register("bind", bind)
        .register("binding", binding)
        .register("setenv", setenv)
        .register("echo", |_, args| Ok(args.clone()))
        .register("sleep", sleep)
        .register("exec", exec)
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct BindArgs {
    name: String,
    value: Value,
}

/// create a process wide binding, meant to be used as an init step
fn bind(context: &TaskContext<'_>, args: &Value) -> Result<Value, TaskError> {
    let args: BindArgs = parse_args(args)?;

    debug!(worker = %context.worker, name = %args.name, "Creating binding");
    context.bind(args.name, args.value);

    Ok(Value::Null)
}

fn binding(context: &TaskContext<'_>, args: &Value) -> Result<Value, TaskError> {
    match args.as_str() {
        Some(name) => context.binding(name),
        None => Err(TaskError::invalid_argument(
            "binding expects the name of the binding as a string",
        )),
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct SetenvArgs {
    name: String,
    value: String,
}

fn setenv(_: &TaskContext<'_>, args: &Value) -> Result<Value, TaskError> {
    let args: SetenvArgs = parse_args(args)?;

    if args.name.is_empty() || args.name.contains('=') {
        return Err(TaskError::invalid_argument(format!(
            "{:?} is not a valid environment variable name",
            args.name
        )));
    }

    std::env::set_var(&args.name, &args.value);

    Ok(Value::Null)
}

/// sleep for `args` milliseconds
fn sleep(_: &TaskContext<'_>, args: &Value) -> Result<Value, TaskError> {
    match args.as_u64() {
        Some(millis) => {
            thread::sleep(Duration::from_millis(millis));

            Ok(Value::Null)
        }
        None => Err(TaskError::invalid_argument(
            "sleep expects a number of milliseconds",
        )),
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct ExecArgs {
    exec: String,
    #[serde(default)]
    params: Vec<String>,
    timeout_ms: Option<u64>,
}

/// container for information extracted from running an executable
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub runtime_ns: u64,
    pub status: i32,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// run an executable, capturing its output, optionally bounded by a timeout
fn exec(context: &TaskContext<'_>, args: &Value) -> Result<Value, TaskError> {
    let args: ExecArgs = parse_args(args)?;
    let start = Instant::now();

    debug!(worker = %context.worker, exec = %args.exec, params = ?args.params, "Spawning executable");

    let mut child = Command::new(&args.exec)
        .args(args.params.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            TaskError::new(TaskError::IO, format!("failed to spawn {}: {error}", args.exec))
        })?;

    // drain both pipes concurrently, a full pipe would otherwise stall the child
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match args.timeout_ms {
        Some(millis) => match child.wait_timeout(Duration::from_millis(millis)) {
            Ok(Some(status)) => status,
            Ok(None) => {
                // child hasn't exited yet
                let _ = child.kill();
                let _ = child.wait();

                return Err(TaskError::new(
                    TaskError::TIMEOUT,
                    format!("{} did not finish within {millis} ms", args.exec),
                ));
            }
            Err(error) => return Err(TaskError::new(TaskError::IO, error.to_string())),
        },
        None => child
            .wait()
            .map_err(|error| TaskError::new(TaskError::IO, error.to_string()))?,
    };

    let output = RunOutput {
        runtime_ns: start.elapsed().as_nanos() as u64,
        status: status.code().unwrap_or(-1),
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    debug!(
        "Finished in {} ns | status: {}",
        output.runtime_ns, output.success
    );
    trace!("Output: {}", output.stdout);

    serde_yaml::to_value(output).map_err(|error| TaskError::new(TaskError::IO, error.to_string()))
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
