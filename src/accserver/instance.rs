use std::io;
use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use async_std::channel;
use async_std::channel::{ Sender, Receiver };
use async_std::future;
use async_std::prelude::*;
use async_std::process::{ Child, Command, ExitStatus, Stdio };
use async_std::task;

use crate::accserver::server_log::{ ServerLog, LogLine };

/// Lifecycle of a supervised accServer process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Stopped,
    Stopping,
    Running,
}

impl InstanceState {
    /// Resolves the state of a possibly missing instance; no instance is always stopped
    pub fn of(instance: Option<&Instance>) -> InstanceState {
        instance.map_or(InstanceState::Stopped, Instance::state)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("server executable {0} does not exist")]
    ExecutableNotFound(PathBuf),
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no output pipe for {0}")]
    MissingStdout(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StopError {
    #[error("server is already stopped")]
    AlreadyStopped,
}

#[derive(Default)]
struct Lifecycle {
    kill_requested: AtomicBool,
    exited: AtomicBool,
}

/// A running (or formerly running) accServer process
#[derive(Clone)]
pub struct Instance {
    pid: u32,
    lifecycle: Arc<Lifecycle>,
    kill: Sender<()>,
    /// Closed by the waiter task once the process has exited
    exited: Receiver<()>,
    log: ServerLog,
}

fn make_command(executable: &Path, exe_wrapper: Option<&str>) -> (Command, String) {
    let mut args = vec![];
    let mut command = match exe_wrapper {
        Some(wrapper) => {
            args.push(wrapper.to_string());
            let mut command = Command::new(wrapper);
            command.arg(executable);
            command
        },
        None => Command::new(executable),
    };
    args.push(executable.display().to_string());

    if let Some(dir) = executable.parent() {
        command.current_dir(dir);
    }
    command.stdin(Stdio::null()).stdout(Stdio::piped());

    (command, format!("'{}'", args.join("' '")))
}

impl Instance {
    /// Launches the server, optionally through a wrapper such as wine.
    ///
    /// The process runs in the directory of the executable. Its output is captured in the
    /// server log, which is echoed at debug level.
    pub fn start(executable: &Path, exe_wrapper: Option<&str>) -> Result<Instance, StartupError> {
        let executable = executable.canonicalize()
            .map_err(|_err| StartupError::ExecutableNotFound(executable.to_path_buf()))?;

        let (mut command, description) = make_command(&executable, exe_wrapper);
        info!("Starting {}...", description);

        let mut child = command.spawn()
            .map_err(|source| StartupError::Launch { command: description.clone(), source })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                if let Err(err) = child.kill() {
                    error!("Failed to kill {} without output pipe: {}", description, err);
                }
                return Err(StartupError::MissingStdout(description));
            },
        };

        let log = ServerLog::spawn(stdout);
        let lifecycle = Arc::new(Lifecycle::default());
        let (kill_sender, kill_receiver) = channel::bounded(1);
        let (exited_sender, exited_receiver) = channel::bounded(1);

        let instance = Instance {
            pid: child.id(),
            lifecycle: lifecycle.clone(),
            kill: kill_sender,
            exited: exited_receiver,
            log: log.clone(),
        };

        task::spawn(wait_for_exit(child, log, lifecycle, kill_receiver, exited_sender));
        task::spawn(echo_log(instance.new_log_channel()));

        Ok(instance)
    }

    pub fn state(&self) -> InstanceState {
        if self.lifecycle.exited.load(Ordering::SeqCst) {
            InstanceState::Stopped
        } else if self.lifecycle.kill_requested.load(Ordering::SeqCst) {
            InstanceState::Stopping
        } else {
            InstanceState::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == InstanceState::Running
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kills the server process; the state is `Stopping` until the process has exited
    pub fn stop(&self) -> Result<(), StopError> {
        if self.state() == InstanceState::Stopped {
            return Err(StopError::AlreadyStopped);
        }

        self.lifecycle.kill_requested.store(true, Ordering::SeqCst);
        if self.kill.try_send(()).is_err() {
            debug!("Kill of accServer {} already requested", self.pid);
        }
        Ok(())
    }

    /// Waits until the server process has exited
    pub async fn wait(&self) {
        // Nothing is ever sent, the channel only closes
        while self.exited.recv().await.is_ok() {}
    }

    /// Creates a new channel over which the complete server log is sent, starting from server start.
    ///
    /// The channel is closed when the server output ends.
    pub fn new_log_channel(&self) -> Receiver<LogLine> {
        self.log.attach()
    }
}

enum Exit {
    Exited(io::Result<ExitStatus>),
    KillRequested,
}

async fn wait_for_exit(mut child: Child, log: ServerLog, lifecycle: Arc<Lifecycle>, kill: Receiver<()>, _exited: Sender<()>) {
    let exit = {
        let exited = async {
            log.wait().await;
            Exit::Exited(child.status().await)
        };
        let kill_requested = async {
            if kill.recv().await.is_err() {
                future::pending::<()>().await;
            }
            Exit::KillRequested
        };
        exited.race(kill_requested).await
    };

    let status = match exit {
        Exit::Exited(status) => status,
        Exit::KillRequested => {
            info!("Killing accServer...");
            if let Err(err) = child.kill() {
                error!("Failed to kill accServer: {}", err);
            }
            child.status().await
        },
    };

    match status {
        Ok(status) if status.success() => info!("The accServer process has exited normally"),
        Ok(status) if lifecycle.kill_requested.load(Ordering::SeqCst) => info!("The accServer process was stopped ({})", status),
        Ok(status) => warn!("The accServer process has exited abnormally ({})", status),
        Err(err) => error!("Error waiting for accServer process to exit: {}", err),
    }

    lifecycle.exited.store(true, Ordering::SeqCst);
}

async fn echo_log(log: Receiver<LogLine>) {
    while let Ok(line) = log.recv().await {
        debug!(" >>>  {}", line.text);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use async_std::future::timeout;

    fn write_script(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("accServer.sh");
        fs::write(&path, contents).unwrap();
        path
    }

    async fn collect_log(instance: &Instance) -> Vec<String> {
        let channel = instance.new_log_channel();
        let mut lines = vec![];
        while let Ok(line) = timeout(Duration::from_secs(5), channel.recv()).await.expect("log not closed in time") {
            lines.push(line.text);
        }
        lines
    }

    #[async_std::test]
    async fn runs_through_wrapper_in_executable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo 'Server starting with version 255'\npwd\n");

        let instance = Instance::start(&script, Some("sh")).unwrap();
        let lines = collect_log(&instance).await;
        timeout(Duration::from_secs(5), instance.wait()).await.expect("process did not exit");

        let working_dir = dir.path().canonicalize().unwrap();
        assert_eq!(vec!["Server starting with version 255".to_string(), working_dir.display().to_string()], lines);
        assert_eq!(InstanceState::Stopped, instance.state());
    }

    #[async_std::test]
    async fn stop_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo started\nexec sleep 30\n");

        let instance = Instance::start(&script, Some("sh")).unwrap();
        assert_eq!(InstanceState::Running, instance.state());
        assert!(instance.is_running());

        instance.stop().unwrap();
        assert_ne!(InstanceState::Running, instance.state());

        timeout(Duration::from_secs(5), instance.wait()).await.expect("process was not killed");
        assert_eq!(InstanceState::Stopped, instance.state());
        assert_eq!(vec!["started".to_string()], collect_log(&instance).await);
    }

    #[async_std::test]
    async fn stopping_a_stopped_instance_fails() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "exit 3\n");

        let instance = Instance::start(&script, Some("sh")).unwrap();
        timeout(Duration::from_secs(5), instance.wait()).await.expect("process did not exit");

        assert_eq!(Err(StopError::AlreadyStopped), instance.stop());
    }

    #[test]
    fn missing_instance_is_stopped() {
        assert_eq!(InstanceState::Stopped, InstanceState::of(None));
    }

    #[test]
    fn missing_executable_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let result = Instance::start(&dir.path().join("accServer.exe"), None);
        assert!(matches!(result, Err(StartupError::ExecutableNotFound(_))));
    }

    #[test]
    fn missing_wrapper_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "exit 0\n");
        let result = Instance::start(&script, Some("no-such-wrapper-for-accserver"));
        assert!(matches!(result, Err(StartupError::Launch { .. })));
    }
}
