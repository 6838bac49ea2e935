//! Tool server process management
//!
//! Spawns the configured tool server, waits for its readiness line on
//! stderr, and hands its stdin/stdout to a [`StdioRpcClient`].

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::ToolServerConfig;
use crate::rpc::{ChannelCloser, ChannelState, ClientOptions, StdioRpcClient};
use crate::{Error, Result};

/// A spawned tool server owned by its client
///
/// The child itself lives in an exit watcher task, which closes the channel
/// as soon as the process exits.
pub struct ToolProcess {
    name: String,
    pid: Option<u32>,
    exit_task: Option<JoinHandle<()>>,
    kill: Option<oneshot::Sender<()>>,
    stderr_task: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl ToolProcess {
    fn is_running(&self) -> bool {
        self.exit_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Wait for a graceful exit, then kill.
    ///
    /// Stdin must already be closed for the server to notice.
    pub(crate) async fn terminate(&mut self) {
        if let Some(mut exit_task) = self.exit_task.take() {
            if tokio::time::timeout(self.shutdown_grace, &mut exit_task)
                .await
                .is_err()
            {
                tracing::warn!("Tool server '{}' did not exit gracefully, killing...", self.name);
                if let Some(kill) = self.kill.take() {
                    let _ = kill.send(());
                }
                let _ = exit_task.await;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        // Dropping the child inside the aborted task kills it (kill_on_drop)
        if let Some(task) = self.exit_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Own the child until it exits, then close the channel.
///
/// A grandchild holding stdout open keeps the reader from seeing EOF, so the
/// exit itself is what fails pending calls.
async fn watch_exit(
    name: String,
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    closer: ChannelCloser,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill => {
            if let Err(e) = child.start_kill() {
                tracing::error!("Failed to kill tool server '{}': {}", name, e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            tracing::info!("Tool server '{}' exited with status: {}", name, status);
            closer.close(exit_reason(status));
        }
        Err(e) => {
            tracing::error!("Failed waiting for tool server '{}': {}", name, e);
            closer.close(format!("lost track of tool server process: {}", e));
        }
    }
}

/// Forward one line of server stderr
fn log_server_stderr(name: &str, line: &str) {
    tracing::warn!("[{} stderr] {}", name, line);
}

fn exit_reason(status: ExitStatus) -> String {
    format!("tool server exited ({})", status)
}

impl StdioRpcClient {
    /// OS process id of the spawned tool server, while it is running
    pub async fn process_id(&self) -> Option<u32> {
        match self.process() {
            Some(process) => {
                let process = process.lock().await;
                process.pid.filter(|_| process.is_running())
            }
            None => None,
        }
    }

    /// Spawn the configured tool server and return a Ready client
    pub async fn spawn(config: &ToolServerConfig) -> Result<Self> {
        config.validate()?;
        let program = config.resolve_command()?;

        tracing::info!("Spawning tool server '{}' from: {:?}", config.name, program);

        let mut command = Command::new(&program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("Failed to capture stderr".to_string()))?;

        let options = ClientOptions {
            framing: config.framing,
            request_timeout: config.request_timeout(),
        };
        let mut client = StdioRpcClient::with_state(stdout, stdin, options, ChannelState::Starting);

        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel();
        let exit_task = tokio::spawn(watch_exit(
            config.name.clone(),
            child,
            kill_rx,
            client.closer(),
        ));

        let mut stderr_lines = BufReader::new(stderr).lines();
        let readiness = wait_for_ready(
            &config.name,
            &mut stderr_lines,
            config.ready_marker.as_deref(),
            config.startup_timeout(),
        )
        .await;

        let name = config.name.clone();
        let stderr_task = tokio::spawn(async move {
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                log_server_stderr(&name, &line);
            }
            tracing::debug!("Tool server '{}' stderr closed", name);
        });

        client.attach_process(ToolProcess {
            name: config.name.clone(),
            pid,
            exit_task: Some(exit_task),
            kill: Some(kill_tx),
            stderr_task: Some(stderr_task),
            shutdown_grace: config.shutdown_grace(),
        });

        if let Err(e) = readiness {
            client.close(e.to_string());
            client.shutdown().await?;
            return Err(e);
        }

        client.mark_ready();
        if client.state() == ChannelState::Closed {
            return Err(Error::Startup(format!(
                "tool server '{}' closed its channel during startup",
                config.name
            )));
        }

        tracing::info!("Tool server '{}' ready", config.name);
        Ok(client)
    }
}

/// Block until a stderr line contains `marker`.
///
/// Without a marker the server is ready as soon as it is spawned.
async fn wait_for_ready(
    name: &str,
    lines: &mut tokio::io::Lines<BufReader<ChildStderr>>,
    marker: Option<&str>,
    startup_timeout: Duration,
) -> Result<()> {
    let Some(marker) = marker else {
        return Ok(());
    };

    let scan = async {
        while let Some(line) = lines.next_line().await? {
            log_server_stderr(name, &line);
            if line.contains(marker) {
                return Ok(true);
            }
        }
        Ok::<bool, std::io::Error>(false)
    };

    match tokio::time::timeout(startup_timeout, scan).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(Error::Startup(format!(
            "'{}' closed stderr before printing readiness marker '{}'",
            name, marker
        ))),
        Ok(Err(e)) => Err(Error::Startup(format!(
            "failed reading stderr of '{}': {}",
            name, e
        ))),
        Err(_) => Err(Error::Startup(format!(
            "'{}' did not print readiness marker '{}' within {:?}",
            name, marker, startup_timeout
        ))),
    }
}
