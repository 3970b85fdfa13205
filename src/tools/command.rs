use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::parse::{default_timeout_ms, parse_params, positive_timeout_ms, require_positive};
use super::{Params, Tool, ToolError};

pub const PROCESS: &str = "process";

/// How long to wait for output pipes to drain once the process is gone.
const PIPE_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessParams {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Milliseconds.
    #[serde(default = "default_timeout_ms", deserialize_with = "positive_timeout_ms")]
    pub timeout: u64,
    /// Merged on top of the inherited environment.
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
}

impl ProcessParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: default_timeout_ms(),
            env: None,
        }
    }
}

/// Result of running a command. A command that ran but failed is reported
/// here with `success: false`, not as a [`ToolError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl ProcessOutput {
    fn succeeded(stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            error: None,
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit_code: Some(0),
            timed_out: false,
        }
    }

    fn failed(error: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            stdout: Some(stdout).filter(|s| !s.is_empty()),
            stderr: Some(stderr).filter(|s| !s.is_empty()),
            exit_code: None,
            timed_out: false,
        }
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Collect a pipe chunk by chunk so output read before a kill survives.
fn capture<R>(pipe: Option<R>) -> (Captured, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink: Captured = Arc::default();
    let task = pipe.map(|mut pipe| {
        let sink = Arc::clone(&sink);
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut buf) = sink.lock() {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        })
    });
    (sink, task)
}

async fn drain(sink: Captured, task: Option<JoinHandle<()>>) -> String {
    if let Some(task) = task {
        let _ = tokio::time::timeout(PIPE_DRAIN, task).await;
    }
    let bytes = sink.lock().map(|b| b.clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

fn shell(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        #[cfg(unix)]
        c.process_group(0);
        c
    }
}

/// Kill the shell and everything it started.
async fn kill_tree(child: &mut Child) {
    kill_group(child);
    let _ = child.kill().await;
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: plain syscall; the child leads its own process group.
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Runs shell commands.
#[derive(Debug, Clone, Default)]
pub struct ProcessTool;

impl ProcessTool {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, params: &Params) -> Result<ProcessParams, ToolError> {
        let request: ProcessParams = parse_params(PROCESS, params)?;
        require_positive(PROCESS, "timeout", request.timeout)?;
        Ok(request)
    }

    pub async fn run(&self, params: ProcessParams) -> ProcessOutput {
        let mut cmd = shell(&params.command);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(env) = &params.env {
            cmd.envs(env);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %params.command, timeout_ms = params.timeout, "spawning command");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutput::failed(
                    format!("failed to spawn command '{}': {e}", params.command),
                    String::new(),
                    String::new(),
                );
            }
        };

        let (out_sink, out_task) = capture(child.stdout.take());
        let (err_sink, err_task) = capture(child.stderr.take());

        let waited = tokio::time::timeout(Duration::from_millis(params.timeout), child.wait()).await;
        if waited.is_err() {
            kill_tree(&mut child).await;
        }
        let stdout = drain(out_sink, out_task).await;
        let stderr = drain(err_sink, err_task).await;

        match waited {
            Ok(Ok(status)) if status.success() => ProcessOutput::succeeded(stdout, stderr),
            Ok(Ok(status)) => {
                let message = match status.code() {
                    Some(code) => format!("command '{}' exited with code {code}", params.command),
                    None => format!("command '{}' was terminated by a signal", params.command),
                };
                let mut output = ProcessOutput::failed(message, stdout, stderr);
                output.exit_code = status.code();
                output
            }
            Ok(Err(e)) => ProcessOutput::failed(format!("failed to wait for command: {e}"), stdout, stderr),
            Err(_) => {
                warn!(command = %params.command, timeout_ms = params.timeout, "command timed out");
                let mut output = ProcessOutput::failed(
                    format!("command '{}' timed out after {}ms", params.command, params.timeout),
                    stdout,
                    stderr,
                );
                output.timed_out = true;
                output
            }
        }
    }
}

#[async_trait]
impl Tool for ProcessTool {
    fn name(&self) -> &str {
        PROCESS
    }

    fn description(&self) -> &str {
        "Provides system process operations like executing commands"
    }

    fn validate(&self, params: &Params) -> bool {
        self.parse(params).is_ok()
    }

    async fn execute(&self, params: &Params) -> Result<Value, ToolError> {
        let request = self.parse(params)?;
        let output = self.run(request).await;
        serde_json::to_value(output).map_err(|e| ToolError::Execution(e.to_string()))
    }
}
