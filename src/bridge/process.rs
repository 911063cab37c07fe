//! Bridge backed by an external script, one process per fetch.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::{BridgeError, FetchOptions, MailBridge, wire};
use crate::config::BridgeConfig;
use crate::constants::STDERR_TAIL_LINES;
use crate::snapshot::FolderSnapshot;

/// Runs `command args... <folder> --max-items N [--since RFC3339]` and reads
/// one JSON document from its stdout.
#[derive(Debug, Clone)]
pub struct ScriptBridge {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    not_found_exit_code: Option<i32>,
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ScriptBridge {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            not_found_exit_code: None,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone(), config.timeout())
            .with_not_found_exit_code(config.not_found_exit_code)
    }

    pub fn with_not_found_exit_code(mut self, code: Option<i32>) -> Self {
        self.not_found_exit_code = code;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, folder_path: &str, options: &FetchOptions) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(folder_path)
            .arg("--max-items")
            .arg(options.max_items.to_string());
        if let Some(since) = options.since {
            command.arg("--since").arg(since.to_rfc3339());
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn classify(&self, folder_path: &str, output: ProcessOutput) -> Result<FolderSnapshot, BridgeError> {
        if output.status.success() {
            return wire::parse_output(folder_path, &output.stdout);
        }

        if let Some(error) = wire::error_document(folder_path, &output.stdout) {
            return Err(error);
        }

        let tail = stderr_tail(&output.stderr);
        if self.not_found_exit_code.is_some() && output.status.code() == self.not_found_exit_code {
            let detail = if tail.is_empty() {
                folder_path.to_string()
            } else {
                tail
            };
            return Err(BridgeError::NotFound(detail));
        }

        Err(BridgeError::Fault(format!(
            "'{}' exited with {}{}",
            self.program,
            output.status,
            if tail.is_empty() {
                String::new()
            } else {
                format!(": {}", tail)
            }
        )))
    }
}

impl MailBridge for ScriptBridge {
    async fn fetch_snapshot(
        &self,
        folder_path: &str,
        options: &FetchOptions,
    ) -> Result<FolderSnapshot, BridgeError> {
        tracing::debug!(
            "Bridge: running '{}' for '{}' (max_items={})",
            self.program,
            folder_path,
            options.max_items
        );

        let mut child = self.command(folder_path, options).spawn().map_err(|e| {
            BridgeError::Fault(format!("failed to start '{}': {}", self.program, e))
        })?;

        let collected = tokio::time::timeout(self.timeout, collect_output(&mut child)).await;
        let output = match collected {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                child.kill().await.ok();
                return Err(BridgeError::Fault(format!(
                    "failed to read output of '{}': {}",
                    self.program, e
                )));
            }
            Err(_) => {
                tracing::warn!(
                    "Bridge: '{}' for '{}' timed out after {:?}, killing it",
                    self.program,
                    folder_path,
                    self.timeout
                );
                // kill() also reaps the child so no zombie is left behind
                if let Err(e) = child.kill().await {
                    tracing::debug!("Bridge: kill after timeout failed: {}", e);
                }
                return Err(BridgeError::Timeout(self.timeout));
            }
        };

        self.classify(folder_path, output)
    }
}

/// Drain stdout and stderr while waiting for exit, so a chatty script can't
/// block on a full pipe.
async fn collect_output(child: &mut Child) -> std::io::Result<ProcessOutput> {
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (stdout, stderr, status) = tokio::try_join!(read_stdout, read_stderr, child.wait())?;

    Ok(ProcessOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}
