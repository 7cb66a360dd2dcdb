use crate::errors::ExecError;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    /// `code` is `None` when the process died from a signal.
    Failed { cmd: String, code: Option<i32> },
    /// No output for the stuck interval; the process was killed.
    Stuck { cmd: String },
    Stopped,
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Runs a command list as one `sh -c` script, so `cd` and variables carry over.
#[derive(Debug, Clone)]
pub struct Executor {
    stuck_interval: Duration,
}

impl Executor {
    pub fn new(stuck_interval: Duration) -> Self {
        Self { stuck_interval }
    }

    /// Stops at the first command that does not succeed. Output lines go to `on_line`.
    pub async fn run(
        &self,
        cmds: &[String],
        dir: &Path,
        stop: &CancellationToken,
        mut on_line: impl FnMut(String),
    ) -> Result<ExecOutcome, ExecError> {
        if cmds.is_empty() {
            return Ok(ExecOutcome::Success);
        }
        if stop.is_cancelled() {
            return Ok(ExecOutcome::Stopped);
        }
        let script = pack_commands(cmds);
        self.run_script(&script, dir, stop, &mut on_line).await
    }

    async fn run_script(
        &self,
        cmd: &str,
        dir: &Path,
        stop: &CancellationToken,
        on_line: &mut impl FnMut(String),
    ) -> Result<ExecOutcome, ExecError> {
        debug!(cmd = %cmd, dir = %dir.display(), "running command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            })?;

        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());
        let mut last_output = Instant::now();

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                _ = stop.cancelled() => {
                    kill(&mut child, cmd).await;
                    return Ok(ExecOutcome::Stopped);
                }
                _ = tokio::time::sleep_until(last_output + self.stuck_interval) => {
                    warn!(cmd = %cmd, "command stuck, killing it");
                    kill(&mut child, cmd).await;
                    return Ok(ExecOutcome::Stuck { cmd: cmd.to_string() });
                }
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        last_output = Instant::now();
                        on_line(line);
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        last_output = Instant::now();
                        on_line(line);
                    }
                    None => stderr = None,
                },
            }
        }

        let status = tokio::select! {
            _ = stop.cancelled() => {
                kill(&mut child, cmd).await;
                return Ok(ExecOutcome::Stopped);
            }
            _ = tokio::time::sleep_until(last_output + self.stuck_interval) => {
                warn!(cmd = %cmd, "command stuck after closing its output, killing it");
                kill(&mut child, cmd).await;
                return Ok(ExecOutcome::Stuck { cmd: cmd.to_string() });
            }
            status = child.wait() => status.map_err(|e| ExecError::Wait {
                cmd: cmd.to_string(),
                reason: e.to_string(),
            })?,
        };

        if status.success() {
            Ok(ExecOutcome::Success)
        } else {
            Ok(ExecOutcome::Failed {
                cmd: cmd.to_string(),
                code: status.code(),
            })
        }
    }
}

/// Chains the commands with `&&`; each one is braced so a `;` or `||` inside
/// it cannot escape the chain.
fn pack_commands(cmds: &[String]) -> String {
    cmds.iter()
        .map(|cmd| format!("{{ {cmd}\n}}"))
        .collect::<Vec<_>>()
        .join(" && ")
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<R>>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines.as_mut()?.next_line().await {
        Ok(line) => line,
        Err(error) => {
            debug!(error = %error, "command output unreadable");
            None
        }
    }
}

async fn kill(child: &mut Child, cmd: &str) {
    if let Err(error) = child.kill().await {
        debug!(cmd = %cmd, error = %error, "kill failed");
    }
}
