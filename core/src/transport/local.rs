use super::{guarded, Channel, Interrupt, Invocation, RawResponse, Transport};
use crate::error::TransportError;
use crate::model::{ExecutorKind, ShellFlavor};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

pub const COMMAND_NOT_FOUND: i32 = 127;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs commands on this machine by feeding them to the executor's
/// interpreter on stdin.
pub struct LocalTransport {
    workdir: PathBuf,
}

impl LocalTransport {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn command_for(&self, executor: &ExecutorKind) -> Command {
        let (program, args) = interpreter(executor);
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.workdir.is_dir() {
            command.current_dir(&self.workdir);
        }
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        command
    }
}

fn interpreter(executor: &ExecutorKind) -> (&'static str, &'static [&'static str]) {
    match executor {
        ExecutorKind::Shell {
            flavor: ShellFlavor::Bash,
        } => ("/bin/bash", &[]),
        ExecutorKind::PowerShell if cfg!(windows) => (
            "powershell.exe",
            &["-NoProfile", "-NonInteractive", "-Command", "-"],
        ),
        ExecutorKind::PowerShell => ("pwsh", &["-NoProfile", "-NonInteractive", "-Command", "-"]),
        _ if cfg!(windows) => ("cmd.exe", &[]),
        _ => ("/bin/sh", &[]),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn channel(&self) -> Channel {
        Channel::Local
    }

    async fn upload(
        &mut self,
        source: &Path,
        destination: &str,
        _elevated: bool,
    ) -> Result<(), TransportError> {
        debug!(
            source = %source.display(),
            destination,
            "local runs read supporting files in place"
        );
        Ok(())
    }

    async fn execute(&mut self, invocation: Invocation<'_>) -> Result<RawResponse, TransportError> {
        let mut child = match self.command_for(invocation.executor).spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(executor = %invocation.executor, error = %err, "interpreter not found");
                return Ok(RawResponse {
                    stdout: Vec::new(),
                    stderr: err.to_string().into_bytes(),
                    exit_code: COMMAND_NOT_FOUND,
                });
            }
            Err(err) => return Err(TransportError::unknown(&err)),
        };

        // The interpreter may stop reading mid-script, so the write runs
        // beside the wait and stays under the same timeout.
        let script = format!("{}\n", invocation.command).into_bytes();
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&script).await {
                    debug!(error = %err, "failed to write command to interpreter stdin");
                }
            })
        });

        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

        let waited = guarded(child.wait(), invocation.timeout, invocation.cancel).await;
        if let Some(writer) = writer {
            writer.abort();
        }
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(TransportError::unknown(&err)),
            Err(interrupt) => {
                terminate(&mut child, interrupt).await;
                // Pipes may be held open by orphaned grandchildren.
                drain(stdout_task).await;
                drain(stderr_task).await;
                return Err(interrupt.into_error(invocation.timeout));
            }
        };

        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;
        let exit_code = status.code().unwrap_or(-1);
        Ok(RawResponse {
            stdout,
            stderr,
            exit_code,
        })
    }
}

async fn terminate(child: &mut Child, interrupt: Interrupt) {
    warn!(pid = ?child.id(), reason = ?interrupt, "terminating local command");
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // Negative pid addresses the whole process group created at spawn.
            let group = -(pid as i32);
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "child already exited");
    }
}

async fn read_all<R>(mut pipe: R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    pipe.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

async fn drain(task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(buffer))) => buffer,
        Ok(Ok(Err(err))) => {
            warn!(error = %err, "failed to capture command output");
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!(error = %err, "output capture task failed");
            Vec::new()
        }
        Err(_) => {
            debug!("output capture did not finish after termination");
            Vec::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn sh() -> ExecutorKind {
        ExecutorKind::Shell {
            flavor: ShellFlavor::Sh,
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let mut transport = LocalTransport::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let response = transport
            .execute(Invocation {
                command: "echo out; echo err >&2; exit 3",
                executor: &sh(),
                timeout: Duration::from_secs(5),
                cancel: &cancel,
            })
            .await
            .expect("command runs");
        assert_eq!(response.stdout, b"out\n");
        assert_eq!(response.stderr, b"err\n");
        assert_eq!(response.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let mut transport = LocalTransport::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let err = transport
            .execute(Invocation {
                command: "sleep 5",
                executor: &sh(),
                timeout: Duration::from_secs(1),
                cancel: &cancel,
            })
            .await
            .expect_err("command times out");
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancellation_interrupts_running_command() {
        let mut transport = LocalTransport::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = transport
            .execute(Invocation {
                command: "sleep 5",
                executor: &sh(),
                timeout: Duration::from_secs(10),
                cancel: &cancel,
            })
            .await
            .expect_err("command cancelled");
        assert_eq!(err.kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn timeout_covers_a_script_larger_than_the_pipe() {
        let mut transport = LocalTransport::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let mut script = String::from("sleep 8\n");
        let filler = format!("# {}\n", "x".repeat(98));
        for _ in 0..4200 {
            script.push_str(&filler);
        }

        let started = Instant::now();
        let err = transport
            .execute(Invocation {
                command: &script,
                executor: &sh(),
                timeout: Duration::from_secs(1),
                cancel: &cancel,
            })
            .await
            .expect_err("command times out");
        assert_eq!(err.kind, FailureKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
