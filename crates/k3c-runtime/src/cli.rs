//! Subprocess plumbing for the Docker CLI adapter.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};

/// Spawns `docker <args>` and collects its output.
///
/// Cancellation kills the child process; the pending daemon call (pull,
/// exec, ...) is aborted with it.
pub(crate) async fn run(
    binary: &str,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<String> {
    debug!(command = %format_command(binary, args), "runtime call");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::Daemon(format!("failed to spawn {binary}: {e}")))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        () = cancel.cancelled() => {
            return Err(RuntimeError::cancelled(format_command(binary, args)));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if output.status.success() {
        return Ok(stdout);
    }

    Err(classify_failure(
        format_command(binary, args),
        output.status.code().unwrap_or(-1),
        stderr,
    ))
}

/// Like [`run`], but a non-zero exit is not an error.
///
/// Used for execs inside containers, where the exit code is the result.
pub(crate) async fn run_unchecked(
    binary: &str,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<(i32, String, String)> {
    debug!(command = %format_command(binary, args), "runtime call (unchecked)");

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::Daemon(format!("failed to spawn {binary}: {e}")))?;

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        () = cancel.cancelled() => {
            return Err(RuntimeError::cancelled(format_command(binary, args)));
        }
    };

    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// Spawns `docker <args>` and streams stdout lines into a channel.
///
/// The reader task ends when the process exits, the receiver is dropped or
/// the token fires.
pub(crate) async fn run_streaming(
    binary: &str,
    args: &[String],
    cancel: &CancellationToken,
) -> Result<mpsc::Receiver<String>> {
    debug!(command = %format_command(binary, args), "runtime call (streaming)");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RuntimeError::Daemon(format!("failed to spawn {binary}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::Daemon("child stdout not captured".to_string()))?;

    let (tx, rx) = mpsc::channel(64);
    let cancel = cancel.clone();
    let command = format_command(binary, args);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%command, error = %e, "stream read failed");
                        break;
                    }
                },
                () = cancel.cancelled() => break,
            }
        }
        // kill_on_drop reaps the child when the task ends
        drop(child);
    });

    Ok(rx)
}

/// Maps well-known daemon error messages to typed errors.
fn classify_failure(command: String, status: i32, stderr: String) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container")
        || lower.contains("no such network")
        || lower.contains("no such volume")
        || lower.contains("no such image")
        || lower.contains("no such object")
    {
        return RuntimeError::not_found(stderr);
    }
    if lower.contains("already exists") || lower.contains("already in use") {
        return RuntimeError::already_exists(stderr);
    }
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        return RuntimeError::Daemon(stderr);
    }
    RuntimeError::CommandFailed {
        command,
        status,
        stderr,
    }
}

fn format_command(binary: &str, args: &[String]) -> String {
    format!("{binary} {}", args.join(" "))
}
