//! External process execution with a deadline.
//!
//! Plugin binaries and the switch CLIs are slow, blocking programs. Every
//! call goes through [`run`], which bounds it with a timeout and kills the
//! child when the deadline passes.

use std::process::{Output, Stdio};
use std::time::Duration;

use podnet_common::{PodnetError, PodnetResult};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Run `command` to completion, feeding `stdin` if given.
///
/// A non-zero exit status is not an error here; callers decide what a
/// failure means for their protocol.
///
/// # Errors
///
/// Returns [`PodnetError::Io`] if the process cannot be spawned and
/// [`PodnetError::DeadlineExceeded`] if it outlives `timeout`.
pub async fn run(
    mut command: Command,
    stdin: Option<&[u8]>,
    operation: &str,
    timeout: Duration,
) -> PodnetResult<Output> {
    command
        .kill_on_drop(true)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    tracing::debug!(operation, command = ?command.as_std(), "Running command");
    let child = command.spawn()?;
    let input = stdin.map(<[u8]>::to_vec);

    match tokio::time::timeout(timeout, feed_and_wait(child, input)).await {
        Ok(output) => Ok(output?),
        Err(_) => {
            tracing::warn!(operation, ?timeout, "Command timed out, killed");
            Err(PodnetError::DeadlineExceeded {
                operation: operation.to_string(),
                timeout,
            })
        }
    }
}

async fn feed_and_wait(mut child: Child, input: Option<Vec<u8>>) -> std::io::Result<Output> {
    let pipe = child.stdin.take();
    let feed = async move {
        let (Some(input), Some(mut pipe)) = (input, pipe) else {
            return Ok(());
        };
        match pipe.write_all(&input).await {
            // The child exited without reading; its own output tells why.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    };

    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    fed?;
    Ok(output)
}

/// Best human-readable failure text of a finished command.
#[must_use]
pub fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("exited with {}", output.status)
}
