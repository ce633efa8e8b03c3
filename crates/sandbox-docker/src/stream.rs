use std::path::Path;
use std::process::Stdio;

use sandbox::{EventStream, ExecHandle, ProcessExit, RuntimeError, output_channel};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::format_command_display;

fn spawn_piped(program: &Path, args: &[String]) -> Result<Child, RuntimeError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            RuntimeError::Stream(format!(
                "spawn {}: {e}",
                format_command_display(program, args)
            ))
        })
}

/// Copy every line of `reader` into the output channel.
fn forward_lines<R>(reader: R, tx: broadcast::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            // No receivers left is fine, the exec keeps running regardless.
            let _ = tx.send(line);
        }
    })
}

/// Start a process and stream its stdout and stderr lines.
///
/// The returned job resolves when the process has exited and both pipes have
/// been drained.
pub(crate) fn spawn_exec(program: &Path, args: &[String]) -> Result<ExecHandle, RuntimeError> {
    let mut child = spawn_piped(program, args)?;
    let (tx, output) = output_channel();

    let mut forwarders = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(forward_lines(stderr, tx));
    }

    let job = tokio::spawn(async move {
        let status = child.wait().await?;
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
        Ok::<_, RuntimeError>(ProcessExit {
            exit_code: status.code(),
        })
    });

    Ok(ExecHandle { job, output })
}

/// Start a long-running process whose stdout is a stream of event lines.
///
/// The job completes with `Ok` once the receiver is dropped. If the process
/// exits on its own, the job fails with [`RuntimeError::Stream`].
pub(crate) fn spawn_event_stream(
    program: &Path,
    args: &[String],
) -> Result<EventStream, RuntimeError> {
    let command = format_command_display(program, args);
    let mut child = spawn_piped(program, args)?;
    let (tx, lines) = mpsc::unbounded_channel();

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(target: "docker-events", "stderr: {line}");
                }
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::Stream(format!("{command}: stdout not captured")))?;

    let job = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = reader.next_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let status = child.wait().await?;
                        return Err(RuntimeError::Stream(format!(
                            "{command} exited with {status}"
                        )));
                    }
                    Err(e) => {
                        let _ = child.kill().await;
                        return Err(RuntimeError::Stream(format!("{command}: {e}")));
                    }
                },
                _ = tx.closed() => break,
            }
        }

        debug!(command = %command, "event subscriber gone, stopping stream");
        let _ = child.kill().await;
        Ok::<_, RuntimeError>(())
    });

    Ok(EventStream { job, lines })
}
