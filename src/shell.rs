use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} produced non UTF-8 output")]
    Utf8 { program: String },
}

fn command(program: &str, args: &[String]) -> Command {
    debug!("exec: {} {:?}", program, args);
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd
}

/// Run a command to completion and return its stdout
pub async fn run_capture(program: &str, args: &[String]) -> Result<String, CommandError> {
    let output = command(program, args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8(output.stdout).map_err(|_| CommandError::Utf8 {
        program: program.to_string(),
    })
}

/// Run a command, logging each stdout/stderr line as it is produced.
/// Readers run on background tasks so the child never blocks on a full pipe.
pub async fn run_streaming(program: &str, args: &[String]) -> Result<(), CommandError> {
    let mut child = command(program, args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward_lines(out, false)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward_lines(err, true)));

    let status = child.wait().await.map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    if let Some(handle) = stdout {
        if let Err(e) = handle.await {
            warn!("stdout reader of {} failed: {}", program, e);
        }
    }
    let stderr_tail = match stderr {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            warn!("stderr reader of {} failed: {}", program, e);
            String::new()
        }),
        None => String::new(),
    };

    if !status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status,
            stderr: stderr_tail,
        });
    }

    Ok(())
}

/// Log every line of `reader`; returns the last line seen
async fn forward_lines<R>(reader: R, is_stderr: bool) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut last = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr {
                    warn!("{}", line);
                } else {
                    info!("{}", line);
                }
                last = line;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
    last
}
