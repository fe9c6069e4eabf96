use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::error::LoopError;

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub fn render_command(program: &Path, args: &[&str]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(args.iter().map(|a| a.to_string()));
    parts.join(" ")
}

/// Run a short external command with a hard timeout, capturing both streams.
///
/// The child is killed when the timeout drops the future. Command arguments
/// are always passed as a list; no shell is ever involved.
pub async fn run_command(
    program: &Path,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<CmdOutput, LoopError> {
    let rendered = render_command(program, args);
    tracing::debug!(command = %rendered, timeout_secs = timeout.as_secs(), "running");
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(LoopError::from(err).with("command", rendered));
        }
        Err(_) => {
            return Err(LoopError::timeout(&rendered, timeout.as_secs()));
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    tracing::debug!(
        command = %rendered,
        elapsed_secs = start.elapsed().as_secs_f64(),
        exit_code,
        "completed"
    );

    Ok(CmdOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
