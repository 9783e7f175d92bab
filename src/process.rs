use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn detached() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Run `program` with `args`.
///
/// With `wait == false` the child is started, reaped on a background thread and
/// reported as exit code 0 immediately.
pub fn run<I, S>(program: &Path, args: I, wait: bool) -> Result<ProcessOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null());

    if !wait {
        let mut child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", program.display()))?;
        let label = program.display().to_string();
        thread::spawn(move || match child.wait() {
            Ok(status) => debug!(program = %label, code = exit_code(status), "detached process exited"),
            Err(err) => warn!(program = %label, "failed to reap detached process: {err}"),
        });
        return Ok(ProcessOutput::detached());
    }

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", program.display()))?;

    let stdout = child
        .stdout
        .take()
        .context("failed to open stdout for child process")?;
    let stderr = child
        .stderr
        .take()
        .context("failed to open stderr for child process")?;

    // Drain both pipes concurrently so a chatty child cannot fill a buffer and stall.
    let out_handle = thread::spawn(move || drain(stdout));
    let err_handle = thread::spawn(move || drain(stderr));

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for '{}'", program.display()))?;

    let stdout = out_handle
        .join()
        .map_err(|_| anyhow!("stdout reader thread panicked"))?
        .context("failed to read child stdout")?;
    let stderr = err_handle
        .join()
        .map_err(|_| anyhow!("stderr reader thread panicked"))?
        .context("failed to read child stderr")?;

    Ok(ProcessOutput {
        exit_code: exit_code(status),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn drain<R: Read>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Signal-terminated children have no exit code; they map to -1.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
