//! External command execution.
//!
//! Every host tool (sfdisk, losetup, mkfs, extlinux, chroot) goes through
//! these helpers so exit status handling and stderr capture stay uniform.
//! Children are spawned with `kill_on_drop` so a stage timeout that drops
//! the in-flight future also reaps the process.

use crate::errors::{DiskforgeError, DiskforgeResult};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Stderr kept on command failure. Enough for mkfs/sfdisk diagnostics
/// without dragging full apt-get transcripts into error values.
const STDERR_CAPTURE_LIMIT: usize = 4096;

/// Run a command to completion and return its stdout.
///
/// Non-zero exit becomes `DiskforgeError::Command`; a missing binary becomes
/// `NotFound` so preflight gaps read clearly.
pub(crate) async fn run_capture<I, S>(program: &str, args: I) -> DiskforgeResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| spawn_error(program, &e))?;

    check_exit(program, output)
}

/// Run a command with bytes piped to its stdin, returning stdout.
pub(crate) async fn run_with_stdin<I, S>(
    program: &str,
    args: I,
    input: &[u8],
) -> DiskforgeResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, &e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    check_exit(program, output)
}

fn spawn_error(program: &str, err: &std::io::Error) -> DiskforgeError {
    if err.kind() == std::io::ErrorKind::NotFound {
        DiskforgeError::NotFound(format!("'{program}' not found on host"))
    } else {
        DiskforgeError::Command {
            program: program.to_string(),
            code: None,
            stderr: err.to_string(),
        }
    }
}

fn check_exit(program: &str, output: std::process::Output) -> DiskforgeResult<String> {
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = clip(
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
        STDERR_CAPTURE_LIMIT,
    );
    Err(DiskforgeError::Command {
        program: program.to_string(),
        code: output.status.code(),
        stderr,
    })
}

fn clip(mut s: String, limit: usize) -> String {
    if s.len() > limit {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
