//! Running the real compiler.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

/// Runs `argv` with stdout and stderr redirected to files, returning
/// the exit code.
///
/// `DEPENDENCIES_OUTPUT` is withheld from the child: with it set, cc1
/// would emit a dependency line naming our temp files. A child killed
/// by a signal reports as exit code 1.
pub fn execute(argv: &[String], stdout_path: &Path, stderr_path: &Path) -> io::Result<i32> {
    debug!(command = ?argv, "executing");
    let stdout = File::create(stdout_path)?;
    let stderr = File::create(stderr_path)?;
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .env_remove("DEPENDENCIES_OUTPUT")
        .stdin(Stdio::inherit())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()?;
    Ok(status.code().unwrap_or(1))
}

/// Replaces this process with `argv`.
///
/// Only returns (with an error report and exit code 1) when the exec
/// itself fails. From the caller's perspective the compiler sees the
/// same argv, stdio, and environment it would have seen without the
/// wrapper.
pub fn exec_fallback(argv: &[String]) -> ! {
    use std::os::unix::process::CommandExt;

    debug!(command = ?argv, "executing fallback");
    let err = Command::new(&argv[0]).args(&argv[1..]).exec();
    eprintln!("ccache: failed to execute {}: {err}", argv[0]);
    std::process::exit(1);
}
