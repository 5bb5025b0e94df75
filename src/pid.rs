//! PID-file bookkeeping behind the start/stop/status subcommands.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

/// Where a running relay records its process id.
pub fn pid_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-relay")
        .join("claude-relay.pid")
}

/// Record this process in the PID file, creating the directory on first run.
pub fn write_pid() -> io::Result<()> {
    let path = pid_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, std::process::id().to_string())?;
    tracing::debug!(path = %path.display(), "pid file written");
    Ok(())
}

/// The process id a previous `start` left behind, if the file parses.
pub fn read_pid() -> io::Result<u32> {
    fs::read_to_string(pid_file())?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

/// Drop the PID file. Already gone is not an error.
pub fn cleanup_pid() -> io::Result<()> {
    match fs::remove_file(pid_file()) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether `pid` names a live process.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // kill with no signal is an existence probe only
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use std::process::Command;

    let probe = Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}")])
        .output();
    match probe {
        Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()),
        Err(_) => false,
    }
}
