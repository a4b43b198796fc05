//! Killing a worker together with every helper it spawned.
//!
//! The worker fans out to encoder and model-loader processes, so signalling
//! only its own pid would leave those running and holding the output pipes.
//!
//! * Unix: the worker is started as the leader of a new process group
//!   ([`prepare_command`]); `SIGKILL` is sent to the whole group.
//! * Windows: `taskkill /T /F` walks and kills the process tree.

use std::io;

use tokio::process::Command;

/// Put the child into its own process group so its descendants can be
/// signalled as a unit.
pub(crate) fn prepare_command(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Forcefully kill `pid` and its descendants.
///
/// A tree that has already exited is not an error.
#[cfg(unix)]
pub(crate) fn kill_tree(pid: u32) -> io::Result<()> {
    // kill(0, ..) and kill(-1, ..) would hit our own group or every process.
    let pgid = match libc::pid_t::try_from(pid) {
        Ok(pgid) if pgid > 1 => pgid,
        _ => return Err(not_a_worker(pid)),
    };
    // SAFETY: kill(2) with a negative pid signals the process group; no
    // memory is shared with the callee.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        log::debug!("worker: process group {pid} already gone");
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
pub(crate) fn kill_tree(pid: u32) -> io::Result<()> {
    if pid == 0 {
        return Err(not_a_worker(pid));
    }
    // Fire and forget, like the direct child kill that follows it.
    std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(any(unix, windows))]
fn not_a_worker(pid: u32) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("refusing to signal pid {pid}"))
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn kill_tree(_pid: u32) -> io::Result<()> {
    Ok(())
}
