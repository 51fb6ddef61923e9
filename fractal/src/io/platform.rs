//! OS signal plumbing: terminating worker process groups and noticing Ctrl-C.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::debug;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGINT/SIGTERM has been received since `install_interrupt_handler`.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT/SIGTERM to the interrupt flag checked by the control loop.
#[cfg(unix)]
#[allow(unsafe_code)]
pub fn install_interrupt_handler() -> Result<()> {
    let handler: extern "C" fn(libc::c_int) = on_signal;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    debug!("interrupt handler installed");
    Ok(())
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() -> Result<()> {
    Ok(())
}

/// Signal a worker's process group. Returns `false` when the group is already gone.
#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<bool> {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return Ok(false);
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid targets the group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Ask a worker process group to exit (SIGTERM).
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> std::io::Result<bool> {
    signal_group(pid, libc::SIGTERM)
}

/// Forcefully stop a worker process group (SIGKILL).
#[cfg(unix)]
pub fn kill_group(pid: u32) -> std::io::Result<bool> {
    signal_group(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn terminate_group(_pid: u32) -> std::io::Result<bool> {
    Ok(false)
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) -> std::io::Result<bool> {
    Ok(false)
}
