//! Process identity and liveness.

use std::io;

/// The calling process id, as stored in subscriber slots and queue names.
#[inline]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Returns whether a process with the given pid exists.
///
/// Uses `kill(pid, 0)`: signal 0 performs permission and existence checks
/// without delivering anything. `EPERM` still means the process exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
