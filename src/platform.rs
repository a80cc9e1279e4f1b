//! Platform helpers for spawning and killing the backend process tree.

use std::ffi::OsStr;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Pid of the supervised backend, readable from exit paths that cannot
/// take locks (signal handlers, the panic hook). Zero means "none".
static TRACKED_PID: AtomicU32 = AtomicU32::new(0);

pub fn track_backend_pid(pid: u32) {
    TRACKED_PID.store(pid, Ordering::SeqCst);
}

pub fn clear_tracked_pid() {
    TRACKED_PID.store(0, Ordering::SeqCst);
}

/// Build a `Command` that won't flash a console window on Windows.
pub fn silent_command<S: AsRef<OsStr>>(program: S) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Check whether a process with the given pid is still running.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 performs error checking only.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut code: u32 = 0;
            let ok = GetExitCodeProcess(handle, &mut code);
            CloseHandle(handle);
            ok != 0 && code == STILL_ACTIVE as u32
        }
    }
}

/// Forcefully kill the process and all of its descendants.
///
/// The backend is spawned in its own process group (Unix) / with
/// CREATE_NEW_PROCESS_GROUP (Windows), so the group/tree kill reaches
/// any workers it spawned.
pub fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
    #[cfg(windows)]
    {
        let status = silent_command("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "taskkill exited with {status}"
            )))
        }
    }
}

/// Send the strongest available termination signal to a single process.
pub fn kill_process(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
    #[cfg(windows)]
    {
        let status = silent_command("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "taskkill exited with {status}"
            )))
        }
    }
}

/// Best-effort synchronous kill of the tracked backend tree.
///
/// Used by the panic hook and the Unix signal handlers, where the normal
/// terminator cannot run. Failures are ignored; the host is exiting.
pub fn emergency_kill_tracked() {
    let pid = TRACKED_PID.load(Ordering::SeqCst);
    if pid != 0 {
        let _ = kill_process_tree(pid);
    }
}

#[cfg(unix)]
extern "C" fn on_exit_signal(sig: libc::c_int) {
    // Async-signal-safe: only kill(2) and _exit(2).
    let pid = TRACKED_PID.load(Ordering::SeqCst);
    if pid != 0 {
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    unsafe { libc::_exit(128 + sig) }
}

/// Install SIGINT/SIGTERM handlers that kill the backend tree before
/// the shell itself dies.
#[cfg(unix)]
pub fn install_exit_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_exit_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_exit_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}
