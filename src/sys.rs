//! Platform-specific process plumbing. Everything that touches signals,
//! liveness checks, or forced termination funnels through here so the rest
//! of the crate stays platform-neutral.

use crate::process::ProcessError;
use std::time::Duration;

#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
pub use windows::*;

/// Send a signal, then poll for exit. If the process is still alive when
/// the timeout elapses, force-kill it and give the kernel a moment to
/// reap before returning.
pub async fn terminate_gracefully(
    pid: u32,
    signal: &str,
    timeout: Duration,
) -> Result<(), ProcessError> {
    send_signal(pid, signal)?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    force_kill(pid)?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

#[cfg(unix)]
mod unix {
    use crate::process::ProcessError;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    pub fn parse_signal(name: &str) -> Result<Signal, ProcessError> {
        let normalized = name.trim().to_uppercase();
        let full = if normalized.starts_with("SIG") {
            normalized
        } else {
            format!("SIG{normalized}")
        };
        full.parse::<Signal>()
            .map_err(|_| ProcessError::InvalidSignal(name.to_string()))
    }

    pub fn send_signal(pid: u32, signal: &str) -> Result<(), ProcessError> {
        let sig = parse_signal(signal)?;
        kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| ProcessError::Kill(std::io::Error::from_raw_os_error(e as i32)))
    }

    /// Signal 0: no signal is delivered, but permission and existence
    /// checks still run.
    pub fn is_pid_alive(pid: u32) -> bool {
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // EPERM means it exists but belongs to someone else.
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    pub fn force_kill(pid: u32) -> Result<(), ProcessError> {
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| ProcessError::Kill(std::io::Error::from_raw_os_error(e as i32)))
    }

    /// Human-readable name for a raw termination signal number, e.g.
    /// `9` -> `"SIGKILL"`.
    pub fn signal_name(raw: i32) -> Option<String> {
        Signal::try_from(raw).ok().map(|s| s.as_str().to_string())
    }

    /// Last-resort sweep: kill every process whose command line matches the
    /// worker invocation pattern. `pkill` exits 1 when nothing matched,
    /// which is a success for our purposes.
    pub async fn emergency_kill_by_name(executable: &str) -> Result<(), ProcessError> {
        let pattern = format!("{executable}.*--port=");
        let status = tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(&pattern)
            .status()
            .await
            .map_err(ProcessError::Kill)?;

        match status.code() {
            Some(0) | Some(1) => Ok(()),
            _ => Err(ProcessError::Kill(std::io::Error::other(format!(
                "pkill -f '{pattern}' exited with {status}"
            )))),
        }
    }
}

#[cfg(windows)]
mod windows {
    use crate::process::ProcessError;
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, TerminateProcess,
    };

    /// Windows has no signal set to validate against; any name is accepted
    /// and termination is always forced.
    pub fn parse_signal(name: &str) -> Result<String, ProcessError> {
        Ok(name.to_string())
    }

    pub fn send_signal(pid: u32, _signal: &str) -> Result<(), ProcessError> {
        force_kill(pid)
    }

    pub fn is_pid_alive(pid: u32) -> bool {
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            CloseHandle(handle);
            true
        }
    }

    pub fn force_kill(pid: u32) -> Result<(), ProcessError> {
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::Kill(std::io::Error::last_os_error()));
            }
            let ok = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if ok == 0 {
                return Err(ProcessError::Kill(std::io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    pub fn signal_name(_raw: i32) -> Option<String> {
        None
    }

    pub async fn emergency_kill_by_name(executable: &str) -> Result<(), ProcessError> {
        let image = format!("{executable}.exe");
        let output = tokio::process::Command::new("taskkill")
            .args(["/F", "/IM", &image])
            .output()
            .await
            .map_err(ProcessError::Kill)?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" means nothing to clean up.
        if stderr.contains("not found") {
            return Ok(());
        }
        Err(ProcessError::Kill(std::io::Error::other(format!(
            "taskkill /F /IM {image} failed: {}",
            stderr.trim()
        ))))
    }
}
