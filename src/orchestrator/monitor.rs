//! Stuck-agent detection and process termination primitives.
//!
//! Timeout detection compares the agent log file's mtime against the
//! effective step timeout; a log that does not exist yet is not a
//! timeout. Killing escalates: polite signal, a grace window polled at
//! 250 ms, then force kill.

use std::path::Path;
use std::time::{Duration, SystemTime};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// True when the log file exists and has not been touched within
/// `timeout`. Errors reading metadata are treated as "not timed out" and
/// logged.
pub fn check_log_timeout(log_file: &Path, timeout: Duration) -> bool {
    if !log_file.exists() {
        // The launcher creates the log; absence means the agent is still
        // starting.
        return false;
    }
    match std::fs::metadata(log_file).and_then(|m| m.modified()) {
        Ok(modified) => match SystemTime::now().duration_since(modified) {
            Ok(idle) => idle > timeout,
            Err(_) => false,
        },
        Err(e) => {
            tracing::error!("Error checking log timeout for {log_file:?}: {e}");
            false
        }
    }
}

/// Null-signal liveness probe. Permission denied counts as alive,
/// no-such-process as dead.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Failed to send {signal:?} to PID {pid}: {e}");
            false
        }
    }
}

/// Terminate a stuck agent: SIGTERM, poll liveness through the grace
/// window, escalate to SIGKILL if it survives. Returns whether the
/// process is gone (or was already gone).
#[cfg(unix)]
pub async fn kill_with_escalation(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::Signal;

    if !pid_alive(pid) {
        return true;
    }
    if !send_signal(pid, Signal::SIGTERM) {
        return false;
    }

    // Let the process flush and exit cleanly before escalating.
    let polls = (grace.as_millis() / KILL_POLL_INTERVAL.as_millis()).max(1) as u32;
    for _ in 0..polls {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }

    if pid_alive(pid) && !send_signal(pid, Signal::SIGKILL) {
        return false;
    }
    true
}

#[cfg(not(unix))]
pub async fn kill_with_escalation(_pid: u32, _grace: Duration) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_log_is_not_a_timeout() {
        assert!(!check_log_timeout(
            Path::new("/nonexistent/agent.log"),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn fresh_log_is_not_a_timeout() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "working").unwrap();
        assert!(!check_log_timeout(file.path(), Duration::from_secs(3600)));
    }

    #[test]
    fn stale_log_times_out() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "working").unwrap();
        // Zero threshold: any mtime in the past counts as stale.
        std::thread::sleep(Duration::from_millis(20));
        assert!(check_log_timeout(file.path(), Duration::from_millis(1)));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killing_a_dead_pid_succeeds_immediately() {
        // Spawn and reap a child so its PID is free.
        let child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        let _ = child.wait_with_output().await.unwrap();
        assert!(kill_with_escalation(pid, Duration::from_millis(500)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn polite_kill_terminates_sleeping_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(kill_with_escalation(pid, Duration::from_secs(2)).await);
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
