//! Process signalling: liveness checks, the TERM → wait → KILL ladder and
//! exit-code mapping shared by the executor and the service manager.
//!
//! Commands run as `sh -c <text>`, so the pid we own is usually a shell.
//! On Linux its descendants are found through `/proc` and signalled too,
//! leaves first, so stopping a service does not orphan the real server.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::Child;

/// Exit code for a binary that could not be found
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code for any other spawn failure
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn is_protected(pid: u32) -> bool {
    pid <= 1 || pid == std::process::id()
}

/// Whether `pid` names a live process. EPERM still means it exists.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Send `sig`, treating an already dead process as success.
pub fn send_signal(pid: u32, sig: Signal) -> bool {
    if is_protected(pid) {
        tracing::warn!(pid, "refusing to signal protected pid");
        return false;
    }
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            tracing::debug!(pid, signal = ?sig, "signal sent");
            true
        }
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, signal = ?sig, "process already gone");
            false
        }
        Err(err) => {
            tracing::warn!(pid, signal = ?sig, %err, "failed to signal process");
            false
        }
    }
}

/// Descendants of `root`, deepest first
#[cfg(target_os = "linux")]
pub fn descendants(root: u32) -> Vec<u32> {
    use std::collections::{HashMap, VecDeque};

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    for entry in entries.flatten() {
        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let status = match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            Ok(status) => status,
            Err(_) => continue,
        };
        let ppid = status
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|v| v.trim().parse::<u32>().ok());
        if let Some(ppid) = ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or(&[]) {
            if child != root && !found.contains(&child) {
                found.push(child);
                queue.push_back(child);
            }
        }
    }
    found.reverse();
    found
}

#[cfg(not(target_os = "linux"))]
pub fn descendants(_root: u32) -> Vec<u32> {
    Vec::new()
}

fn signal_tree(root: u32, tree: &[u32], sig: Signal) {
    for &pid in tree {
        send_signal(pid, sig);
    }
    send_signal(root, sig);
}

/// Stop an owned child: SIGTERM to it and its descendants, wait up to
/// `grace`, then SIGKILL. Returns the reaped exit status.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let pid = match child.id() {
        Some(pid) => pid,
        None => return child.wait().await,
    };

    let tree = descendants(pid);
    signal_tree(pid, &tree, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            for &pid in &tree {
                if is_alive(pid) {
                    send_signal(pid, Signal::SIGKILL);
                }
            }
            status
        }
        Err(_) => {
            tracing::warn!(pid, "grace period expired, escalating to SIGKILL");
            for &pid in &tree {
                send_signal(pid, Signal::SIGKILL);
            }
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Stop a process we only know by pid (re-adopted after a restart).
/// Returns true when it is gone afterwards.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !is_alive(pid) {
        return true;
    }
    let tree = descendants(pid);
    signal_tree(pid, &tree, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    tracing::warn!(pid, "grace period expired, escalating to SIGKILL");
    signal_tree(pid, &tree, Signal::SIGKILL);
    tokio::time::sleep(POLL_INTERVAL).await;
    !is_alive(pid)
}

/// Exit code of a finished process; signal deaths map to `128 + signal`
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

/// Synthetic exit code for a process that never started
pub fn spawn_failure_code(err: &std::io::Error) -> i32 {
    match err.kind() {
        std::io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        _ => EXIT_CANNOT_EXECUTE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_own_pid_is_alive_and_protected() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!send_signal(1, Signal::SIGTERM));
    }

    #[test]
    fn test_spawn_failure_codes() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(spawn_failure_code(&missing), 127);
        assert_eq!(spawn_failure_code(&denied), 126);
    }

    #[tokio::test]
    async fn test_exit_code_preserved() {
        let mut child = spawn_sh("exit 3");
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code(&status), 3);
    }

    #[tokio::test]
    async fn test_terminate_child_uses_sigterm() {
        let mut child = spawn_sh("exec sleep 30");
        let status = terminate_child(&mut child, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exit_code(&status), 128 + 15);
    }

    #[tokio::test]
    async fn test_terminate_child_escalates_to_sigkill() {
        let mut child = spawn_sh("trap '' TERM; while true; do sleep 0.05; done");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let status = terminate_child(&mut child, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(exit_code(&status), 128 + 9);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_terminate_pid_on_dead_process() {
        let mut child = spawn_sh("exit 0");
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(terminate_pid(pid, Duration::from_millis(100)).await);
    }
}
