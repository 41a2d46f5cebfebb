//! Supervision of the external game process.
//!
//! The binary is launched with a fixed argument set. When it is started
//! through a third-party wrapper the wrapper's child is not ours, so the real
//! process id has to be recovered from the OS process table: poll for a
//! newly created process with the target's name, excluding the pids that
//! already existed before launch, and take the earliest-created match.
//!
//! Two concurrently launched instances on one machine cannot be told apart by
//! that discovery scheme; concurrent instances are unsupported.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use sysinfo::{Pid, System};

use crate::error::{MapforgeError, MapforgeResult};
use crate::poll;

/// Name the target process shows up under in the process table.
pub const PROCESS_NAME: &str = if cfg!(windows) { "factorio.exe" } else { "factorio" };

/// How long to wait for a wrapped launch to show up in the process table.
pub const DISCOVERY_LIMIT: Duration = Duration::from_secs(120);

/// How long a killed process gets to disappear from the table.
pub const EXIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub save_file: PathBuf,
    pub config_path: PathBuf,
    pub mod_directory: PathBuf,
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    /// True when the pid was recovered from the process table rather than
    /// taken from the spawned child directly.
    pub indirect: bool,
}

/// Spawns the game binary with the fixed argument set, stdout piped.
pub fn launch(spec: &LaunchSpec) -> MapforgeResult<Child> {
    let mut cmd = Command::new(&spec.binary);
    cmd.arg("--load-game")
        .arg(&spec.save_file)
        .arg("--disable-audio")
        .arg("--config")
        .arg(&spec.config_path)
        .arg("--mod-directory")
        .arg(&spec.mod_directory)
        .arg("--disable-migration-window")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    cmd.spawn().map_err(|e| {
        MapforgeError::launch(format!(
            "failed to start game binary '{}': {e}",
            spec.binary.display()
        ))
    })
}

/// Pids of all processes currently named `name` — taken before an indirect
/// launch so pre-existing instances are excluded from discovery.
pub fn pid_snapshot(name: &str) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.processes()
        .iter()
        .filter(|(_, p)| p.name() == name)
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

/// Picks the earliest-created candidate not on the blacklist.
///
/// Ties on creation time break toward the lower pid so the choice is
/// deterministic.
pub fn select_earliest_new(
    candidates: impl IntoIterator<Item = (u32, u64)>,
    blacklist: &[u32],
) -> Option<u32> {
    candidates
        .into_iter()
        .filter(|(pid, _)| !blacklist.contains(pid))
        .min_by_key(|&(pid, created)| (created, pid))
        .map(|(pid, _)| pid)
}

/// Polls the process table until a new process named `name` appears, bounded
/// by `limit`.
pub fn discover_new_pid(name: &str, blacklist: &[u32], limit: Duration) -> MapforgeResult<u32> {
    let mut sys = System::new();
    poll::wait_until(limit, poll::PROCESS_INTERVAL, || {
        sys.refresh_processes();
        select_earliest_new(
            sys.processes()
                .iter()
                .filter(|(_, p)| p.name() == name)
                .map(|(pid, p)| (pid.as_u32(), p.start_time())),
            blacklist,
        )
    })
    .required(&format!("a new '{name}' process to appear"))
}

/// Whether the pid is present in the process table and actually running.
///
/// A killed child we have not reaped yet still has a table entry in the
/// zombie state; for supervision purposes that process is gone.
pub fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        Some(p) => !matches!(
            p.status(),
            sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
        ),
        None => false,
    }
}

/// Best-effort scheduling-priority drop so screenshotting doesn't starve the
/// rest of the machine. Failure is logged, never fatal.
pub fn lower_priority(pid: u32) {
    #[cfg(unix)]
    {
        let status = Command::new("renice")
            .args(["-n", "10", "-p"])
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            tracing::debug!("could not lower priority of pid {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        tracing::debug!("priority drop not implemented on this platform (pid {pid})");
    }
}

/// Idempotent force-terminate: a no-op when the pid is already absent,
/// otherwise kills and waits (bounded) for the pid to leave the table.
pub fn terminate(handle: &ProcessHandle, limit: Duration) -> MapforgeResult<()> {
    if !is_pid_alive(handle.pid) {
        return Ok(());
    }
    let mut sys = System::new();
    sys.refresh_processes();
    if let Some(proc_) = sys.process(Pid::from_u32(handle.pid)) {
        proc_.kill();
    }

    poll::wait_until(limit, Duration::from_millis(100), || {
        (!is_pid_alive(handle.pid)).then_some(())
    })
    .required(&format!("killed process {} to exit", handle.pid))?;
    tracing::info!("killed game process {}", handle.pid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_excludes_blacklisted_pids() {
        let picked = select_earliest_new([(10, 100), (20, 50)], &[20]);
        assert_eq!(picked, Some(10));
    }

    #[test]
    fn selection_prefers_earliest_created() {
        let picked = select_earliest_new([(10, 100), (20, 50), (30, 75)], &[]);
        assert_eq!(picked, Some(20));
    }

    #[test]
    fn selection_breaks_ties_by_pid() {
        let picked = select_earliest_new([(30, 50), (20, 50)], &[]);
        assert_eq!(picked, Some(20));
    }

    #[test]
    fn selection_with_no_candidates_is_none() {
        assert_eq!(select_earliest_new([], &[]), None);
        assert_eq!(select_earliest_new([(10, 1)], &[10]), None);
    }

    #[cfg(unix)]
    #[test]
    fn terminate_on_a_dead_process_is_a_prompt_no_op() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let started = std::time::Instant::now();
        terminate(
            &ProcessHandle {
                pid,
                indirect: false,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn terminate_twice_is_tolerated() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let handle = ProcessHandle {
            pid: child.id(),
            indirect: false,
        };
        terminate(&handle, Duration::from_secs(10)).unwrap();
        terminate(&handle, Duration::from_secs(10)).unwrap();
        let _ = child.wait();
    }
}
