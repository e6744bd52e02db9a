use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::error::SignalError;

/// Version of the reload contract with the forging process.
///
/// v1: after credential files are installed or removed, every process whose
/// name matches receives `SIGHUP` and re-reads its credential paths. Files are
/// always in their final state before the signal is sent.
pub const RELOAD_CONTRACT_VERSION: u32 = 1;

/// Linux truncates `/proc/<pid>/comm` to 15 bytes.
const COMM_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    CredentialsInstalled,
    CredentialsRemoved,
}

impl ReloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadReason::CredentialsInstalled => "enable_forging",
            ReloadReason::CredentialsRemoved => "disable_forging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadNotice {
    pub version: u32,
    pub reason: ReloadReason,
}

impl ReloadNotice {
    pub fn new(reason: ReloadReason) -> Self {
        Self {
            version: RELOAD_CONTRACT_VERSION,
            reason,
        }
    }
}

/// Tells the forging process to re-read its credentials.
#[async_trait]
pub trait ForgeSignaler: Send + Sync {
    /// Returns how many processes were notified.
    async fn notify(&self, notice: ReloadNotice) -> Result<usize, SignalError>;
}

/// Signals sibling processes (shared PID namespace) found by name under
/// `/proc`.
#[derive(Debug, Clone)]
pub struct ProcessSignaler {
    process_name: String,
    proc_root: PathBuf,
}

impl ProcessSignaler {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self::with_proc_root(process_name, "/proc")
    }

    pub fn with_proc_root(process_name: impl Into<String>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            process_name: process_name.into(),
            proc_root: proc_root.into(),
        }
    }

    /// PIDs whose `comm` matches the process name, excluding ourselves.
    pub fn find_pids(&self) -> Result<Vec<i32>, SignalError> {
        let wanted = truncate_comm(&self.process_name);
        let own_pid = std::process::id();
        let mut pids = Vec::new();

        for entry in fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if pid == own_pid {
                continue;
            }
            // Processes can exit between listing and reading; skip them.
            let Ok(comm) = fs::read_to_string(entry.path().join("comm")) else {
                continue;
            };
            if comm.trim_end() == wanted {
                if let Ok(pid) = i32::try_from(pid) {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_MAX_LEN {
        return name;
    }
    let mut end = COMM_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[async_trait]
impl ForgeSignaler for ProcessSignaler {
    async fn notify(&self, notice: ReloadNotice) -> Result<usize, SignalError> {
        let pids = self.find_pids()?;
        if pids.is_empty() {
            return Err(SignalError::ProcessNotFound(self.process_name.clone()));
        }

        for pid in &pids {
            debug!(pid, reason = notice.reason.as_str(), "sending SIGHUP");
            kill(Pid::from_raw(*pid), Signal::SIGHUP).map_err(|source| {
                SignalError::Delivery { pid: *pid, source }
            })?;
        }
        info!(
            process = %self.process_name,
            pids = ?pids,
            reason = notice.reason.as_str(),
            contract = notice.version,
            "notified forging process to reload credentials"
        );
        Ok(pids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, comm) in entries {
            let proc_dir = dir.path().join(pid);
            fs::create_dir(&proc_dir).unwrap();
            fs::write(proc_dir.join("comm"), format!("{comm}\n")).unwrap();
        }
        // Non-pid entries live alongside pids in the real /proc.
        fs::create_dir(dir.path().join("sys")).unwrap();
        fs::write(dir.path().join("uptime"), "1.0 1.0\n").unwrap();
        dir
    }

    #[test]
    fn finds_matching_processes_only() {
        let proc = fake_proc(&[
            ("10", "cardano-node"),
            ("11", "bash"),
            ("12", "cardano-node"),
            ("13", "cardano-node-x"),
        ]);
        let signaler = ProcessSignaler::with_proc_root("cardano-node", proc.path());
        assert_eq!(signaler.find_pids().unwrap(), vec![10, 12]);
    }

    #[test]
    fn long_names_match_truncated_comm() {
        let proc = fake_proc(&[("20", "cardano-node-bl")]);
        let signaler = ProcessSignaler::with_proc_root("cardano-node-blockproducer", proc.path());
        assert_eq!(signaler.find_pids().unwrap(), vec![20]);
    }

    #[test]
    fn skips_own_pid() {
        let own = std::process::id().to_string();
        let proc = fake_proc(&[(own.as_str(), "cardano-node")]);
        let signaler = ProcessSignaler::with_proc_root("cardano-node", proc.path());
        assert!(signaler.find_pids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_process_is_an_error() {
        let proc = fake_proc(&[("10", "bash")]);
        let signaler = ProcessSignaler::with_proc_root("cardano-node", proc.path());
        let result = signaler
            .notify(ReloadNotice::new(ReloadReason::CredentialsInstalled))
            .await;
        assert!(matches!(result, Err(SignalError::ProcessNotFound(_))));
    }

    #[tokio::test]
    async fn unreadable_proc_root_is_a_scan_error() {
        let signaler = ProcessSignaler::with_proc_root("cardano-node", "/nonexistent/proc");
        let result = signaler
            .notify(ReloadNotice::new(ReloadReason::CredentialsRemoved))
            .await;
        assert!(matches!(result, Err(SignalError::Scan(_))));
    }

    #[test]
    fn notice_carries_contract_version() {
        let notice = ReloadNotice::new(ReloadReason::CredentialsRemoved);
        assert_eq!(notice.version, RELOAD_CONTRACT_VERSION);
        assert_eq!(notice.reason.as_str(), "disable_forging");
    }
}
