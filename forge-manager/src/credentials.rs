use std::fs::{self, File, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{CredentialConfig, CredentialFile};
use crate::error::{CredentialError, Error, Result};
use crate::metrics;
use crate::signal::{ForgeSignaler, ReloadNotice, ReloadReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Already in the desired state; nothing was touched.
    Unchanged,
    /// Files moved and the forging process was notified.
    Transitioned(CredentialState),
}

/// Drives the forging credentials on disk towards the desired state.
///
/// Files reach their final state before the forging process is signalled.
/// A failed step leaves the machine in the intermediate state so the next
/// call resumes from there; a failed signal does not roll back files already
/// moved.
pub struct CredentialManager {
    files: Vec<CredentialFile>,
    mode: u32,
    signaler: Arc<dyn ForgeSignaler>,
    state: CredentialState,
    signal_pending: bool,
}

impl CredentialManager {
    pub fn new(config: &CredentialConfig, signaler: Arc<dyn ForgeSignaler>) -> Self {
        Self::with_state(config, signaler, CredentialState::Disabled)
    }

    /// Start from a known state, e.g. after bootstrap installed the files.
    pub fn with_state(
        config: &CredentialConfig,
        signaler: Arc<dyn ForgeSignaler>,
        state: CredentialState,
    ) -> Self {
        Self {
            files: config.files.clone(),
            mode: config.mode,
            signaler,
            state,
            signal_pending: false,
        }
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == CredentialState::Enabled
    }

    pub async fn reconcile(&mut self, forge: bool) -> Result<ReconcileOutcome> {
        let (target, transitional, reason) = if forge {
            (
                CredentialState::Enabled,
                CredentialState::Enabling,
                ReloadReason::CredentialsInstalled,
            )
        } else {
            (
                CredentialState::Disabled,
                CredentialState::Disabling,
                ReloadReason::CredentialsRemoved,
            )
        };

        if self.state == target {
            return Ok(ReconcileOutcome::Unchanged);
        }

        // A reversal mid-transition restarts the file step for the new direction.
        if self.state != transitional {
            debug!(from = ?self.state, to = ?transitional, "credential transition started");
            self.state = transitional;
            self.signal_pending = false;
        }

        if !self.signal_pending {
            let moved = if forge {
                install_all(&self.files, self.mode)
            } else {
                remove_all(&self.files)
            };
            if let Err(e) = moved {
                let operation = if forge { "install" } else { "remove" };
                metrics::credential_failure(operation);
                return Err(e.into());
            }
            self.signal_pending = true;
        }

        match self.signaler.notify(ReloadNotice::new(reason)).await {
            Ok(_) => {
                metrics::signal_event(reason.as_str());
                self.signal_pending = false;
                self.state = target;
                info!(state = ?target, "forging credentials {}", if forge { "installed" } else { "removed" });
                Ok(ReconcileOutcome::Transitioned(target))
            }
            Err(e) => {
                metrics::credential_failure("signal");
                warn!(error = %e, state = ?self.state, "failed to notify forging process, will retry");
                Err(Error::Signal(e))
            }
        }
    }
}

/// Install every credential file. Stops at the first failure; files already
/// installed stay in place and are overwritten on retry.
pub fn install_all(files: &[CredentialFile], mode: u32) -> std::result::Result<(), CredentialError> {
    for file in files {
        install_file(file, mode)?;
        metrics::credential_operation("install", file.kind.as_str());
    }
    Ok(())
}

fn install_file(file: &CredentialFile, mode: u32) -> std::result::Result<(), CredentialError> {
    let contents = fs::read(&file.source).map_err(|source| CredentialError::ReadSource {
        path: file.source.clone(),
        source,
    })?;

    let stage_err = |source| CredentialError::Stage {
        path: file.target.clone(),
        source,
    };
    let dir = file
        .target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(stage_err)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".forge-credential-")
        .tempfile_in(dir)
        .map_err(stage_err)?;
    // Restrict before any key material is written, so the final path is
    // never observable with wider permissions.
    staged
        .as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(|source| CredentialError::Permissions {
            path: file.target.clone(),
            source,
        })?;
    staged.write_all(&contents).map_err(stage_err)?;
    staged.as_file().sync_all().map_err(stage_err)?;

    staged
        .persist(&file.target)
        .map_err(|e| CredentialError::Persist {
            path: file.target.clone(),
            source: e.error,
        })?;

    // Make the rename durable; failure here does not undo the install.
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %e, "failed to sync credential directory");
    }
    Ok(())
}

/// Remove every credential file. Attempts all of them even if one fails; a
/// file that is already gone counts as removed.
pub fn remove_all(files: &[CredentialFile]) -> std::result::Result<(), CredentialError> {
    let mut failed = Vec::new();
    for file in files {
        match fs::remove_file(&file.target) {
            Ok(()) => metrics::credential_operation("remove", file.kind.as_str()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %file.target.display(), error = %e, "failed to remove credential");
                failed.push(file.target.clone());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(CredentialError::Remove { paths: failed })
    }
}
