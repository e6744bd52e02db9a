use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] coordination_store::Error),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build health check client: {0}")]
    HealthClient(#[from] reqwest::Error),
}

/// Failures while installing or removing forging credentials. None of these
/// are fatal: the manager retries every tick.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to read credential source {path}: {source}")]
    ReadSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to stage credential for {path}: {source}")]
    Stage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to set permissions on {path}: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to move credential into place at {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to remove credentials: {}", .paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    Remove { paths: Vec<PathBuf> },
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("forging process {0:?} not found")]
    ProcessNotFound(String),

    #[error("failed to scan processes: {0}")]
    Scan(#[from] std::io::Error),

    #[error("failed to signal pid {pid}: {source}")]
    Delivery { pid: i32, source: nix::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
