use thiserror::Error;

/// Invalid monitor or service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("branch must not be empty")]
    EmptyBranch,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("at least one tracked file is required")]
    NoTrackedFiles,
    #[error("a git username requires a password or token")]
    MissingPassword,
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// The mirror could not be created. Fatal for the configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to clone {url} (branch {branch}): {source}")]
    Clone {
        url: String,
        branch: String,
        #[source]
        source: git2::Error,
    },
    #[error("failed to open repository at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: git2::Error,
    },
    #[error("failed to prepare work directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("setup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("monitor for {0} was shut down during setup")]
    Cancelled(String),
}

/// Pull, fetch or reset against the remote failed. The next tick retries.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("remote branch {0} not found after fetch")]
    MissingRemoteBranch(String),
    #[error("local branch {0} has diverged from the remote")]
    Diverged(String),
}

/// A commit, path or blob could not be read from history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

/// A tracked file snapshot was not a usable mapping document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("object store request for {key} failed: {message}")]
    Request { key: String, message: String },
}

/// Anything that can abort a single polling tick or a rebuild.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("blocking git task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
