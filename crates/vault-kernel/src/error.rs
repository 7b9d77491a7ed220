use std::path::PathBuf;

use thiserror::Error;
use vault_core::StoreError;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("command '{0}' already registered")]
    DuplicateCommand(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("command not found: {id}")]
    CommandNotFound { id: String, available: Vec<String> },

    #[error("command '{id}' failed: {cause}")]
    CommandExecution { id: String, cause: anyhow::Error },

    #[error("extension not found: {0}")]
    ExtensionNotFound(String),

    #[error("extension '{id}' failed: {cause}")]
    Extension { id: String, cause: anyhow::Error },

    #[error("kernel not initialized")]
    NotInitialized,

    #[error("invalid vault path {path:?}: {reason}")]
    InvalidVault { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// Fatal errors stop the process at boot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::InvalidVault { .. } | KernelError::Config(_) | KernelError::Io(_)
        )
    }
}

impl From<toml::de::Error> for KernelError {
    fn from(e: toml::de::Error) -> Self {
        KernelError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for KernelError {
    fn from(e: toml::ser::Error) -> Self {
        KernelError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
