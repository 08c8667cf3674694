// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for skein-master.

use thiserror::Error;

/// Master errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core operation (persistence, validation, state machine) failed.
    #[error("Core error: {0}")]
    Core(#[from] skein_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime is shutting down and no longer accepts work.
    #[error("Master is shutting down")]
    ShuttingDown,

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The wrapped core error, if any.
    pub fn as_core(&self) -> Option<&skein_core::CoreError> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type using master Error.
pub type Result<T> = std::result::Result<T, Error>;
