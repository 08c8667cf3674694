// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for skein-core.
//!
//! Provides a unified error type with stable error codes for the command
//! surface exposed to the API layer.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while triggering, driving or recovering workflows.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Workflow definition was not found.
    #[error("Workflow definition {code} (version {version}) not found")]
    DefinitionNotFound {
        /// Definition code.
        code: i64,
        /// Definition version.
        version: i32,
    },

    /// Workflow instance was not found.
    #[error("Workflow instance {instance_id} not found")]
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: i64,
    },

    /// Task instance was not found.
    #[error("Task instance {task_instance_id} not found")]
    TaskInstanceNotFound {
        /// The task instance ID that was not found.
        task_instance_id: i64,
    },

    /// Instance is in an invalid state for the requested operation.
    #[error("Workflow instance {instance_id} is in invalid state: expected {expected}, got {actual}")]
    InvalidInstanceState {
        /// The instance ID.
        instance_id: i64,
        /// The expected status (human readable).
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A state machine transition is not in the transition table.
    #[error("Illegal {entity} transition from {from} on {trigger}")]
    InvalidTransition {
        /// "workflow" or "task".
        entity: &'static str,
        /// Current state.
        from: String,
        /// Trigger that was applied.
        trigger: String,
    },

    /// The workflow DAG is structurally invalid.
    #[error("Invalid workflow DAG: {reason}")]
    InvalidDag {
        /// What is wrong with the graph.
        reason: String,
    },

    /// The instance is owned by a different (possibly dead) node.
    #[error("Workflow instance {instance_id} is not owned by this node (owner: {owner})")]
    NotLocallyOwned {
        /// The instance ID.
        instance_id: i64,
        /// Persisted owner host.
        owner: String,
    },

    /// Handing a task to the dispatcher failed.
    #[error("Dispatch of task instance {task_instance_id} failed: {reason}")]
    DispatchFailed {
        /// Task instance that could not be dispatched.
        task_instance_id: i64,
        /// Why dispatch failed.
        reason: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A state write kept failing after all retries.
    #[error("Persisting {operation} for workflow instance {instance_id} failed after {attempts} attempts: {last_error}")]
    PersistenceExhausted {
        /// The affected workflow instance.
        instance_id: i64,
        /// What was being written.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Last underlying error.
        last_error: String,
    },

    /// The engine for this instance is no longer accepting events.
    #[error("Workflow instance {instance_id} engine is unavailable")]
    EngineUnavailable {
        /// The instance ID.
        instance_id: i64,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::TaskInstanceNotFound { .. } => "TASK_INSTANCE_NOT_FOUND",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidDag { .. } => "INVALID_DAG",
            Self::NotLocallyOwned { .. } => "NOT_LOCALLY_OWNED",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::PersistenceExhausted { .. } => "PERSISTENCE_EXHAUSTED",
            Self::EngineUnavailable { .. } => "ENGINE_UNAVAILABLE",
        }
    }

    /// Whether retrying the same persistence call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }

    pub(crate) fn invalid_dag(reason: impl Into<String>) -> Self {
        Self::InvalidDag {
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
