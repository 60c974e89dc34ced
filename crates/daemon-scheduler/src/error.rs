// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the daemon scheduler.

use thiserror::Error;

/// Daemon scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller input is invalid or violates a business precondition.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Referenced environment or deployment does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The deployment being updated is no longer the environment's in-progress deployment.
    #[error("Unexpected deployment status: {0}")]
    UnexpectedDeploymentStatus(String),

    /// A deployment or environment transition is not allowed from its current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The optimistic transaction kept conflicting with concurrent writers.
    #[error("Transaction on '{key}' conflicted {attempts} times, giving up")]
    TransactionConflict {
        /// Store key the transaction was running against.
        key: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Orchestrator or cluster state call failed.
    #[error("Facade error: {0}")]
    Facade(#[from] crate::facade::FacadeError),

    /// Other error.
    #[error("{0}")]
    Other(String),

    /// An error annotated with the operation that failed.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::UnexpectedDeploymentStatus(_) => "UNEXPECTED_DEPLOYMENT_STATUS",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::TransactionConflict { .. } => "TRANSACTION_CONFLICT",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Facade(_) => "FACADE_ERROR",
            Self::Other(_) => "INTERNAL_ERROR",
            Self::Context { source, .. } => source.error_code(),
        }
    }

    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`Error::Context`].
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a [`Error::BadRequest`].
    pub fn is_bad_request(&self) -> bool {
        matches!(self.root(), Self::BadRequest(_))
    }

    /// Whether this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }

    /// Whether this is a [`Error::UnexpectedDeploymentStatus`].
    pub fn is_unexpected_deployment_status(&self) -> bool {
        matches!(self.root(), Self::UnexpectedDeploymentStatus(_))
    }
}

/// Result type using the daemon scheduler Error.
pub type Result<T> = std::result::Result<T, Error>;
