// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for appbox-controller.

use axum::http::StatusCode;
use thiserror::Error;

/// Controller errors surfaced to API callers.
///
/// Each variant maps to exactly one HTTP status via [`Error::status_code`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request validation failed (400).
    #[error("{0}")]
    BadRequest(String),

    /// The store declined the purchase (402).
    #[error("{0}")]
    PaymentRequired(String),

    /// No valid credentials were presented (401).
    #[error("Authentication required")]
    Unauthorized,

    /// Caller is not allowed to perform the operation (403).
    #[error("{0}")]
    Forbidden(String),

    /// No such application (404).
    #[error("No such app: {0}")]
    NotFound(String),

    /// Location taken, task already active, or state does not allow the operation (409).
    #[error("{0}")]
    Conflict(String),

    /// Controller is shutting down and no longer accepts work (503).
    #[error("Controller is shutting down")]
    ShuttingDown,

    /// Registry operation failed (500).
    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    /// App store could not be reached or answered unexpectedly (500).
    #[error("Purchase error: {0}")]
    Purchase(#[from] crate::appstore::PurchaseError),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Anything else (500).
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Registry(crate::registry::RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Registry(crate::registry::RegistryError::AlreadyExists(_)) => {
                StatusCode::CONFLICT
            }
            Error::Purchase(crate::appstore::PurchaseError::PaymentRequired(_)) => {
                StatusCode::PAYMENT_REQUIRED
            }
            Error::Registry(_) | Error::Purchase(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Shorthand for [`Error::BadRequest`].
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    /// Shorthand for [`Error::Conflict`].
    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    /// Shorthand for [`Error::Forbidden`].
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }
}

impl From<crate::scheduler::ScheduleError> for Error {
    fn from(err: crate::scheduler::ScheduleError) -> Self {
        match err {
            crate::scheduler::ScheduleError::Conflict(app_id) => {
                Error::Conflict(format!("A task is already active for app {}", app_id))
            }
            crate::scheduler::ScheduleError::ShuttingDown => Error::ShuttingDown,
        }
    }
}

/// Result type using the controller Error.
pub type Result<T> = std::result::Result<T, Error>;
