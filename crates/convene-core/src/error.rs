// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for convene-core.
//!
//! Provides a unified error type with stable error codes for logging
//! and for hosts that map engine failures onto their own API surface.

use std::fmt;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors that can occur during coordination operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineError {
    /// A response already exists for this correlation id.
    ///
    /// Expected under producer retries; swallowed by the response
    /// store, never surfaced to callers of `fulfill`.
    DuplicateResponse {
        /// The correlation id that was already fulfilled.
        correlation_id: String,
    },

    /// No callback factory is registered for the stored kind tag.
    UnknownCallbackKind {
        /// The kind tag found in the stored envelope.
        kind: String,
    },

    /// No queue is configured for the publisher named by a wait instance.
    PublisherNotRegistered {
        /// The publisher name with no queue mapping.
        publisher: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Encoding or decoding a stored value failed.
    SerializationError {
        /// Error details.
        details: String,
    },

    /// Queue publish or subscribe failed.
    QueueError {
        /// The topic involved.
        topic: String,
        /// Error details.
        details: String,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateResponse { .. } => "DUPLICATE_RESPONSE",
            Self::UnknownCallbackKind { .. } => "UNKNOWN_CALLBACK_KIND",
            Self::PublisherNotRegistered { .. } => "PUBLISHER_NOT_REGISTERED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
            Self::QueueError { .. } => "QUEUE_ERROR",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateResponse { correlation_id } => {
                write!(f, "Response for '{}' already recorded", correlation_id)
            }
            Self::UnknownCallbackKind { kind } => {
                write!(f, "No callback factory registered for kind '{}'", kind)
            }
            Self::PublisherNotRegistered { publisher } => {
                write!(f, "No queue configured for publisher '{}'", publisher)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::SerializationError { details } => {
                write!(f, "Serialization error: {}", details)
            }
            Self::QueueError { topic, details } => {
                write!(f, "Queue error on topic '{}': {}", topic, details)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError {
            details: err.to_string(),
        }
    }
}
