//! Error types for BaaS calls.

use thiserror::Error;

/// Error returned by every auth, row-store and edge-function call.
#[derive(Error, Debug)]
pub enum BaasError {
    /// Network or transport-level HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    ///
    /// `message` is the human-readable message the BaaS returned, verbatim.
    #[error("Supabase error: {status} - {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// Insert collided with an existing row (HTTP 409 / Postgres 23505).
    #[error("Row already exists: {0}")]
    Conflict(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Client-side misconfiguration (bad URL, missing key).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The call needs a session and there is none.
    #[error("Not logged in")]
    NotLoggedIn,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Network unavailable (transient error, can retry)
    #[error("Network unavailable")]
    NetworkUnavailable,
}

impl BaasError {
    /// Returns true if this error is transient and the operation can be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            BaasError::NetworkUnavailable | BaasError::Timeout => true,
            BaasError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                e.status().is_some_and(|status| status.is_server_error())
            }
            BaasError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true for insert conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BaasError::Conflict(_))
    }

    /// Returns true when the failure says nothing about the caller's rights:
    /// the backend could not be reached, is failing, or is not set up
    /// (function not deployed, client misconfigured).
    pub fn is_connectivity_or_configuration(&self) -> bool {
        if self.is_transient() {
            return true;
        }
        match self {
            BaasError::Config(_) => true,
            BaasError::Api { status, .. } => matches!(status, 404 | 501),
            _ => false,
        }
    }

    /// Message suitable for showing to a user: the BaaS-provided text when
    /// there is one, otherwise the error's display form.
    pub fn user_message(&self) -> String {
        match self {
            BaasError::Api { message, .. } | BaasError::Conflict(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using BaasError.
pub type BaasResult<T> = Result<T, BaasError>;
