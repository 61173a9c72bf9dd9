//! Error types for the session synchronizer.

use baas_client::BaasError;
use thiserror::Error;

/// A poll or delay was cancelled before it finished.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Wait cancelled")]
pub struct Cancelled;

/// Errors returned by [`AuthStore`](crate::AuthStore) operations.
///
/// Display strings carry the backend message verbatim; the same text is
/// recorded in [`AuthState::error`](crate::AuthState::error).
#[derive(Error, Debug)]
pub enum SyncError {
    /// Sign-in, sign-up, sign-out or session lookup was rejected.
    #[error("{}", .0.user_message())]
    AuthFailure(#[source] BaasError),

    /// The operation needs a signed-in user.
    #[error("No authenticated user")]
    NoUser,

    /// No profile row exists and none could be adopted.
    #[error("Profile not found for user {0}")]
    ProfileNotFound(String),

    /// Profile write rejected; the optimistic change was rolled back.
    #[error("{}", .0.user_message())]
    ProfileWrite(#[source] BaasError),

    /// Creating the default profile failed.
    #[error("Profile provisioning failed: {}", .0.user_message())]
    ProfileProvisioning(#[source] BaasError),

    /// Reading the profile failed.
    #[error("Profile fetch failed: {}", .0.user_message())]
    ProfileFetch(#[source] BaasError),

    /// The operation was cancelled by dispose.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for SyncError {
    fn from(_: Cancelled) -> Self {
        SyncError::Cancelled
    }
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
