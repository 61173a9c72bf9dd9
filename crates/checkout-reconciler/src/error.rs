//! Error types for checkout and subscription reconciliation.

use baas_client::BaasError;
use session_sync::Cancelled;
use thiserror::Error;

/// Errors returned by [`CheckoutReconciler`](crate::CheckoutReconciler).
#[derive(Error, Debug)]
pub enum CheckoutError {
    /// Checkout and cancellation need a signed-in user.
    #[error("Sign in to continue")]
    NotAuthenticated,

    /// The plan id is not in the catalog.
    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    /// The checkout function failed and the fallback policy did not admit it.
    #[error("Checkout failed: {}", .0.user_message())]
    Provider(#[source] BaasError),

    /// Reading the subscription view failed.
    #[error("Could not load subscription: {}", .0.user_message())]
    SubscriptionLookup(#[source] BaasError),

    /// The provider did not cancel; nothing was changed locally.
    #[error("Could not cancel subscription: {}", .0.user_message())]
    CancellationFailure(#[source] BaasError),

    /// The reconciler was disposed while waiting.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for CheckoutError {
    fn from(_: Cancelled) -> Self {
        CheckoutError::Cancelled
    }
}

/// Result type alias using CheckoutError.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = CheckoutError::Provider(BaasError::Api {
            status: 403,
            message: "Not allowed".into(),
        });
        assert_eq!(err.to_string(), "Checkout failed: Not allowed");
    }

    #[test]
    fn cancellation_failure_display() {
        let err = CheckoutError::CancellationFailure(BaasError::NetworkUnavailable);
        assert_eq!(
            err.to_string(),
            "Could not cancel subscription: Network unavailable"
        );
    }
}
