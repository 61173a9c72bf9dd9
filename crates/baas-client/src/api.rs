//! The seams between the core and the backend.
//!
//! [`SupabaseClient`](crate::SupabaseClient) implements all three traits
//! against the hosted backend; [`InMemoryBaas`](crate::InMemoryBaas)
//! implements them in-process.

use crate::{
    AppListing, AuthChangeEvent, BaasResult, CheckoutRequest, CheckoutSession, Profile,
    ProfileUpdate, Session, Subscription, UserMetadata,
};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Auth subsystem: issues sessions and announces their changes.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange email and password for a session. Emits `SIGNED_IN`.
    async fn sign_in_with_password(&self, email: &str, password: &str) -> BaasResult<Session>;

    /// Register a user. Returns the session when the account is usable
    /// immediately (and emits `SIGNED_IN`), `None` when confirmation is pending.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> BaasResult<Option<Session>>;

    /// Destroy the current session. Emits `SIGNED_OUT`.
    async fn sign_out(&self) -> BaasResult<()>;

    /// Current session, refreshed first if it has expired.
    async fn get_session(&self) -> BaasResult<Option<Session>>;

    /// Register for auth-state change events. Dropping the receiver
    /// unregisters it.
    fn subscribe(&self) -> broadcast::Receiver<AuthChangeEvent>;
}

/// Row store, scoped to the current session.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Profile row for `user_id`; `Ok(None)` when there are no rows.
    async fn fetch_profile(&self, user_id: &str) -> BaasResult<Option<Profile>>;

    /// Insert a profile row and return what was stored.
    async fn insert_profile(&self, profile: &Profile) -> BaasResult<Profile>;

    /// Write the present fields of `update` to the profile of `user_id`.
    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> BaasResult<()>;

    /// Caller's subscription; `Ok(None)` when none exists yet.
    async fn fetch_subscription(&self) -> BaasResult<Option<Subscription>>;

    /// App listing by id; `Ok(None)` when there is no such app.
    async fn fetch_app(&self, app_id: &str) -> BaasResult<Option<AppListing>>;
}

/// Serverless functions fronting the payment provider.
#[async_trait]
pub trait EdgeFunctions: Send + Sync {
    /// Create a hosted checkout session and return its redirect URL.
    async fn create_checkout_session(&self, request: &CheckoutRequest)
        -> BaasResult<CheckoutSession>;

    /// Cancel the referenced subscription at the provider.
    async fn cancel_subscription(&self, subscription_id: &str) -> BaasResult<()>;
}
