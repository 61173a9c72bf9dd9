//! In-process backend.
//!
//! [`InMemoryBaas`] implements the auth, row-store and edge-function seams
//! over plain maps. It backs the CLI's `--demo` mode and the core's tests,
//! so it can also model the awkward parts of the hosted backend: the
//! server-side trigger that provisions profiles some time after sign-up, a
//! webhook that settles a subscription after a few reads, injected failures,
//! and per-call latency.

use crate::api::{AuthApi, EdgeFunctions, RowStore};
use crate::error::{BaasError, BaasResult};
use crate::types::{
    AppListing, AuthChangeEvent, AuthUser, CheckoutMode, CheckoutRequest, CheckoutSession, Profile,
    ProfileUpdate, Session, Subscription, UserMetadata,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 16;
const SESSION_TTL_SECS: i64 = 3600;

/// Backend call, used to target failure injection, latency and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SignIn,
    SignUp,
    SignOut,
    GetSession,
    FetchProfile,
    InsertProfile,
    UpdateProfile,
    FetchSubscription,
    FetchApp,
    CreateCheckout,
    CancelSubscription,
}

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The backend answers with this status and message.
    Api { status: u16, message: String },
    /// The backend cannot be reached.
    Network,
    /// Insert conflict.
    Conflict,
    /// The edge function is not deployed (404).
    NotDeployed,
}

impl Failure {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Failure::Api {
            status,
            message: message.into(),
        }
    }

    fn to_error(&self) -> BaasError {
        match self {
            Failure::Api { status, message } => BaasError::Api {
                status: *status,
                message: message.clone(),
            },
            Failure::Network => BaasError::NetworkUnavailable,
            Failure::Conflict => BaasError::Conflict("duplicate key value".into()),
            Failure::NotDeployed => BaasError::Api {
                status: 404,
                message: "Requested function was not found".into(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    user: AuthUser,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    failure: Failure,
    /// `None` fails every call until cleared.
    remaining: Option<u32>,
}

/// Row written by the provisioning trigger but not yet visible to reads.
#[derive(Debug, Clone)]
struct ShadowProfile {
    profile: Profile,
    hidden_reads: u32,
}

#[derive(Debug, Clone)]
struct PendingSettlement {
    reads_left: u32,
    settled: Subscription,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    session_expired: bool,
    auto_confirm: bool,
    trigger_delay: Option<u32>,
    profiles: HashMap<String, Profile>,
    shadow_profiles: HashMap<String, ShadowProfile>,
    subscriptions: HashMap<String, Subscription>,
    settlements: HashMap<String, PendingSettlement>,
    apps: HashMap<String, AppListing>,
    failures: HashMap<Operation, InjectedFailure>,
    latency: HashMap<Operation, Duration>,
    calls: HashMap<Operation, u32>,
    checkout_requests: Vec<CheckoutRequest>,
    cancelled: Vec<String>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{:06}", prefix, self.next_id)
    }

    fn issue_session(&mut self, user: AuthUser) -> Session {
        let session = Session {
            access_token: self.next_id("access"),
            refresh_token: self.next_id("refresh"),
            expires_at: chrono::Utc::now().timestamp() + SESSION_TTL_SECS,
            user,
        };
        self.session = Some(session.clone());
        self.session_expired = false;
        session
    }

    fn run_trigger(&mut self, user: &AuthUser) {
        let Some(hidden_reads) = self.trigger_delay else {
            return;
        };
        let profile = Profile::provisioned_for(user);
        if hidden_reads == 0 {
            self.profiles.insert(user.id.clone(), profile);
        } else {
            self.shadow_profiles.insert(
                user.id.clone(),
                ShadowProfile {
                    profile,
                    hidden_reads,
                },
            );
        }
    }

    fn caller_id(&self) -> Option<String> {
        self.session.as_ref().map(|session| session.user.id.clone())
    }
}

/// In-memory backend. Clones share state.
#[derive(Clone)]
pub struct InMemoryBaas {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<AuthChangeEvent>,
}

impl Default for InMemoryBaas {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBaas {
    /// Empty backend: no accounts, no trigger, sign-up confirms immediately.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            auto_confirm: true,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            events,
        }
    }

    /// Backend seeded for the offline demo: one account, a couple of app
    /// listings, and an undeployed checkout function.
    pub fn demo() -> Self {
        let baas = Self::new();
        let user = baas.add_account("demo@appmarket.dev", "demo-password", Some("Demo User"));
        baas.seed_profile(Profile::provisioned_for(&user));
        baas.seed_app(AppListing {
            id: "app-notes".into(),
            name: "Notes Pro".into(),
            description: Some("Markdown notes with sync".into()),
            price: 4.99,
        });
        baas.seed_app(AppListing {
            id: "app-focus".into(),
            name: "Focus Timer".into(),
            description: None,
            price: 1.99,
        });
        baas.fail(Operation::CreateCheckout, Failure::NotDeployed);
        baas
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: AuthChangeEvent) {
        debug!(event = event.name(), "Emitting auth event");
        let _ = self.events.send(event);
    }

    /// Count the call, wait its latency, then apply any injected failure.
    async fn enter(&self, operation: Operation) -> BaasResult<()> {
        let latency = {
            let mut inner = self.lock();
            *inner.calls.entry(operation).or_default() += 1;
            inner.latency.get(&operation).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        let Some(injected) = inner.failures.get_mut(&operation) else {
            return Ok(());
        };
        let error = injected.failure.to_error();
        let exhausted = match injected.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            inner.failures.remove(&operation);
        }
        Err(error)
    }

    /// Register an account. Returns its auth user.
    pub fn add_account(&self, email: &str, password: &str, full_name: Option<&str>) -> AuthUser {
        let mut inner = self.lock();
        let user = AuthUser {
            id: uuid::Uuid::new_v4().to_string(),
            email: Some(email.to_string()),
            user_metadata: UserMetadata {
                full_name: full_name.map(str::to_string),
                avatar_url: None,
            },
        };
        inner.accounts.insert(
            email.to_string(),
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );
        user
    }

    /// Install a session for `email` without emitting an event, as if it
    /// had been persisted by an earlier run.
    pub fn establish_session(&self, email: &str) -> Option<Session> {
        let mut inner = self.lock();
        let user = inner.accounts.get(email)?.user.clone();
        Some(inner.issue_session(user))
    }

    /// Mark the current session expired; the next `get_session` refreshes it.
    pub fn expire_session(&self) {
        self.lock().session_expired = true;
    }

    /// Whether sign-up returns a session straight away.
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.lock().auto_confirm = auto_confirm;
    }

    /// Model the server-side provisioning trigger: every sign-in or sign-up
    /// writes a default profile that stays invisible to the next
    /// `hidden_reads` profile reads.
    pub fn enable_profile_trigger(&self, hidden_reads: u32) {
        self.lock().trigger_delay = Some(hidden_reads);
    }

    pub fn seed_profile(&self, profile: Profile) {
        self.lock().profiles.insert(profile.id.clone(), profile);
    }

    pub fn seed_subscription(&self, user_id: &str, subscription: Subscription) {
        self.lock()
            .subscriptions
            .insert(user_id.to_string(), subscription);
    }

    /// Make `user_id`'s subscription read as `settled` after `reads` more
    /// subscription reads, as a late payment webhook would.
    pub fn settle_subscription_after(&self, user_id: &str, reads: u32, settled: Subscription) {
        self.lock().settlements.insert(
            user_id.to_string(),
            PendingSettlement {
                reads_left: reads,
                settled,
            },
        );
    }

    pub fn seed_app(&self, app: AppListing) {
        self.lock().apps.insert(app.id.clone(), app);
    }

    /// Fail every call to `operation`.
    pub fn fail(&self, operation: Operation, failure: Failure) {
        self.lock().failures.insert(
            operation,
            InjectedFailure {
                failure,
                remaining: None,
            },
        );
    }

    /// Fail the next call to `operation` only.
    pub fn fail_once(&self, operation: Operation, failure: Failure) {
        self.lock().failures.insert(
            operation,
            InjectedFailure {
                failure,
                remaining: Some(1),
            },
        );
    }

    /// Delay every call to `operation` by `latency`.
    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        self.lock().latency.insert(operation, latency);
    }

    /// Number of calls made to `operation`, failed ones included.
    pub fn calls(&self, operation: Operation) -> u32 {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Visible profile row for `user_id`.
    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.lock().profiles.get(user_id).cloned()
    }

    /// Number of visible profile rows.
    pub fn profile_count(&self) -> usize {
        self.lock().profiles.len()
    }

    pub fn subscription(&self, user_id: &str) -> Option<Subscription> {
        self.lock().subscriptions.get(user_id).cloned()
    }

    /// Checkout requests received so far.
    pub fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.lock().checkout_requests.clone()
    }

    /// Subscription ids cancelled so far.
    pub fn cancelled_subscriptions(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    /// Emit an auth event as if the backend had pushed it.
    pub fn push_event(&self, event: AuthChangeEvent) {
        {
            let mut inner = self.lock();
            match &event {
                AuthChangeEvent::SignedIn(session) | AuthChangeEvent::TokenRefreshed(session) => {
                    inner.session = Some(session.clone());
                }
                AuthChangeEvent::SignedOut => inner.session = None,
            }
        }
        self.emit(event);
    }
}

#[async_trait]
impl AuthApi for InMemoryBaas {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> BaasResult<Session> {
        self.enter(Operation::SignIn).await?;
        let session = {
            let mut inner = self.lock();
            let user = match inner.accounts.get(email) {
                Some(account) if account.password == password => account.user.clone(),
                _ => {
                    return Err(BaasError::Api {
                        status: 400,
                        message: "Invalid login credentials".into(),
                    })
                }
            };
            if !inner.profiles.contains_key(&user.id) {
                inner.run_trigger(&user);
            }
            inner.issue_session(user)
        };
        self.emit(AuthChangeEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> BaasResult<Option<Session>> {
        self.enter(Operation::SignUp).await?;
        if password.len() < 6 {
            return Err(BaasError::Api {
                status: 422,
                message: "Password should be at least 6 characters.".into(),
            });
        }
        let session = {
            let mut inner = self.lock();
            if inner.accounts.contains_key(email) {
                return Err(BaasError::Api {
                    status: 422,
                    message: "User already registered".into(),
                });
            }
            let user = AuthUser {
                id: uuid::Uuid::new_v4().to_string(),
                email: Some(email.to_string()),
                user_metadata: metadata.clone(),
            };
            inner.accounts.insert(
                email.to_string(),
                Account {
                    password: password.to_string(),
                    user: user.clone(),
                },
            );
            inner.run_trigger(&user);
            if !inner.auto_confirm {
                return Ok(None);
            }
            inner.issue_session(user)
        };
        self.emit(AuthChangeEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self) -> BaasResult<()> {
        self.enter(Operation::SignOut).await?;
        self.lock().session = None;
        self.emit(AuthChangeEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> BaasResult<Option<Session>> {
        self.enter(Operation::GetSession).await?;
        let refreshed = {
            let mut inner = self.lock();
            let Some(current) = inner.session.clone() else {
                return Ok(None);
            };
            if !inner.session_expired {
                return Ok(Some(current));
            }
            inner.issue_session(current.user)
        };
        self.emit(AuthChangeEvent::TokenRefreshed(refreshed.clone()));
        Ok(Some(refreshed))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RowStore for InMemoryBaas {
    async fn fetch_profile(&self, user_id: &str) -> BaasResult<Option<Profile>> {
        self.enter(Operation::FetchProfile).await?;
        let mut inner = self.lock();
        if let Some(profile) = inner.profiles.get(user_id) {
            return Ok(Some(profile.clone()));
        }
        let Some(shadow) = inner.shadow_profiles.get_mut(user_id) else {
            return Ok(None);
        };
        shadow.hidden_reads = shadow.hidden_reads.saturating_sub(1);
        if shadow.hidden_reads > 0 {
            return Ok(None);
        }
        let profile = shadow.profile.clone();
        inner.shadow_profiles.remove(user_id);
        inner.profiles.insert(user_id.to_string(), profile.clone());
        Ok(Some(profile))
    }

    async fn insert_profile(&self, profile: &Profile) -> BaasResult<Profile> {
        self.enter(Operation::InsertProfile).await?;
        let mut inner = self.lock();
        // The trigger's row exists even while reads cannot see it yet.
        if let Some(shadow) = inner.shadow_profiles.remove(&profile.id) {
            inner.profiles.insert(profile.id.clone(), shadow.profile);
        }
        if inner.profiles.contains_key(&profile.id) {
            return Err(BaasError::Conflict(
                "duplicate key value violates unique constraint \"profiles_pkey\"".into(),
            ));
        }
        inner.profiles.insert(profile.id.clone(), profile.clone());
        Ok(profile.clone())
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> BaasResult<()> {
        self.enter(Operation::UpdateProfile).await?;
        // PATCH matching no row succeeds without effect.
        if let Some(profile) = self.lock().profiles.get_mut(user_id) {
            update.apply_to(profile);
        }
        Ok(())
    }

    async fn fetch_subscription(&self) -> BaasResult<Option<Subscription>> {
        self.enter(Operation::FetchSubscription).await?;
        let mut inner = self.lock();
        let Some(user_id) = inner.caller_id() else {
            return Ok(None);
        };
        if let Some(pending) = inner.settlements.get_mut(&user_id) {
            pending.reads_left = pending.reads_left.saturating_sub(1);
            if pending.reads_left == 0 {
                let settled = pending.settled.clone();
                inner.settlements.remove(&user_id);
                inner.subscriptions.insert(user_id.clone(), settled);
            }
        }
        Ok(inner.subscriptions.get(&user_id).cloned())
    }

    async fn fetch_app(&self, app_id: &str) -> BaasResult<Option<AppListing>> {
        self.enter(Operation::FetchApp).await?;
        Ok(self.lock().apps.get(app_id).cloned())
    }
}

#[async_trait]
impl EdgeFunctions for InMemoryBaas {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BaasResult<CheckoutSession> {
        self.enter(Operation::CreateCheckout).await?;
        let mut inner = self.lock();
        if inner.session.is_none() {
            return Err(BaasError::Api {
                status: 401,
                message: "Missing authorization header".into(),
            });
        }
        inner.checkout_requests.push(request.clone());
        let session_id = inner.next_id(match request.mode {
            CheckoutMode::Subscription => "cs_sub",
            CheckoutMode::Payment => "cs_pay",
        });
        Ok(CheckoutSession {
            url: format!("https://checkout.stripe.test/c/pay/{}", session_id),
            session_id: Some(session_id),
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BaasResult<()> {
        self.enter(Operation::CancelSubscription).await?;
        let mut inner = self.lock();
        let Some(user_id) = inner.caller_id() else {
            return Err(BaasError::NotLoggedIn);
        };
        let owned = inner
            .subscriptions
            .get(&user_id)
            .is_some_and(|sub| sub.subscription_id.as_deref() == Some(subscription_id));
        if !owned {
            return Err(BaasError::Api {
                status: 404,
                message: "Subscription not found".into(),
            });
        }
        inner.subscriptions.remove(&user_id);
        inner.cancelled.push(subscription_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubscriptionStatus;

    fn active(price: &str) -> Subscription {
        Subscription {
            subscription_id: Some("sub_1".into()),
            status: SubscriptionStatus::Active,
            price_id: Some(price.into()),
            current_period_end: Some(1_700_000_000),
            cancel_at_period_end: false,
        }
    }

    #[tokio::test]
    async fn invalid_credentials_are_rejected() {
        let baas = InMemoryBaas::new();
        baas.add_account("ada@example.com", "secret-pass", None);
        let err = baas
            .sign_in_with_password("ada@example.com", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "Invalid login credentials");
        assert!(baas.get_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_in_emits_event() {
        let baas = InMemoryBaas::new();
        let user = baas.add_account("ada@example.com", "secret-pass", None);
        let mut events = baas.subscribe();

        let session = baas
            .sign_in_with_password("ada@example.com", "secret-pass")
            .await
            .unwrap();
        assert_eq!(session.user.id, user.id);
        assert_eq!(
            events.recv().await.unwrap(),
            AuthChangeEvent::SignedIn(session)
        );
    }

    #[tokio::test]
    async fn trigger_row_is_hidden_then_conflicts_on_insert() {
        let baas = InMemoryBaas::new();
        baas.enable_profile_trigger(3);
        let session = baas
            .sign_up("ada@example.com", "secret-pass", &UserMetadata::default())
            .await
            .unwrap()
            .unwrap();
        let id = session.user.id.clone();

        assert!(baas.fetch_profile(&id).await.unwrap().is_none());
        let err = baas
            .insert_profile(&Profile::provisioned_for(&session.user))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(baas.fetch_profile(&id).await.unwrap().is_some());
        assert_eq!(baas.profile_count(), 1);
    }

    #[tokio::test]
    async fn trigger_row_becomes_visible_after_reads() {
        let baas = InMemoryBaas::new();
        baas.enable_profile_trigger(2);
        let session = baas
            .sign_up("ada@example.com", "secret-pass", &UserMetadata::default())
            .await
            .unwrap()
            .unwrap();
        let id = session.user.id;
        assert!(baas.fetch_profile(&id).await.unwrap().is_none());
        assert!(baas.fetch_profile(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fail_once_applies_to_a_single_call() {
        let baas = InMemoryBaas::new();
        baas.fail_once(Operation::FetchApp, Failure::Network);
        assert!(baas.fetch_app("x").await.unwrap_err().is_transient());
        assert!(baas.fetch_app("x").await.unwrap().is_none());
        assert_eq!(baas.calls(Operation::FetchApp), 2);
    }

    #[tokio::test]
    async fn subscription_settles_after_reads() {
        let baas = InMemoryBaas::new();
        let user = baas.add_account("ada@example.com", "secret-pass", None);
        baas.establish_session("ada@example.com").unwrap();
        baas.settle_subscription_after(&user.id, 2, active("price_pro"));

        assert!(baas.fetch_subscription().await.unwrap().is_none());
        let row = baas.fetch_subscription().await.unwrap().unwrap();
        assert_eq!(row.price_id.as_deref(), Some("price_pro"));
    }

    #[tokio::test]
    async fn cancel_requires_owned_subscription() {
        let baas = InMemoryBaas::new();
        let user = baas.add_account("ada@example.com", "secret-pass", None);
        baas.establish_session("ada@example.com").unwrap();
        baas.seed_subscription(&user.id, active("price_pro"));

        assert!(baas.cancel_subscription("sub_other").await.is_err());
        baas.cancel_subscription("sub_1").await.unwrap();
        assert!(baas.subscription(&user.id).is_none());
        assert_eq!(baas.cancelled_subscriptions(), vec!["sub_1".to_string()]);
    }

    #[tokio::test]
    async fn expired_session_refreshes_with_event() {
        let baas = InMemoryBaas::new();
        baas.add_account("ada@example.com", "secret-pass", None);
        let original = baas.establish_session("ada@example.com").unwrap();
        let mut events = baas.subscribe();
        baas.expire_session();

        let refreshed = baas.get_session().await.unwrap().unwrap();
        assert_ne!(refreshed.access_token, original.access_token);
        assert_eq!(refreshed.user, original.user);
        assert!(matches!(
            events.recv().await.unwrap(),
            AuthChangeEvent::TokenRefreshed(_)
        ));
    }

    #[tokio::test]
    async fn demo_checkout_is_not_deployed() {
        let baas = InMemoryBaas::demo();
        baas.sign_in_with_password("demo@appmarket.dev", "demo-password")
            .await
            .unwrap();
        let err = baas
            .create_checkout_session(&CheckoutRequest {
                price_id: Some("price_pro".into()),
                app_id: None,
                mode: CheckoutMode::Subscription,
                success_url: "s".into(),
                cancel_url: "c".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_connectivity_or_configuration());
    }
}
