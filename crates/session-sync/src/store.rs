//! Session and profile synchronization.
//!
//! [`AuthStore`] owns the authenticated identity. Operations called by the
//! front end (sign-in, sign-up, sign-out, profile updates) and auth events
//! pushed by the backend all mutate one `watch` channel; every mutation is a
//! single `send_modify`, so readers never observe a user without the profile
//! resolved for it.
//!
//! Each session change bumps an epoch stored alongside the state. Work that
//! started under an older epoch (a profile fetch racing a sign-out, a
//! rollback racing a new sign-in) is dropped instead of overwriting newer
//! state.

use crate::auth_fsm::{SessionInput, SessionMachine, SessionPhase};
use crate::error::{SyncError, SyncResult};
use crate::poll::{run_or_cancel, Backoff};
use crate::state::{AuthState, LoadingGuard};
use baas_client::{
    AuthApi, AuthChangeEvent, AuthUser, BaasError, Profile, ProfileUpdate, RowStore, Session,
    SubscriptionTier, UserMetadata,
};
use market_config::PollConfig;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session/profile synchronizer.
///
/// Construct one per application and share it behind an `Arc`; call
/// [`initialize`](Self::initialize) once at startup and
/// [`dispose`](Self::dispose) on teardown.
pub struct AuthStore {
    auth: Arc<dyn AuthApi>,
    rows: Arc<dyn RowStore>,
    /// Poll used after `SIGNED_IN` while the provisioning trigger settles.
    provisioning: PollConfig,
    state: watch::Sender<AuthState>,
    /// Only locked from inside `state` mutations.
    fsm: Mutex<SessionMachine>,
    shutdown: CancellationToken,
}

impl AuthStore {
    pub fn new(auth: Arc<dyn AuthApi>, rows: Arc<dyn RowStore>, provisioning: PollConfig) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            auth,
            rows,
            provisioning,
            state,
            fsm: Mutex::new(SessionMachine::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a store whose auth and row store are the same backend.
    pub fn with_backend<B>(backend: Arc<B>, provisioning: PollConfig) -> Self
    where
        B: AuthApi + RowStore + 'static,
    {
        let auth: Arc<dyn AuthApi> = backend.clone();
        let rows: Arc<dyn RowStore> = backend;
        Self::new(auth, rows, provisioning)
    }

    /// Current state.
    pub fn snapshot(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// The current session, if any.
    pub fn current_user(&self) -> Option<Session> {
        self.state.borrow().user.clone()
    }

    /// Cancel every listener and pending wait tied to this store.
    pub fn dispose(&self) {
        info!("Disposing auth store");
        self.shutdown.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until no sign-in is being resolved and no operation is in flight.
    pub async fn wait_until_settled(&self) -> SyncResult<AuthState> {
        let mut rx = self.state.subscribe();
        let settled = run_or_cancel(
            rx.wait_for(|s| s.phase != SessionPhase::Authenticating && !s.loading),
            &self.shutdown,
        )
        .await?;
        // The sender lives in `self`, so the channel cannot close here.
        match settled {
            Ok(state) => Ok(state.clone()),
            Err(_) => Ok(self.snapshot()),
        }
    }

    /// Feed `input` to the phase machine and mirror the result into `s`.
    /// Returns whether the phase changed.
    fn apply_input(&self, s: &mut AuthState, input: &SessionInput) -> bool {
        let mut fsm = self.fsm.lock().unwrap_or_else(PoisonError::into_inner);
        if fsm.consume(input).is_err() {
            debug!(input = ?input, phase = ?s.phase, "Ignoring impossible session transition");
            return false;
        }
        let phase = SessionPhase::from(fsm.state());
        if phase == s.phase {
            return false;
        }
        debug!(old_phase = ?s.phase, new_phase = ?phase, "Session phase transition");
        s.phase = phase;
        true
    }

    fn transition(&self, input: SessionInput) {
        self.state.send_if_modified(|s| self.apply_input(s, &input));
    }

    /// Leave `Authenticating` after an attempt that produced no new session:
    /// back to the previous pair when there is one, otherwise `fallback`.
    /// Stays put while a `SIGNED_IN` lookup for the current epoch is pending;
    /// its commit settles the phase.
    fn settle_attempt(&self, s: &mut AuthState, fallback: SessionInput) {
        let input = if s.user.is_some() {
            SessionInput::Restored
        } else if s.is_resolving() {
            debug!(epoch = s.epoch, "Session lookup pending, staying in authenticating");
            return;
        } else {
            fallback
        };
        self.apply_input(s, &input);
    }

    fn record_error(&self, message: String) {
        self.state.send_modify(|s| s.error = Some(message));
    }

    fn reject_credentials(&self, err: BaasError) -> SyncError {
        warn!(error = %err, "Credentials rejected");
        let message = err.user_message();
        self.state.send_modify(|s| {
            s.error = Some(message);
            self.settle_attempt(s, SessionInput::CredentialsRejected);
        });
        SyncError::AuthFailure(err)
    }

    /// Sign in with email and password.
    ///
    /// The profile is filled in by the `SIGNED_IN` event the backend emits,
    /// not by this call.
    pub async fn sign_in(&self, email: &str, password: &str) -> SyncResult<Session> {
        let _loading = LoadingGuard::begin(&self.state, true);
        self.transition(SessionInput::CredentialsSubmitted);
        debug!(email = %email, "Signing in");

        match self.auth.sign_in_with_password(email, password).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "Sign-in accepted");
                Ok(session)
            }
            Err(err) => Err(self.reject_credentials(err)),
        }
    }

    /// Register an account. `full_name` is stored as user metadata and used
    /// when the profile is provisioned.
    ///
    /// Returns `None` when the backend requires email confirmation first.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> SyncResult<Option<Session>> {
        let _loading = LoadingGuard::begin(&self.state, true);
        self.transition(SessionInput::CredentialsSubmitted);
        debug!(email = %email, "Signing up");

        let full_name = full_name.trim();
        let metadata = UserMetadata {
            full_name: (!full_name.is_empty()).then(|| full_name.to_string()),
            avatar_url: None,
        };

        match self.auth.sign_up(email, password, &metadata).await {
            Ok(Some(session)) => {
                info!(user_id = %session.user.id, "Sign-up accepted");
                Ok(Some(session))
            }
            Ok(None) => {
                info!(email = %email, "Sign-up awaiting email confirmation");
                self.state
                    .send_modify(|s| self.settle_attempt(s, SessionInput::ConfirmationPending));
                Ok(None)
            }
            Err(err) => Err(self.reject_credentials(err)),
        }
    }

    /// Sign out. Local identity is cleared only once the backend confirms.
    pub async fn sign_out(&self) -> SyncResult<()> {
        let _loading = LoadingGuard::begin(&self.state, true);

        match self.auth.sign_out().await {
            Ok(()) => {
                self.state.send_modify(|s| {
                    s.clear_identity();
                    self.apply_input(s, &SessionInput::SignedOut);
                });
                info!("Signed out");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Sign-out failed");
                self.record_error(err.user_message());
                Err(SyncError::AuthFailure(err))
            }
        }
    }

    /// Apply `update` to the local profile immediately, then write it.
    ///
    /// On rejection the fields this update wrote are restored from the
    /// pre-update snapshot.
    pub async fn update_profile(&self, update: ProfileUpdate) -> SyncResult<()> {
        let Some(user_id) = self.state.borrow().user_id().map(str::to_string) else {
            return Err(SyncError::NoUser);
        };
        if update.is_empty() {
            return Ok(());
        }

        let _loading = LoadingGuard::begin(&self.state, true);
        let mut snapshot = None;
        let mut epoch = 0;
        self.state.send_modify(|s| {
            epoch = s.epoch;
            if let Some(profile) = s.profile.as_mut() {
                snapshot = Some(profile.clone());
                update.apply_to(profile);
            }
        });
        debug!(user_id = %user_id, "Writing profile update");

        match self.rows.update_profile(&user_id, &update).await {
            Ok(()) => {
                info!(user_id = %user_id, "Profile updated");
                Ok(())
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Profile update rejected, rolling back");
                let message = err.user_message();
                self.state.send_modify(|s| {
                    s.error = Some(message);
                    if s.epoch != epoch {
                        return;
                    }
                    if let (Some(profile), Some(snapshot)) = (s.profile.as_mut(), &snapshot) {
                        update.revert(profile, snapshot);
                    }
                });
                Err(SyncError::ProfileWrite(err))
            }
        }
    }

    /// Set the profile's subscription tier.
    pub async fn apply_subscription_tier(&self, tier: SubscriptionTier) -> SyncResult<()> {
        info!(tier = %tier, "Applying subscription tier");
        self.update_profile(ProfileUpdate::tier(tier)).await
    }

    /// Start synchronizing: register for auth events, then restore the
    /// current session and its profile.
    ///
    /// A session lookup failure is recorded in `error` and does not fail
    /// the call. The returned listener stops event handling when disposed or
    /// dropped.
    pub async fn initialize(self: &Arc<Self>) -> SyncResult<AuthListener> {
        // Register before reading the session so no event is missed.
        let events = self.auth.subscribe();
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(Arc::clone(self).listen(events, token.clone()));
        let listener = AuthListener {
            token: token.clone(),
            handle: Some(handle),
        };

        let _loading = LoadingGuard::begin(&self.state, true);
        let epoch = self.state.borrow().epoch;

        let session = match run_or_cancel(self.auth.get_session(), &token).await? {
            Ok(Some(session)) => session,
            Ok(None) => {
                info!("No existing session");
                return Ok(listener);
            }
            Err(err) => {
                warn!(error = %err, "Failed to read session");
                self.record_error(err.user_message());
                return Ok(listener);
            }
        };

        info!(user_id = %session.user.id, "Restoring session");
        self.transition(SessionInput::SessionEstablished);

        let profile = match self
            .resolve_profile(&session.user, &PollConfig::immediate(), &token)
            .await
        {
            Ok(profile) => Some(profile),
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(err) => {
                warn!(user_id = %session.user.id, error = %err, "Profile unavailable after restore");
                None
            }
        };

        self.commit_session(epoch, session, profile);
        Ok(listener)
    }

    /// Set user and profile together, unless the session changed meanwhile.
    ///
    /// `error` is left alone: anything recorded since the epoch began (a
    /// rejected overlapping sign-in) is newer than this result.
    fn commit_session(&self, epoch: u64, session: Session, profile: Option<Profile>) -> bool {
        self.state.send_if_modified(|s| {
            if s.epoch != epoch {
                debug!(user_id = %session.user.id, "Discarding stale session result");
                return false;
            }
            s.user = Some(session.clone());
            s.profile = profile.clone();
            s.resolving = None;
            self.apply_input(s, &SessionInput::ProfileSynced);
            true
        })
    }

    /// Fetch the profile, polling while it is not visible, then provision a
    /// default one if it never appears.
    async fn resolve_profile(
        &self,
        user: &AuthUser,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> SyncResult<Profile> {
        let mut backoff = Backoff::new(poll);
        let mut last_error = None;

        loop {
            match run_or_cancel(self.rows.fetch_profile(&user.id), cancel).await? {
                Ok(Some(profile)) => {
                    debug!(user_id = %user.id, waits = backoff.attempts(), "Profile found");
                    return Ok(profile);
                }
                Ok(None) => last_error = None,
                Err(err) if err.is_transient() => {
                    warn!(user_id = %user.id, error = %err, "Transient profile fetch failure");
                    last_error = Some(err);
                }
                Err(err) => return Err(SyncError::ProfileFetch(err)),
            }
            if !backoff.wait(cancel).await? {
                break;
            }
        }

        if let Some(err) = last_error {
            return Err(SyncError::ProfileFetch(err));
        }
        self.provision_profile(user, cancel).await
    }

    async fn provision_profile(
        &self,
        user: &AuthUser,
        cancel: &CancellationToken,
    ) -> SyncResult<Profile> {
        info!(user_id = %user.id, "Provisioning default profile");
        let draft = Profile::provisioned_for(user);

        match run_or_cancel(self.rows.insert_profile(&draft), cancel).await? {
            Ok(profile) => Ok(profile),
            Err(err) if err.is_conflict() => {
                // The server-side trigger got there first; its row wins.
                info!(user_id = %user.id, "Profile already provisioned, adopting it");
                match run_or_cancel(self.rows.fetch_profile(&user.id), cancel).await? {
                    Ok(Some(profile)) => Ok(profile),
                    Ok(None) => Err(SyncError::ProfileNotFound(user.id.clone())),
                    Err(err) => Err(SyncError::ProfileFetch(err)),
                }
            }
            Err(err) => Err(SyncError::ProfileProvisioning(err)),
        }
    }

    async fn listen(
        self: Arc<Self>,
        mut events: broadcast::Receiver<AuthChangeEvent>,
        token: CancellationToken,
    ) {
        debug!("Auth event listener started");
        let mut resolution: Option<CancellationToken> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(AuthChangeEvent::SignedIn(session)) => {
                    if let Some(previous) = resolution.take() {
                        previous.cancel();
                    }
                    let child = token.child_token();
                    self.handle_signed_in(session, child.clone());
                    resolution = Some(child);
                }
                Ok(AuthChangeEvent::SignedOut) => {
                    if let Some(previous) = resolution.take() {
                        previous.cancel();
                    }
                    self.handle_signed_out();
                }
                Ok(AuthChangeEvent::TokenRefreshed(session)) => {
                    self.handle_token_refreshed(session);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auth event listener lagged, resynchronizing");
                    self.resync(&token, &mut resolution).await;
                }
                Err(RecvError::Closed) => {
                    debug!("Auth event channel closed");
                    break;
                }
            }
        }

        if let Some(pending) = resolution {
            pending.cancel();
        }
        debug!("Auth event listener stopped");
    }

    /// Start resolving the profile for a freshly established session.
    fn handle_signed_in(self: &Arc<Self>, session: Session, cancel: CancellationToken) {
        info!(user_id = %session.user.id, "SIGNED_IN received");
        let mut epoch = 0;
        self.state.send_modify(|s| {
            s.epoch += 1;
            epoch = s.epoch;
            s.resolving = Some(epoch);
            s.error = None;
            self.apply_input(s, &SessionInput::SessionEstablished);
        });
        tokio::spawn(Arc::clone(self).complete_sign_in(session, epoch, cancel));
    }

    async fn complete_sign_in(
        self: Arc<Self>,
        session: Session,
        epoch: u64,
        cancel: CancellationToken,
    ) {
        let _loading = LoadingGuard::begin(&self.state, false);
        let user_id = session.user.id.clone();

        match self
            .resolve_profile(&session.user, &self.provisioning, &cancel)
            .await
        {
            Ok(profile) => {
                if self.commit_session(epoch, session, Some(profile)) {
                    info!(user_id = %user_id, "Session synchronized");
                }
            }
            Err(SyncError::Cancelled) => {
                debug!(user_id = %user_id, "Profile resolution cancelled");
            }
            Err(err) => {
                error!(user_id = %user_id, error = %err, "Failed to synchronize profile");
                let message = err.to_string();
                self.state.send_if_modified(|s| {
                    if s.epoch != epoch {
                        return false;
                    }
                    s.error = Some(message);
                    s.resolving = None;
                    self.settle_attempt(s, SessionInput::SyncFailed);
                    true
                });
            }
        }
    }

    fn handle_signed_out(&self) {
        info!("SIGNED_OUT received");
        self.state.send_modify(|s| {
            s.clear_identity();
            self.apply_input(s, &SessionInput::SignedOut);
        });
    }

    fn handle_token_refreshed(&self, session: Session) {
        let replaced = self.state.send_if_modified(|s| match &s.user {
            Some(current) if current.user.id == session.user.id => {
                s.user = Some(session.clone());
                true
            }
            _ => false,
        });
        if replaced {
            debug!(user_id = %session.user.id, "Session tokens refreshed");
        }
    }

    /// Re-derive the session after missed events.
    async fn resync(
        self: &Arc<Self>,
        token: &CancellationToken,
        resolution: &mut Option<CancellationToken>,
    ) {
        let current = match run_or_cancel(self.auth.get_session(), token).await {
            Ok(Ok(current)) => current,
            Ok(Err(err)) => {
                warn!(error = %err, "Session resync failed");
                self.record_error(err.user_message());
                return;
            }
            Err(_) => return,
        };

        let known = self.state.borrow().user_id().map(str::to_string);
        match (current, known) {
            (None, Some(_)) => {
                if let Some(previous) = resolution.take() {
                    previous.cancel();
                }
                self.handle_signed_out();
            }
            (Some(session), known) if known.as_deref() != Some(session.user.id.as_str()) => {
                if let Some(previous) = resolution.take() {
                    previous.cancel();
                }
                let child = token.child_token();
                self.handle_signed_in(session, child.clone());
                *resolution = Some(child);
            }
            (Some(session), _) => self.handle_token_refreshed(session),
            (None, None) => {}
        }
    }
}

/// Registration of the store's auth-event listener.
///
/// Dropping it stops the listener as well.
pub struct AuthListener {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl AuthListener {
    /// Stop handling events and cancel the waits this listener started.
    pub async fn dispose(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Auth event listener task failed");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for AuthListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baas_client::memory::{Failure, Operation};
    use baas_client::{InMemoryBaas, Role};
    use std::time::Duration;

    const EMAIL: &str = "ada@example.com";
    const PASSWORD: &str = "correct-horse";

    fn setup() -> (InMemoryBaas, Arc<AuthStore>) {
        let baas = InMemoryBaas::new();
        let store = Arc::new(AuthStore::with_backend(
            Arc::new(baas.clone()),
            PollConfig::profile_provisioning(),
        ));
        (baas, store)
    }

    async fn signed_in() -> (InMemoryBaas, Arc<AuthStore>, AuthListener) {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, Some("Ada Lovelace"));
        let listener = store.initialize().await.unwrap();
        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        let state = store.wait_until_settled().await.unwrap();
        assert!(state.profile.is_some());
        (baas, store, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_sign_in_records_error() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        let _listener = store.initialize().await.unwrap();

        let err = store.sign_in(EMAIL, "wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::AuthFailure(_)));

        let state = store.snapshot();
        assert_eq!(state.error.as_deref(), Some("Invalid login credentials"));
        assert!(state.user.is_none());
        assert!(!state.loading);
        assert_eq!(state.phase, SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_provisions_default_profile() {
        let (baas, store, _listener) = signed_in().await;

        let state = store.snapshot();
        let user = state.user.as_ref().unwrap();
        let profile = state.profile.as_ref().unwrap();
        assert_eq!(profile.id, user.user.id);
        assert_eq!(profile.role, Role::Consumer);
        assert_eq!(profile.subscription_tier, SubscriptionTier::Free);
        assert_eq!(profile.followers_count, 0);
        assert_eq!(profile.following_count, 0);
        assert_eq!(profile.full_name.as_deref(), Some("Ada Lovelace"));
        assert!(state.error.is_none());
        assert!(!state.loading);
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert_eq!(baas.profile_count(), 1);
        assert_eq!(baas.calls(Operation::InsertProfile), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_adopts_trigger_profile_once_visible() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.enable_profile_trigger(3);
        let _listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        let state = store.wait_until_settled().await.unwrap();

        assert!(state.profile.is_some());
        assert_eq!(baas.calls(Operation::FetchProfile), 3);
        assert_eq!(baas.calls(Operation::InsertProfile), 0);
        assert_eq!(baas.profile_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_conflict_adopts_existing_row() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        // The trigger's row stays hidden for longer than the poll lasts.
        baas.enable_profile_trigger(100);
        let _listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        let state = store.wait_until_settled().await.unwrap();

        assert!(state.profile.is_some());
        assert!(state.error.is_none());
        assert_eq!(baas.calls(Operation::InsertProfile), 1);
        assert_eq!(baas.profile_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_surfaces_error_only() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.fail(
            Operation::InsertProfile,
            Failure::api(403, "new row violates row-level security policy"),
        );
        let _listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        let state = store.wait_until_settled().await.unwrap();

        assert!(state.user.is_none());
        assert!(state.profile.is_none());
        assert_eq!(
            state.error.as_deref(),
            Some("Profile provisioning failed: new row violates row-level security policy")
        );
        assert_eq!(state.phase, SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn update_profile_keeps_optimistic_value() {
        let (baas, store, _listener) = signed_in().await;
        let user_id = store.current_user().unwrap().user.id;
        let fetches = baas.calls(Operation::FetchProfile);

        store
            .update_profile(ProfileUpdate {
                full_name: Some("Countess of Lovelace".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = store.snapshot();
        assert_eq!(
            state.profile.unwrap().full_name.as_deref(),
            Some("Countess of Lovelace")
        );
        assert_eq!(
            baas.profile(&user_id).unwrap().full_name.as_deref(),
            Some("Countess of Lovelace")
        );
        assert_eq!(baas.calls(Operation::FetchProfile), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn update_profile_rolls_back_on_rejection() {
        let (baas, store, _listener) = signed_in().await;
        let before = store.snapshot().profile.unwrap();
        baas.fail(Operation::UpdateProfile, Failure::api(403, "permission denied"));

        let err = store
            .update_profile(ProfileUpdate {
                full_name: Some("Mallory".into()),
                role: Some(Role::Developer),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ProfileWrite(_)));

        let state = store.snapshot();
        assert_eq!(state.profile.unwrap(), before);
        assert_eq!(state.error.as_deref(), Some("permission denied"));
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_value_is_visible_before_write_completes() {
        let (baas, store, _listener) = signed_in().await;
        baas.set_latency(Operation::UpdateProfile, Duration::from_millis(500));

        let pending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .apply_subscription_tier(SubscriptionTier::Enterprise)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = store.snapshot();
        assert!(state.loading);
        assert_eq!(state.tier(), SubscriptionTier::Enterprise);

        pending.await.unwrap().unwrap();
        assert!(!store.snapshot().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn update_profile_without_user_makes_no_remote_call() {
        let (baas, store) = setup();

        let err = store
            .update_profile(ProfileUpdate::tier(SubscriptionTier::Pro))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NoUser));
        assert_eq!(baas.calls(Operation::UpdateProfile), 0);
        assert!(!store.snapshot().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_clears_identity() {
        let (_baas, store, _listener) = signed_in().await;

        store.sign_out().await.unwrap();

        let state = store.snapshot();
        assert!(state.user.is_none());
        assert!(state.profile.is_none());
        assert!(!state.loading);
        assert_eq!(state.phase, SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sign_out_keeps_identity() {
        let (baas, store, _listener) = signed_in().await;
        baas.fail(Operation::SignOut, Failure::Network);

        assert!(store.sign_out().await.is_err());

        let state = store.snapshot();
        assert!(state.user.is_some());
        assert!(state.profile.is_some());
        assert_eq!(state.error.as_deref(), Some("Network unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn external_sign_out_clears_state() {
        let (baas, store, _listener) = signed_in().await;
        let mut rx = store.subscribe();

        baas.push_event(AuthChangeEvent::SignedOut);
        rx.wait_for(|s| s.user.is_none()).await.unwrap();

        let state = store.snapshot();
        assert!(state.profile.is_none());
        assert!(state.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_listener_resynchronizes_session() {
        let (baas, store, _listener) = signed_in().await;
        let session = store.current_user().unwrap();
        let lookups = baas.calls(Operation::GetSession);

        for _ in 0..20 {
            baas.push_event(AuthChangeEvent::TokenRefreshed(session.clone()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(baas.calls(Operation::GetSession), lookups + 1);
        let state = store.snapshot();
        assert_eq!(state.user, Some(session));
        assert!(state.profile.is_some());
        assert_eq!(state.phase, SessionPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_update_skips_remote_write() {
        let (baas, store, _listener) = signed_in().await;
        let before = store.snapshot();

        store.update_profile(ProfileUpdate::default()).await.unwrap();

        assert_eq!(baas.calls(Operation::UpdateProfile), 0);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_during_profile_resolution_wins() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.set_latency(Operation::FetchProfile, Duration::from_millis(300));
        let _listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.sign_out().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let state = store.snapshot();
        assert!(state.user.is_none());
        assert!(state.profile.is_none());
        assert!(!state.loading);
        assert_eq!(state.phase, SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_reauthentication_keeps_previous_pair() {
        let (_baas, store, _listener) = signed_in().await;
        let before = store.snapshot();

        assert!(store.sign_in(EMAIL, "wrong").await.is_err());

        let state = store.snapshot();
        assert_eq!(state.user, before.user);
        assert_eq!(state.profile, before.profile);
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert!(state.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_sign_in_during_profile_resolution_keeps_pair_consistent() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.set_latency(Operation::FetchProfile, Duration::from_millis(300));
        let _listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.sign_in(EMAIL, "wrong").await.is_err());
        assert_eq!(store.snapshot().phase, SessionPhase::Authenticating);

        let state = store.wait_until_settled().await.unwrap();
        assert!(state.user.is_some());
        assert!(state.profile.is_some());
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert_eq!(state.error.as_deref(), Some("Invalid login credentials"));
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_up_passes_full_name_to_provisioning() {
        let (_baas, store) = setup();
        let _listener = store.initialize().await.unwrap();

        let session = store
            .sign_up("grace@example.com", "hopper-1906", "Grace Hopper")
            .await
            .unwrap();
        assert!(session.is_some());

        let state = store.wait_until_settled().await.unwrap();
        assert_eq!(
            state.profile.unwrap().full_name.as_deref(),
            Some("Grace Hopper")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sign_up_pending_confirmation_returns_to_anonymous() {
        let (baas, store) = setup();
        baas.set_auto_confirm(false);
        let _listener = store.initialize().await.unwrap();

        let session = store
            .sign_up("grace@example.com", "hopper-1906", "Grace Hopper")
            .await
            .unwrap();

        assert!(session.is_none());
        let state = store.snapshot();
        assert!(state.user.is_none());
        assert_eq!(state.phase, SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_restores_session_and_profile() {
        let (baas, store) = setup();
        let user = baas.add_account(EMAIL, PASSWORD, None);
        let mut profile = Profile::provisioned_for(&user);
        profile.subscription_tier = SubscriptionTier::Pro;
        baas.seed_profile(profile.clone());
        baas.establish_session(EMAIL).unwrap();

        let _listener = store.initialize().await.unwrap();

        let state = store.snapshot();
        assert_eq!(state.user_id(), Some(user.id.as_str()));
        assert_eq!(state.profile, Some(profile));
        assert_eq!(state.phase, SessionPhase::Authenticated);
        assert!(!state.loading);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_provisions_missing_profile() {
        let (baas, store) = setup();
        let user = baas.add_account(EMAIL, PASSWORD, Some("Ada"));
        baas.establish_session(EMAIL).unwrap();

        let _listener = store.initialize().await.unwrap();

        let state = store.snapshot();
        assert_eq!(state.profile, Some(Profile::provisioned_for(&user)));
        assert_eq!(baas.calls(Operation::FetchProfile), 1);
        assert_eq!(baas.calls(Operation::InsertProfile), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_records_session_error() {
        let (baas, store) = setup();
        baas.fail(Operation::GetSession, Failure::api(400, "Invalid Refresh Token"));

        let listener = store.initialize().await.unwrap();

        let state = store.snapshot();
        assert_eq!(state.error.as_deref(), Some("Invalid Refresh Token"));
        assert!(state.user.is_none());
        assert!(state.profile.is_none());
        assert!(listener.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_profile_fetch_error_is_non_fatal() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.establish_session(EMAIL).unwrap();
        baas.fail(Operation::FetchProfile, Failure::api(403, "permission denied"));

        let _listener = store.initialize().await.unwrap();

        let state = store.snapshot();
        assert!(state.user.is_some());
        assert!(state.profile.is_none());
        assert_eq!(baas.calls(Operation::InsertProfile), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn token_refresh_replaces_session_without_refetch() {
        let (baas, store, _listener) = signed_in().await;
        let fetches = baas.calls(Operation::FetchProfile);
        let mut rx = store.subscribe();
        baas.expire_session();

        let refreshed = baas.get_session().await.unwrap().unwrap();
        rx.wait_for(|s| {
            s.user.as_ref().map(|u| u.access_token.as_str()) == Some(refreshed.access_token.as_str())
        })
        .await
        .unwrap();

        assert_eq!(baas.calls(Operation::FetchProfile), fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_listener_ignores_events() {
        let (baas, store, listener) = signed_in().await;

        listener.dispose().await;
        baas.push_event(AuthChangeEvent::SignedOut);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.snapshot().user.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_pending_resolution() {
        let (baas, store) = setup();
        baas.add_account(EMAIL, PASSWORD, None);
        baas.set_latency(Operation::FetchProfile, Duration::from_secs(30));
        let listener = store.initialize().await.unwrap();

        store.sign_in(EMAIL, PASSWORD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.snapshot().loading);

        store.dispose();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = store.snapshot();
        assert!(!state.loading);
        assert!(state.user.is_none());
        assert!(!listener.is_active());
        assert!(store.is_disposed());
    }
}
