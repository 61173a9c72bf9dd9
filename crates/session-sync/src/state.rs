//! The synchronizer's read model.

use crate::auth_fsm::SessionPhase;
use baas_client::{Profile, Session, SubscriptionTier};
use serde::Serialize;
use tokio::sync::watch;

/// Snapshot of the authenticated identity.
///
/// `profile` is only ever set together with `user`. `loading` is true while
/// at least one store operation is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthState {
    pub user: Option<Session>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: SessionPhase,
    #[serde(skip)]
    pub(crate) in_flight: usize,
    /// Bumped on every session change.
    #[serde(skip)]
    pub(crate) epoch: u64,
    /// Epoch whose `SIGNED_IN` profile lookup has not committed yet.
    #[serde(skip)]
    pub(crate) resolving: Option<u64>,
}

impl AuthState {
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|session| session.user.id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Access tier used for gating; `free` without a profile.
    pub fn tier(&self) -> SubscriptionTier {
        self.profile
            .as_ref()
            .map(|profile| profile.subscription_tier)
            .unwrap_or_default()
    }

    pub(crate) fn clear_identity(&mut self) {
        self.user = None;
        self.profile = None;
        self.error = None;
        self.epoch += 1;
        self.resolving = None;
    }

    /// Whether a `SIGNED_IN` lookup for the current session is still pending.
    pub(crate) fn is_resolving(&self) -> bool {
        self.resolving == Some(self.epoch)
    }
}

/// Keeps `loading` raised for as long as it lives.
pub(crate) struct LoadingGuard<'a> {
    state: &'a watch::Sender<AuthState>,
}

impl<'a> LoadingGuard<'a> {
    /// Raise `loading`, optionally clearing `error` in the same mutation.
    pub(crate) fn begin(state: &'a watch::Sender<AuthState>, clear_error: bool) -> Self {
        state.send_modify(|s| {
            s.in_flight += 1;
            s.loading = true;
            if clear_error {
                s.error = None;
            }
        });
        Self { state }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            s.loading = s.in_flight > 0;
        });
    }
}
