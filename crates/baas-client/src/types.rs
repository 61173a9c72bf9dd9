//! Models shared between the BaaS client and the core.

use serde::{Deserialize, Serialize};

/// Seconds before `expires_at` at which a session is already treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 30;

/// Metadata attached to the auth user at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Identity returned by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    /// User UUID
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
}

/// Credential bundle issued by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as Unix epoch seconds.
    pub expires_at: i64,
    pub user: AuthUser,
}

impl Session {
    /// Whether the access token should be refreshed before use.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }

    /// Whether the access token is expired at the given epoch second.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at - EXPIRY_MARGIN_SECS
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// Auth-state change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChangeEvent {
    /// A session was established (sign-in, sign-up with auto-confirm).
    SignedIn(Session),
    /// The session was destroyed.
    SignedOut,
    /// The tokens of the current session were rotated.
    TokenRefreshed(Session),
}

impl AuthChangeEvent {
    /// Wire name of the event, as the auth subsystem reports it.
    pub fn name(&self) -> &'static str {
        match self {
            AuthChangeEvent::SignedIn(_) => "SIGNED_IN",
            AuthChangeEvent::SignedOut => "SIGNED_OUT",
            AuthChangeEvent::TokenRefreshed(_) => "TOKEN_REFRESHED",
        }
    }
}

/// Marketplace role of a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Consumer,
    Developer,
}

/// Locally-authoritative access level used for gating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Same UUID as the auth user.
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub following_count: i64,
}

impl Profile {
    /// The default profile provisioned for a user that has none yet.
    pub fn provisioned_for(user: &AuthUser) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            full_name: user.user_metadata.full_name.clone(),
            avatar_url: user.user_metadata.avatar_url.clone(),
            role: Role::Consumer,
            subscription_tier: SubscriptionTier::Free,
            followers_count: 0,
            following_count: 0,
        }
    }
}

/// Partial profile update. Only present fields are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_tier: Option<SubscriptionTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following_count: Option<i64>,
}

impl ProfileUpdate {
    /// Update that only changes the subscription tier.
    pub fn tier(tier: SubscriptionTier) -> Self {
        Self {
            subscription_tier: Some(tier),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply every present field to `profile`.
    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(email) = &self.email {
            profile.email = Some(email.clone());
        }
        if let Some(full_name) = &self.full_name {
            profile.full_name = Some(full_name.clone());
        }
        if let Some(avatar_url) = &self.avatar_url {
            profile.avatar_url = Some(avatar_url.clone());
        }
        if let Some(role) = self.role {
            profile.role = role;
        }
        if let Some(tier) = self.subscription_tier {
            profile.subscription_tier = tier;
        }
        if let Some(count) = self.followers_count {
            profile.followers_count = count;
        }
        if let Some(count) = self.following_count {
            profile.following_count = count;
        }
    }

    /// Undo this update on `profile`, restoring values from `snapshot`.
    ///
    /// A field is only restored while it still holds the value this update
    /// wrote; a newer write to the same field is left alone.
    pub fn revert(&self, profile: &mut Profile, snapshot: &Profile) {
        if self.email.is_some() && profile.email == self.email {
            profile.email = snapshot.email.clone();
        }
        if self.full_name.is_some() && profile.full_name == self.full_name {
            profile.full_name = snapshot.full_name.clone();
        }
        if self.avatar_url.is_some() && profile.avatar_url == self.avatar_url {
            profile.avatar_url = snapshot.avatar_url.clone();
        }
        if self.role == Some(profile.role) {
            profile.role = snapshot.role;
        }
        if self.subscription_tier == Some(profile.subscription_tier) {
            profile.subscription_tier = snapshot.subscription_tier;
        }
        if self.followers_count == Some(profile.followers_count) {
            profile.followers_count = snapshot.followers_count;
        }
        if self.following_count == Some(profile.following_count) {
            profile.following_count = snapshot.following_count;
        }
    }
}

/// Billing status as the payment provider reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    NotStarted,
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    /// Whether the provider has finished processing the checkout.
    pub fn is_settled(&self) -> bool {
        !matches!(
            self,
            SubscriptionStatus::NotStarted | SubscriptionStatus::Incomplete
        )
    }

    /// Whether the subscription currently grants paid access.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

/// Row of the caller-scoped `stripe_user_subscriptions` view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(rename = "subscription_status")]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub price_id: Option<String>,
    /// End of the current billing period, Unix epoch seconds.
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

/// Row of the `apps` table, as far as checkout display needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppListing {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: f64,
}

/// Kind of checkout session to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    /// Recurring plan.
    Subscription,
    /// One-time purchase.
    Payment,
}

/// Input of the checkout edge function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    pub mode: CheckoutMode,
    pub success_url: String,
    pub cancel_url: String,
}

/// Output of the checkout edge function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    pub url: String,
}
