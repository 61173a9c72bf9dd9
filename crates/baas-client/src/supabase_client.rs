//! Supabase REST client: GoTrue auth, PostgREST rows and edge functions.

use crate::api::{AuthApi, EdgeFunctions, RowStore};
use crate::error::{BaasError, BaasResult};
use crate::types::{
    AppListing, AuthChangeEvent, AuthUser, CheckoutRequest, CheckoutSession, Profile,
    ProfileUpdate, Session, Subscription, UserMetadata,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;
const UNIQUE_VIOLATION: &str = "23505";

fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Pull the human-readable message out of a GoTrue / PostgREST / function
/// error body. Falls back to the raw body when it is not JSON.
fn extract_error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    ["error_description", "msg", "message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

fn is_unique_violation(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("code")
                .and_then(|code| code.as_str())
                .map(|code| code == UNIQUE_VIOLATION)
        })
        .unwrap_or(false)
}

/// PostgREST equality filter.
fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

fn profile_query(user_id: &str) -> [(&'static str, String); 3] {
    [
        ("id", eq(user_id)),
        ("select", "*".to_string()),
        ("limit", "1".to_string()),
    ]
}

fn app_query(app_id: &str) -> [(&'static str, String); 3] {
    [
        ("id", eq(app_id)),
        ("select", "id,name,description,price".to_string()),
        ("limit", "1".to_string()),
    ]
}

fn error_from_response(status: u16, body: &str) -> BaasError {
    let message = extract_error_message(body);
    if status == 409 || is_unique_violation(body) {
        BaasError::Conflict(message)
    } else {
        BaasError::Api { status, message }
    }
}

/// Token grant response from `/auth/v1/token` and `/auth/v1/signup`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .unwrap_or_else(|| chrono::Utc::now().timestamp() + self.expires_in);
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: self.user,
        }
    }
}

#[derive(Debug, Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct SignUpRequest<'a> {
    email: &'a str,
    password: &'a str,
    data: &'a UserMetadata,
}

#[derive(Debug, Serialize)]
struct CancelSubscriptionRequest<'a> {
    subscription_id: &'a str,
}

/// Supabase client holding the current session in memory.
///
/// Clones share the session and the event channel.
#[derive(Clone)]
pub struct SupabaseClient {
    http_client: reqwest::Client,
    api_url: String,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    events: broadcast::Sender<AuthChangeEvent>,
}

impl SupabaseClient {
    /// Create a new Supabase client.
    ///
    /// # Arguments
    /// * `api_url` - The Supabase project API URL (e.g., `https://xyz.supabase.co`)
    /// * `anon_key` - The Supabase anonymous API key
    pub fn new(api_url: impl Into<String>, anon_key: impl Into<String>) -> BaasResult<Self> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let anon_key = anon_key.into();
        if api_url.is_empty() {
            return Err(BaasError::Config("Supabase URL is empty".into()));
        }
        if anon_key.is_empty() {
            return Err(BaasError::Config("Supabase anon key is empty".into()));
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            http_client: reqwest::Client::new(),
            api_url,
            anon_key,
            session: Arc::new(RwLock::new(None)),
            events,
        })
    }

    /// Adopt a previously persisted session without emitting an event.
    pub async fn restore_session(&self, session: Session) {
        debug!(user_id = %session.user.id, "Restoring persisted session");
        *self.session.write().await = Some(session);
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.api_url, path)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    /// Request against a PostgREST table. Query values are percent-encoded,
    /// so ids taken from return URLs cannot add or alter parameters.
    fn rest_request(
        &self,
        method: reqwest::Method,
        table: &str,
        query: &[(&str, String)],
    ) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, self.rest_url(table))
            .query(query)
            .header("apikey", &self.anon_key)
    }

    fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.api_url, name)
    }

    /// Bearer token for row and function calls: the session's access token,
    /// or the anon key when signed out.
    async fn bearer(&self) -> String {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
            .unwrap_or_else(|| self.anon_key.clone())
    }

    async fn require_access_token(&self) -> BaasResult<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|session| session.access_token.clone())
            .ok_or(BaasError::NotLoggedIn)
    }

    async fn ensure_success(
        response: reqwest::Response,
        operation: &str,
    ) -> BaasResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body_summary = summarize_response_body(&body);
        error!(status = %status, body_summary = %body_summary, operation, "Supabase request failed");
        Err(error_from_response(status.as_u16(), &body))
    }

    fn emit(&self, event: AuthChangeEvent) {
        debug!(event = event.name(), "Emitting auth event");
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn token_grant<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> BaasResult<Session> {
        let url = format!("{}?grant_type={}", self.auth_url("token"), grant_type);
        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        let response = Self::ensure_success(response, grant_type).await?;
        let data: TokenResponse = response.json().await?;
        Ok(data.into_session())
    }

    async fn refresh(&self, refresh_token: &str) -> BaasResult<Session> {
        debug!("Refreshing Supabase session");
        self.token_grant("refresh_token", &RefreshGrant { refresh_token })
            .await
    }

    async fn first_row<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> BaasResult<Option<T>> {
        let rows: Vec<T> = response.json().await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl AuthApi for SupabaseClient {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> BaasResult<Session> {
        debug!(email = %email, "Attempting email/password sign-in");
        let session = self
            .token_grant("password", &PasswordGrant { email, password })
            .await?;
        *self.session.write().await = Some(session.clone());
        info!(user_id = %session.user.id, "Signed in");
        self.emit(AuthChangeEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &UserMetadata,
    ) -> BaasResult<Option<Session>> {
        debug!(email = %email, "Registering account");
        let response = self
            .http_client
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .header("Content-Type", "application/json")
            .json(&SignUpRequest {
                email,
                password,
                data: metadata,
            })
            .send()
            .await?;
        let response = Self::ensure_success(response, "signup").await?;
        let body: serde_json::Value = response.json().await?;

        // Without auto-confirm the body is the bare user and carries no tokens.
        if body.get("access_token").is_none() {
            info!(email = %email, "Sign-up pending email confirmation");
            return Ok(None);
        }

        let session = serde_json::from_value::<TokenResponse>(body)?.into_session();
        *self.session.write().await = Some(session.clone());
        info!(user_id = %session.user.id, "Signed up");
        self.emit(AuthChangeEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_out(&self) -> BaasResult<()> {
        let Some(session) = self.session.read().await.clone() else {
            debug!("Sign-out without a session");
            self.emit(AuthChangeEvent::SignedOut);
            return Ok(());
        };

        let response = self
            .http_client
            .post(self.auth_url("logout"))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        // An already-revoked token means the server side is signed out too.
        if response.status().as_u16() != 401 {
            Self::ensure_success(response, "logout").await?;
        }

        *self.session.write().await = None;
        info!(user_id = %session.user.id, "Signed out");
        self.emit(AuthChangeEvent::SignedOut);
        Ok(())
    }

    async fn get_session(&self) -> BaasResult<Option<Session>> {
        let Some(session) = self.session.read().await.clone() else {
            return Ok(None);
        };
        if !session.is_expired() {
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                *self.session.write().await = Some(refreshed.clone());
                self.emit(AuthChangeEvent::TokenRefreshed(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(err) if err.is_transient() => {
                warn!(error = %err, "Session refresh failed transiently");
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "Session refresh rejected, clearing session");
                *self.session.write().await = None;
                Err(err)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChangeEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RowStore for SupabaseClient {
    async fn fetch_profile(&self, user_id: &str) -> BaasResult<Option<Profile>> {
        debug!(user_id = %user_id, "Fetching profile");
        let response = self
            .rest_request(reqwest::Method::GET, "profiles", &profile_query(user_id))
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = Self::ensure_success(response, "fetch_profile").await?;
        Self::first_row(response).await
    }

    async fn insert_profile(&self, profile: &Profile) -> BaasResult<Profile> {
        debug!(user_id = %profile.id, "Inserting profile");
        let response = self
            .http_client
            .post(self.rest_url("profiles"))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(profile)
            .send()
            .await?;
        let response = Self::ensure_success(response, "insert_profile").await?;
        let stored: Option<Profile> = Self::first_row(response).await?;
        Ok(stored.unwrap_or_else(|| profile.clone()))
    }

    async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> BaasResult<()> {
        debug!(user_id = %user_id, "Updating profile");
        let response = self
            .rest_request(reqwest::Method::PATCH, "profiles", &[("id", eq(user_id))])
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=minimal")
            .json(update)
            .send()
            .await?;
        Self::ensure_success(response, "update_profile").await?;
        Ok(())
    }

    async fn fetch_subscription(&self) -> BaasResult<Option<Subscription>> {
        let query = [("select", "*".to_string()), ("limit", "1".to_string())];
        let response = self
            .rest_request(reqwest::Method::GET, "stripe_user_subscriptions", &query)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = Self::ensure_success(response, "fetch_subscription").await?;
        Self::first_row(response).await
    }

    async fn fetch_app(&self, app_id: &str) -> BaasResult<Option<AppListing>> {
        let response = self
            .rest_request(reqwest::Method::GET, "apps", &app_query(app_id))
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = Self::ensure_success(response, "fetch_app").await?;
        Self::first_row(response).await
    }
}

#[async_trait]
impl EdgeFunctions for SupabaseClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BaasResult<CheckoutSession> {
        let access_token = self.require_access_token().await?;
        debug!(mode = ?request.mode, "Creating checkout session");
        let response = self
            .http_client
            .post(self.function_url("stripe-checkout"))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;
        let response = Self::ensure_success(response, "stripe-checkout").await?;
        Ok(response.json().await?)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BaasResult<()> {
        let access_token = self.require_access_token().await?;
        debug!(subscription_id = %subscription_id, "Cancelling subscription");
        let response = self
            .http_client
            .post(self.function_url("cancel-subscription"))
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("Content-Type", "application/json")
            .json(&CancelSubscriptionRequest { subscription_id })
            .send()
            .await?;
        Self::ensure_success(response, "cancel-subscription").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_gotrue_error_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        assert_eq!(extract_error_message(body), "Invalid login credentials");
    }

    #[test]
    fn extracts_msg_and_message_keys() {
        assert_eq!(
            extract_error_message(r#"{"code":400,"msg":"User already registered"}"#),
            "User already registered"
        );
        assert_eq!(
            extract_error_message(r#"{"message":"permission denied for table profiles"}"#),
            "permission denied for table profiles"
        );
    }

    #[test]
    fn non_json_body_is_used_verbatim() {
        assert_eq!(extract_error_message("  Bad Gateway \n"), "Bad Gateway");
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let body = r#"{"code":"23505","message":"duplicate key value violates unique constraint \"profiles_pkey\""}"#;
        assert!(error_from_response(400, body).is_conflict());
        assert!(error_from_response(409, "{}").is_conflict());
        assert!(!error_from_response(400, r#"{"message":"bad"}"#).is_conflict());
    }

    #[test]
    fn token_response_prefers_server_expiry() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":3600,"expires_at":1700000000,
                "user":{"id":"u1","email":"ada@example.com","user_metadata":{"full_name":"Ada"}}}"#,
        )
        .unwrap();
        let session = response.into_session();
        assert_eq!(session.expires_at, 1_700_000_000);
        assert_eq!(session.user.user_metadata.full_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn token_response_derives_expiry_from_ttl() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expires_in":3600,"user":{"id":"u1"}}"#,
        )
        .unwrap();
        let before = chrono::Utc::now().timestamp();
        let session = response.into_session();
        assert!(session.expires_at >= before + 3600);
    }

    #[test]
    fn rejects_empty_configuration() {
        assert!(matches!(
            SupabaseClient::new("", "key"),
            Err(BaasError::Config(_))
        ));
        assert!(matches!(
            SupabaseClient::new("https://x.supabase.co", ""),
            Err(BaasError::Config(_))
        ));
    }

    #[tokio::test]
    async fn urls_are_built_from_trimmed_base() {
        let client = SupabaseClient::new("https://x.supabase.co/", "anon").unwrap();
        assert_eq!(client.rest_url("profiles"), "https://x.supabase.co/rest/v1/profiles");
        assert_eq!(
            client.function_url("stripe-checkout"),
            "https://x.supabase.co/functions/v1/stripe-checkout"
        );
        assert_eq!(client.bearer().await, "anon");
        assert!(matches!(
            client.require_access_token().await,
            Err(BaasError::NotLoggedIn)
        ));
    }

    #[test]
    fn app_lookup_encodes_untrusted_id() {
        let client = SupabaseClient::new("https://x.supabase.co", "anon").unwrap();
        let request = client
            .rest_request(reqwest::Method::GET, "apps", &app_query("x&select=id"))
            .build()
            .unwrap();

        assert_eq!(request.url().path(), "/rest/v1/apps");
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("id".to_string(), "eq.x&select=id".to_string()),
                ("select".to_string(), "id,name,description,price".to_string()),
                ("limit".to_string(), "1".to_string()),
            ]
        );
        assert!(request.url().as_str().contains("id=eq.x%26select%3Did"));
        assert_eq!(request.headers()["apikey"], "anon");
    }

    #[test]
    fn profile_lookup_filters_on_id() {
        let client = SupabaseClient::new("https://x.supabase.co", "anon").unwrap();
        let request = client
            .rest_request(reqwest::Method::GET, "profiles", &profile_query("u1"))
            .build()
            .unwrap();
        assert_eq!(request.url().query(), Some("id=eq.u1&select=*&limit=1"));
    }

    #[tokio::test]
    async fn restored_session_supplies_bearer() {
        let client = SupabaseClient::new("https://x.supabase.co", "anon").unwrap();
        client
            .restore_session(Session {
                access_token: "token".into(),
                refresh_token: "refresh".into(),
                expires_at: i64::MAX,
                user: AuthUser {
                    id: "u1".into(),
                    email: None,
                    user_metadata: UserMetadata::default(),
                },
            })
            .await;
        assert_eq!(client.bearer().await, "token");
        let session = client.get_session().await.unwrap().unwrap();
        assert_eq!(session.user.id, "u1");
    }
}
