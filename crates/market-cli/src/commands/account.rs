//! Account commands: status, sign-in, sign-up and sign-out.

use super::{prompt_line, Context};
use crate::output::{self, heading, row};
use anyhow::{bail, Result};
use baas_client::SubscriptionTier;
use serde::Serialize;
use session_sync::{AuthState, SessionPhase};
use std::fmt;

/// What `status` shows. Tokens are never printed.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub signed_in: bool,
    pub phase: SessionPhase,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub tier: SubscriptionTier,
    pub profile_loaded: bool,
    pub error: Option<String>,
}

impl From<&AuthState> for StatusView {
    fn from(state: &AuthState) -> Self {
        let email = state
            .profile
            .as_ref()
            .and_then(|profile| profile.email.clone())
            .or_else(|| state.user.as_ref().and_then(|s| s.user.email.clone()));
        Self {
            signed_in: state.is_authenticated(),
            phase: state.phase,
            user_id: state.user_id().map(str::to_string),
            email,
            full_name: state.profile.as_ref().and_then(|p| p.full_name.clone()),
            tier: state.tier(),
            profile_loaded: state.profile.is_some(),
            error: state.error.clone(),
        }
    }
}

impl fmt::Display for StatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", heading("Account"))?;
        if !self.signed_in {
            write!(f, "{}", row("Signed in", "no"))?;
        } else {
            writeln!(f, "{}", row("Signed in", "yes"))?;
            writeln!(f, "{}", row("Email", self.email.as_deref().unwrap_or("-")))?;
            writeln!(f, "{}", row("Name", self.full_name.as_deref().unwrap_or("-")))?;
            let tier = if self.profile_loaded {
                self.tier.to_string()
            } else {
                format!("{} (profile unavailable)", self.tier)
            };
            write!(f, "{}", row("Tier", &tier))?;
        }
        if let Some(error) = &self.error {
            write!(f, "\n{}", row("Last error", error))?;
        }
        Ok(())
    }
}

/// Show the synchronized identity.
pub async fn status(ctx: &Context) -> Result<()> {
    let view = StatusView::from(&ctx.store.snapshot());
    output::print(&view, ctx.format);
    Ok(())
}

fn read_credentials(email: Option<String>, password: Option<String>) -> Result<(String, String)> {
    let email = match email {
        Some(email) => email.trim().to_string(),
        None => prompt_line("Email")?,
    };
    if email.is_empty() {
        bail!("Email is required");
    }

    let password = match password {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };
    if password.is_empty() {
        bail!("Password is required");
    }
    Ok((email, password))
}

/// Sign in with email and password and wait for the profile.
pub async fn sign_in(ctx: &Context, email: Option<String>, password: Option<String>) -> Result<()> {
    if let Some(session) = ctx.store.current_user() {
        let who = session.user.email.unwrap_or(session.user.id);
        output::print_success(&format!("Already signed in as {}", who), ctx.format);
        return Ok(());
    }

    let (email, password) = read_credentials(email, password)?;
    ctx.store.sign_in(&email, &password).await?;
    let state = ctx.store.wait_until_settled().await?;

    if !state.is_authenticated() {
        bail!(state.error.unwrap_or_else(|| "Sign-in did not complete".to_string()));
    }
    if let Some(error) = &state.error {
        output::print_error(error, ctx.format);
    }
    output::print_success(&format!("Signed in as {}", email), ctx.format);
    Ok(())
}

/// Register a new account.
pub async fn sign_up(
    ctx: &Context,
    email: Option<String>,
    password: Option<String>,
    full_name: Option<String>,
) -> Result<()> {
    let (email, password) = read_credentials(email, password)?;
    let full_name = match full_name {
        Some(name) => name,
        None => prompt_line("Full name")?,
    };

    match ctx.store.sign_up(&email, &password, &full_name).await? {
        Some(_) => {
            ctx.store.wait_until_settled().await?;
            output::print_success(&format!("Account created, signed in as {}", email), ctx.format);
        }
        None => output::print_success(
            &format!("Check {} for a confirmation link, then sign in", email),
            ctx.format,
        ),
    }
    Ok(())
}

/// Sign out and forget the persisted session.
pub async fn sign_out(ctx: &Context) -> Result<()> {
    if ctx.store.current_user().is_none() {
        output::print_success("Not signed in", ctx.format);
        return Ok(());
    }
    ctx.store.sign_out().await?;
    output::print_success("Signed out", ctx.format);
    Ok(())
}
