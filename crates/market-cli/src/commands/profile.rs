//! Profile commands.

use super::Context;
use crate::output::{self, heading, row};
use anyhow::{bail, Result};
use baas_client::{Profile, ProfileUpdate};
use serde::Serialize;
use session_sync::SyncError;
use std::fmt;

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ProfileView(Profile);

impl fmt::Display for ProfileView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let profile = &self.0;
        writeln!(f, "{}", heading("Profile"))?;
        writeln!(f, "{}", row("Id", &profile.id))?;
        writeln!(f, "{}", row("Email", profile.email.as_deref().unwrap_or("-")))?;
        writeln!(f, "{}", row("Name", profile.full_name.as_deref().unwrap_or("-")))?;
        writeln!(f, "{}", row("Avatar", profile.avatar_url.as_deref().unwrap_or("-")))?;
        writeln!(f, "{}", row("Role", &format!("{:?}", profile.role).to_lowercase()))?;
        writeln!(f, "{}", row("Tier", profile.subscription_tier.as_str()))?;
        write!(
            f,
            "{}",
            row(
                "Followers",
                &format!("{} / following {}", profile.followers_count, profile.following_count)
            )
        )
    }
}

fn current_profile(ctx: &Context) -> Result<Profile> {
    let state = ctx.store.snapshot();
    if !state.is_authenticated() {
        return Err(SyncError::NoUser.into());
    }
    match state.profile {
        Some(profile) => Ok(profile),
        None => bail!(state
            .error
            .unwrap_or_else(|| "Profile is not available yet".to_string())),
    }
}

/// Show the signed-in user's profile.
pub async fn profile_show(ctx: &Context) -> Result<()> {
    let profile = current_profile(ctx)?;
    output::print(&ProfileView(profile), ctx.format);
    Ok(())
}

/// Apply a partial profile update.
pub async fn profile_update(
    ctx: &Context,
    full_name: Option<String>,
    avatar_url: Option<String>,
) -> Result<()> {
    let update = ProfileUpdate {
        full_name,
        avatar_url,
        ..Default::default()
    };
    if update.is_empty() {
        bail!("Nothing to update. Pass --full-name or --avatar-url");
    }

    ctx.store.update_profile(update).await?;
    let profile = current_profile(ctx)?;
    output::print(&ProfileView(profile), ctx.format);
    Ok(())
}
