//! CLI command implementations.

mod account;
mod billing;
mod profile;

pub use account::{sign_in, sign_out, sign_up, status};
pub use billing::{cancel, checkout, plans, reconcile_return, subscription};
pub use profile::{profile_show, profile_update};

use crate::output::OutputFormat;
use crate::session_file;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use baas_client::{AuthApi, EdgeFunctions, InMemoryBaas, RowStore, SupabaseClient};
use checkout_reconciler::{CheckoutReconciler, CheckoutSettings, ConfirmationPrompt, PlanCatalog};
use market_config::{Config, Paths};
use session_sync::{AuthListener, AuthStore};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

type Backend = (Arc<dyn AuthApi>, Arc<dyn RowStore>, Arc<dyn EdgeFunctions>);

fn split_backend<B>(backend: Arc<B>) -> Backend
where
    B: AuthApi + RowStore + EdgeFunctions + 'static,
{
    let auth: Arc<dyn AuthApi> = backend.clone();
    let rows: Arc<dyn RowStore> = backend.clone();
    let functions: Arc<dyn EdgeFunctions> = backend;
    (auth, rows, functions)
}

/// Everything a command needs: the synchronized identity and the checkout
/// reconciler, wired to either Supabase or the in-memory demo backend.
pub struct Context {
    pub format: OutputFormat,
    pub store: Arc<AuthStore>,
    pub checkout: CheckoutReconciler,
    listener: AuthListener,
    session_path: PathBuf,
}

impl Context {
    /// Build the backend, restore the persisted session and wait for the
    /// store to settle.
    pub async fn open(config: &Config, paths: &Paths, demo: bool, format: OutputFormat) -> Result<Self> {
        let (backend, session_path) = if demo {
            let baas = InMemoryBaas::demo();
            let session_path = paths.demo_session_file();
            if let Some(email) = session_file::load(&session_path).and_then(|s| s.user.email) {
                if baas.establish_session(&email).is_none() {
                    debug!(email = %email, "Persisted demo account no longer exists");
                }
            }
            info!("Using in-memory demo backend");
            (split_backend(Arc::new(baas)), session_path)
        } else {
            let client = SupabaseClient::new(&config.supabase_url, &config.supabase_anon_key)?;
            let session_path = paths.session_file();
            if let Some(session) = session_file::load(&session_path) {
                client.restore_session(session).await;
            }
            (split_backend(Arc::new(client)), session_path)
        };
        let (auth, rows, functions) = backend;

        let store = Arc::new(AuthStore::new(
            auth,
            Arc::clone(&rows),
            config.profile_provisioning.clone(),
        ));
        let listener = store.initialize().await?;
        store.wait_until_settled().await?;

        let settings = CheckoutSettings::from_config(config)?;
        let checkout = CheckoutReconciler::new(
            Arc::clone(&store),
            functions,
            rows,
            PlanCatalog::default(),
            settings,
        );

        Ok(Self {
            format,
            store,
            checkout,
            listener,
            session_path,
        })
    }

    /// Persist the current session and stop background work.
    pub async fn close(self) -> Result<()> {
        let session = self.store.current_user();
        let persisted = session_file::store(&self.session_path, session.as_ref());
        self.checkout.dispose();
        self.listener.dispose().await;
        self.store.dispose();
        persisted
    }
}

/// Read one trimmed line from stdin after printing `label`.
fn prompt_line(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Ask user for confirmation.
fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    io::stdout().flush().ok();

    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }

    matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Confirms on the terminal.
pub struct StdinPrompt;

#[async_trait]
impl ConfirmationPrompt for StdinPrompt {
    async fn confirm(&self, message: &str) -> bool {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || confirm(&message))
            .await
            .unwrap_or(false)
    }
}

/// Confirms without asking, for `--yes`.
pub struct AssumeYes;

#[async_trait]
impl ConfirmationPrompt for AssumeYes {
    async fn confirm(&self, _message: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baas_client::SubscriptionTier;
    use checkout_reconciler::CheckoutItem;
    use tempfile::tempdir;

    async fn open_demo(paths: &Paths) -> Context {
        Context::open(&Config::default(), paths, true, OutputFormat::Json)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn demo_session_survives_restart() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let ctx = open_demo(&paths).await;
        assert!(ctx.store.current_user().is_none());
        sign_in(
            &ctx,
            Some("demo@appmarket.dev".into()),
            Some("demo-password".into()),
        )
        .await
        .unwrap();
        ctx.close().await.unwrap();
        assert!(paths.demo_session_file().exists());

        let ctx = open_demo(&paths).await;
        let state = ctx.store.snapshot();
        assert!(state.is_authenticated());
        assert_eq!(
            state.profile.unwrap().full_name.as_deref(),
            Some("Demo User")
        );

        sign_out(&ctx).await.unwrap();
        ctx.close().await.unwrap();
        assert!(!paths.demo_session_file().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn demo_checkout_is_simulated() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let ctx = open_demo(&paths).await;
        sign_in(
            &ctx,
            Some("demo@appmarket.dev".into()),
            Some("demo-password".into()),
        )
        .await
        .unwrap();

        let outcome = ctx
            .checkout
            .start_checkout(CheckoutItem::Plan("pro".into()))
            .await
            .unwrap();

        assert!(outcome.is_simulated());
        assert_eq!(ctx.store.snapshot().tier(), SubscriptionTier::Pro);
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn assume_yes_confirms() {
        assert!(AssumeYes.confirm("Cancel?").await);
    }
}
