//! Checkout flow and subscription reconciliation.

use crate::error::{CheckoutError, CheckoutResult};
use crate::plans::{Plan, PlanCatalog, ProductDescriptor};
use crate::return_params::ReturnParams;
use async_trait::async_trait;
use baas_client::{
    BaasError, CheckoutMode, CheckoutRequest, EdgeFunctions, RowStore, Subscription,
    SubscriptionStatus, SubscriptionTier,
};
use market_config::{CheckoutFallback, Config, CoreResult, PollConfig};
use serde::Serialize;
use session_sync::poll::{run_or_cancel, sleep_or_cancel, Backoff};
use session_sync::AuthStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Placeholder the provider replaces with the real checkout session id.
const CHECKOUT_SESSION_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";
const SIMULATED_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;

/// Asks the user to confirm a destructive action.
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    /// Returns true only on explicit confirmation.
    async fn confirm(&self, message: &str) -> bool;
}

/// What is being bought.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutItem {
    /// Subscription plan id from the catalog.
    Plan(String),
    /// One-time purchase of an app listing.
    App(String),
}

/// Result of [`CheckoutReconciler::start_checkout`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Send the user to the provider's hosted checkout.
    Redirect {
        url: String,
        session_id: Option<String>,
    },
    /// The provider was unavailable and the purchase was simulated locally.
    Simulated {
        destination: String,
        subscription: Option<Subscription>,
        tier_applied: Option<SubscriptionTier>,
    },
}

impl CheckoutOutcome {
    pub fn is_simulated(&self) -> bool {
        matches!(self, CheckoutOutcome::Simulated { .. })
    }
}

/// Result of [`CheckoutReconciler::reconcile_after_return`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReturnOutcome {
    /// Returned from a real checkout session. `subscription` is `None` when
    /// the provider has not created one yet.
    SubscriptionConfirmed {
        subscription: Option<Subscription>,
        product: Option<ProductDescriptor>,
        tier_applied: Option<SubscriptionTier>,
    },
    /// Returned from a simulated plan checkout.
    SimulatedSubscription {
        subscription: Subscription,
        product: ProductDescriptor,
        tier_applied: Option<SubscriptionTier>,
    },
    /// Returned from a one-time purchase.
    OneTimePurchase { product: ProductDescriptor },
    /// No purchase context.
    PaymentProcessed,
}

/// Result of [`CheckoutReconciler::cancel_subscription`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The user did not confirm; nothing was sent.
    Declined,
    Cancelled {
        tier_applied: Option<SubscriptionTier>,
    },
}

/// The checkout view's read model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckoutState {
    pub loading: bool,
    pub subscription: Option<Subscription>,
    pub product: Option<ProductDescriptor>,
    /// Whether `subscription` was synthesized locally.
    pub simulated: bool,
    pub error: Option<String>,
    #[serde(skip)]
    in_flight: usize,
}

struct LoadingGuard<'a> {
    state: &'a watch::Sender<CheckoutState>,
}

impl<'a> LoadingGuard<'a> {
    fn begin(state: &'a watch::Sender<CheckoutState>) -> Self {
        state.send_modify(|s| {
            s.in_flight += 1;
            s.loading = true;
            s.error = None;
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

/// Settings the reconciler reads from [`Config`].
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Web app origin, without trailing slash.
    pub web_app_url: String,
    pub fallback: CheckoutFallback,
    pub simulated_delay: Duration,
    pub settle: PollConfig,
}

impl CheckoutSettings {
    pub fn from_config(config: &Config) -> CoreResult<Self> {
        let web_app_url = config.web_app_url()?;
        Ok(Self {
            web_app_url: web_app_url.as_str().trim_end_matches('/').to_string(),
            fallback: config.checkout_fallback,
            simulated_delay: config.simulated_checkout_delay(),
            settle: config.webhook_settle.clone(),
        })
    }

    fn success_url(&self) -> String {
        format!(
            "{}/checkout/success?session_id={}",
            self.web_app_url, CHECKOUT_SESSION_PLACEHOLDER
        )
    }

    fn cancel_url(&self) -> String {
        format!("{}/pricing", self.web_app_url)
    }

    fn simulated_destination(&self, item: &CheckoutItem) -> String {
        let (key, value) = match item {
            CheckoutItem::Plan(plan_id) => ("plan", plan_id),
            CheckoutItem::App(app_id) => ("app", app_id),
        };
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(key, value)
            .finish();
        format!("{}/checkout/success?{}", self.web_app_url, query)
    }

    fn admits_fallback(&self, err: &BaasError) -> bool {
        match self.fallback {
            CheckoutFallback::Disabled => false,
            CheckoutFallback::Any => true,
            CheckoutFallback::Connectivity => err.is_connectivity_or_configuration(),
        }
    }
}

/// Checkout/subscription reconciler.
pub struct CheckoutReconciler {
    store: Arc<AuthStore>,
    functions: Arc<dyn EdgeFunctions>,
    rows: Arc<dyn RowStore>,
    catalog: PlanCatalog,
    settings: CheckoutSettings,
    state: watch::Sender<CheckoutState>,
    shutdown: CancellationToken,
}

impl CheckoutReconciler {
    pub fn new(
        store: Arc<AuthStore>,
        functions: Arc<dyn EdgeFunctions>,
        rows: Arc<dyn RowStore>,
        catalog: PlanCatalog,
        settings: CheckoutSettings,
    ) -> Self {
        let (state, _) = watch::channel(CheckoutState::default());
        Self {
            store,
            functions,
            rows,
            catalog,
            settings,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a reconciler over one backend with the default plan list.
    pub fn with_backend<B>(store: Arc<AuthStore>, backend: Arc<B>, settings: CheckoutSettings) -> Self
    where
        B: EdgeFunctions + RowStore + 'static,
    {
        let functions: Arc<dyn EdgeFunctions> = backend.clone();
        let rows: Arc<dyn RowStore> = backend;
        Self::new(store, functions, rows, PlanCatalog::default(), settings)
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> CheckoutState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CheckoutState> {
        self.state.subscribe()
    }

    /// Cancel pending delays and polls.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    fn record_error(&self, message: String) {
        self.state.send_modify(|s| s.error = Some(message));
    }

    /// Record `err` in the view and hand it back for returning.
    fn reject(&self, err: CheckoutError) -> CheckoutError {
        warn!(error = %err, "Checkout request rejected");
        self.record_error(err.to_string());
        err
    }

    fn plan(&self, plan_id: &str) -> CheckoutResult<&Plan> {
        self.catalog
            .get(plan_id)
            .ok_or_else(|| self.reject(CheckoutError::UnknownPlan(plan_id.to_string())))
    }

    /// Load the caller's subscription into the view.
    pub async fn load_subscription(&self) -> CheckoutResult<Option<Subscription>> {
        let _loading = LoadingGuard::begin(&self.state);
        match run_or_cancel(self.rows.fetch_subscription(), &self.shutdown).await? {
            Ok(subscription) => {
                let product = self.describe_subscription(subscription.as_ref());
                self.state.send_modify(|s| {
                    s.subscription = subscription.clone();
                    s.product = product;
                    s.simulated = false;
                });
                Ok(subscription)
            }
            Err(err) => {
                warn!(error = %err, "Failed to load subscription");
                self.record_error(err.user_message());
                Err(CheckoutError::SubscriptionLookup(err))
            }
        }
    }

    /// Begin a purchase.
    ///
    /// A provider failure admitted by the fallback policy turns into a
    /// simulated purchase after the configured delay; anything else is
    /// returned as [`CheckoutError::Provider`].
    pub async fn start_checkout(&self, item: CheckoutItem) -> CheckoutResult<CheckoutOutcome> {
        if self.store.current_user().is_none() {
            return Err(self.reject(CheckoutError::NotAuthenticated));
        }

        let request = match &item {
            CheckoutItem::Plan(plan_id) => CheckoutRequest {
                price_id: Some(self.plan(plan_id)?.price_id.clone()),
                app_id: None,
                mode: CheckoutMode::Subscription,
                success_url: self.settings.success_url(),
                cancel_url: self.settings.cancel_url(),
            },
            CheckoutItem::App(app_id) => CheckoutRequest {
                price_id: None,
                app_id: Some(app_id.clone()),
                mode: CheckoutMode::Payment,
                success_url: self.settings.success_url(),
                cancel_url: self.settings.cancel_url(),
            },
        };

        let _loading = LoadingGuard::begin(&self.state);
        info!(item = ?item, "Starting checkout");

        match run_or_cancel(self.functions.create_checkout_session(&request), &self.shutdown)
            .await?
        {
            Ok(session) => {
                info!(session_id = ?session.session_id, "Checkout session created");
                Ok(CheckoutOutcome::Redirect {
                    url: session.url,
                    session_id: session.session_id,
                })
            }
            Err(err) if self.settings.admits_fallback(&err) => {
                warn!(error = %err, "Checkout provider unavailable, simulating purchase");
                self.simulate_checkout(&item).await
            }
            Err(err) => {
                warn!(error = %err, "Checkout rejected");
                self.record_error(err.user_message());
                Err(CheckoutError::Provider(err))
            }
        }
    }

    async fn simulate_checkout(&self, item: &CheckoutItem) -> CheckoutResult<CheckoutOutcome> {
        sleep_or_cancel(self.settings.simulated_delay, &self.shutdown).await?;
        let destination = self.settings.simulated_destination(item);

        match item {
            CheckoutItem::Plan(plan_id) => {
                let plan = self.plan(plan_id)?.clone();
                let (subscription, tier_applied) = self.apply_simulated_plan(&plan).await;
                Ok(CheckoutOutcome::Simulated {
                    destination,
                    subscription: Some(subscription),
                    tier_applied,
                })
            }
            CheckoutItem::App(app_id) => {
                let product = self.describe_app(app_id).await?;
                self.state.send_modify(|s| s.product = Some(product));
                Ok(CheckoutOutcome::Simulated {
                    destination,
                    subscription: None,
                    tier_applied: None,
                })
            }
        }
    }

    /// Synthesize an active subscription for `plan`, show it, and grant its
    /// tier. A failed tier write is recorded but does not undo the view.
    async fn apply_simulated_plan(&self, plan: &Plan) -> (Subscription, Option<SubscriptionTier>) {
        let subscription = Subscription {
            subscription_id: Some(format!("sim_{}", plan.id)),
            status: SubscriptionStatus::Active,
            price_id: Some(plan.price_id.clone()),
            current_period_end: Some(chrono::Utc::now().timestamp() + SIMULATED_PERIOD_SECS),
            cancel_at_period_end: false,
        };
        self.state.send_modify(|s| {
            s.subscription = Some(subscription.clone());
            s.product = Some(ProductDescriptor::from(plan));
            s.simulated = true;
        });
        info!(plan = %plan.id, "Simulated subscription applied");

        let tier_applied = self.grant_tier(plan.tier).await;
        (subscription, tier_applied)
    }

    async fn grant_tier(&self, tier: SubscriptionTier) -> Option<SubscriptionTier> {
        match self.store.apply_subscription_tier(tier).await {
            Ok(()) => Some(tier),
            Err(err) => {
                warn!(tier = %tier, error = %err, "Failed to apply subscription tier");
                self.record_error(err.to_string());
                None
            }
        }
    }

    fn describe_subscription(&self, subscription: Option<&Subscription>) -> Option<ProductDescriptor> {
        subscription
            .and_then(|sub| sub.price_id.as_deref())
            .and_then(|price_id| self.catalog.by_price_id(price_id))
            .map(ProductDescriptor::from)
    }

    /// Display metadata for an app; the placeholder when it cannot be found.
    async fn describe_app(&self, app_id: &str) -> CheckoutResult<ProductDescriptor> {
        match run_or_cancel(self.rows.fetch_app(app_id), &self.shutdown).await? {
            Ok(Some(app)) => Ok(ProductDescriptor::from(app)),
            Ok(None) => {
                debug!(app_id = %app_id, "App listing not found, using placeholder");
                Ok(ProductDescriptor::placeholder())
            }
            Err(err) => {
                warn!(app_id = %app_id, error = %err, "App lookup failed, using placeholder");
                Ok(ProductDescriptor::placeholder())
            }
        }
    }

    /// Reconcile after the provider redirects back.
    ///
    /// Context is taken from the first present of `session_id`, `plan_id`
    /// and `app_id`.
    pub async fn reconcile_after_return(&self, params: ReturnParams) -> CheckoutResult<ReturnOutcome> {
        let _loading = LoadingGuard::begin(&self.state);

        if let Some(session_id) = params.session_id.as_deref() {
            return self.confirm_session(session_id).await;
        }

        if let Some(plan_id) = params.plan_id.as_deref() {
            let plan = self.plan(plan_id)?.clone();
            let (subscription, tier_applied) = self.apply_simulated_plan(&plan).await;
            return Ok(ReturnOutcome::SimulatedSubscription {
                subscription,
                product: ProductDescriptor::from(&plan),
                tier_applied,
            });
        }

        if let Some(app_id) = params.app_id.as_deref() {
            let product = self.describe_app(app_id).await?;
            self.state.send_modify(|s| s.product = Some(product.clone()));
            return Ok(ReturnOutcome::OneTimePurchase { product });
        }

        debug!("Return without purchase context");
        Ok(ReturnOutcome::PaymentProcessed)
    }

    /// Poll the subscription view until the webhook has settled it.
    async fn confirm_session(&self, session_id: &str) -> CheckoutResult<ReturnOutcome> {
        info!(session_id = %session_id, "Confirming checkout session");
        let mut backoff = Backoff::new(&self.settings.settle);

        let subscription = loop {
            let latest = match run_or_cancel(self.rows.fetch_subscription(), &self.shutdown).await? {
                Ok(latest) => latest,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "Transient subscription lookup failure");
                    if backoff.wait(&self.shutdown).await? {
                        continue;
                    }
                    self.record_error(err.user_message());
                    return Err(CheckoutError::SubscriptionLookup(err));
                }
                Err(err) => {
                    warn!(error = %err, "Subscription lookup failed");
                    self.record_error(err.user_message());
                    return Err(CheckoutError::SubscriptionLookup(err));
                }
            };
            let settled = latest.as_ref().is_some_and(|sub| sub.status.is_settled());
            if settled || !backoff.wait(&self.shutdown).await? {
                break latest;
            }
        };

        let plan = subscription
            .as_ref()
            .and_then(|sub| sub.price_id.as_deref())
            .and_then(|price_id| self.catalog.by_price_id(price_id))
            .cloned();
        let product = plan.as_ref().map(ProductDescriptor::from);

        self.state.send_modify(|s| {
            s.subscription = subscription.clone();
            s.product = product.clone();
            s.simulated = false;
        });

        let grants_access = subscription
            .as_ref()
            .is_some_and(|sub| sub.status.grants_access());
        let tier_applied = match plan {
            Some(plan) if grants_access && self.current_tier() != Some(plan.tier) => {
                self.grant_tier(plan.tier).await
            }
            _ => None,
        };

        match &subscription {
            Some(sub) => info!(status = ?sub.status, price_id = ?sub.price_id, "Subscription reconciled"),
            None => info!("No subscription recorded yet"),
        }

        Ok(ReturnOutcome::SubscriptionConfirmed {
            subscription,
            product,
            tier_applied,
        })
    }

    fn current_tier(&self) -> Option<SubscriptionTier> {
        self.store
            .snapshot()
            .profile
            .map(|profile| profile.subscription_tier)
    }

    /// Cancel a subscription after explicit confirmation.
    ///
    /// Local state changes only once the provider confirms.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        prompt: &dyn ConfirmationPrompt,
    ) -> CheckoutResult<CancelOutcome> {
        if self.store.current_user().is_none() {
            return Err(self.reject(CheckoutError::NotAuthenticated));
        }

        let message = "Cancel your subscription? You will lose access to paid features.";
        if !prompt.confirm(message).await {
            debug!(subscription_id = %subscription_id, "Cancellation declined");
            return Ok(CancelOutcome::Declined);
        }

        let _loading = LoadingGuard::begin(&self.state);
        info!(subscription_id = %subscription_id, "Cancelling subscription");

        if let Err(err) =
            run_or_cancel(self.functions.cancel_subscription(subscription_id), &self.shutdown)
                .await?
        {
            warn!(subscription_id = %subscription_id, error = %err, "Cancellation failed");
            self.record_error(err.user_message());
            return Err(CheckoutError::CancellationFailure(err));
        }

        let tier_applied = self.grant_tier(SubscriptionTier::Free).await;
        self.state.send_modify(|s| {
            s.subscription = None;
            s.product = None;
            s.simulated = false;
        });
        info!(subscription_id = %subscription_id, "Subscription cancelled");
        Ok(CancelOutcome::Cancelled { tier_applied })
    }
}
