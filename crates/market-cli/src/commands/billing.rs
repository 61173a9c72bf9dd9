//! Plans, checkout, return reconciliation and cancellation.

use super::{AssumeYes, Context, StdinPrompt};
use crate::output::{self, heading, row};
use anyhow::{bail, Result};
use baas_client::{Subscription, SubscriptionTier};
use checkout_reconciler::{
    CancelOutcome, CheckoutItem, CheckoutOutcome, ConfirmationPrompt, Plan, ProductDescriptor,
    ReturnOutcome, ReturnParams,
};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize)]
struct PlansView {
    current_tier: SubscriptionTier,
    plans: Vec<Plan>,
}

impl fmt::Display for PlansView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", heading("Plans"))?;
        for plan in &self.plans {
            let marker = if plan.tier == self.current_tier { " (current)" } else { "" };
            write!(
                f,
                "\n  {:<12} ${:>6.2}/mo  {}{}",
                plan.id, plan.price, plan.description, marker
            )?;
        }
        Ok(())
    }
}

/// List the plans on offer.
pub async fn plans(ctx: &Context) -> Result<()> {
    let view = PlansView {
        current_tier: ctx.store.snapshot().tier(),
        plans: ctx.checkout.catalog().plans().to_vec(),
    };
    output::print(&view, ctx.format);
    Ok(())
}

fn subscription_lines(f: &mut fmt::Formatter<'_>, subscription: &Subscription) -> fmt::Result {
    write!(f, "\n{}", row("Status", &format!("{:?}", subscription.status)))?;
    if let Some(id) = &subscription.subscription_id {
        write!(f, "\n{}", row("Subscription", id))?;
    }
    if let Some(end) = subscription
        .current_period_end
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    {
        let label = if subscription.cancel_at_period_end { "Ends" } else { "Renews" };
        write!(f, "\n{}", row(label, &end.format("%Y-%m-%d").to_string()))?;
    }
    Ok(())
}

fn product_line(f: &mut fmt::Formatter<'_>, product: &ProductDescriptor) -> fmt::Result {
    write!(f, "\n{}", row("Product", &format!("{} (${:.2})", product.name, product.price)))
}

fn tier_line(f: &mut fmt::Formatter<'_>, tier: Option<SubscriptionTier>) -> fmt::Result {
    match tier {
        Some(tier) => write!(f, "\n{}", row("Tier", tier.as_str())),
        None => Ok(()),
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct CheckoutView(CheckoutOutcome);

impl fmt::Display for CheckoutView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            CheckoutOutcome::Redirect { url, .. } => {
                write!(f, "Open this link to complete checkout:\n  {}", url)
            }
            CheckoutOutcome::Simulated {
                destination,
                subscription,
                tier_applied,
            } => {
                write!(f, "Payment provider unavailable, purchase simulated.")?;
                write!(f, "\n{}", row("Return URL", destination))?;
                if let Some(subscription) = subscription {
                    subscription_lines(f, subscription)?;
                }
                tier_line(f, *tier_applied)
            }
        }
    }
}

/// Start a checkout for a plan or an app.
pub async fn checkout(ctx: &Context, plan: Option<String>, app: Option<String>) -> Result<()> {
    let item = match (plan, app) {
        (Some(plan), None) => CheckoutItem::Plan(plan),
        (None, Some(app)) => CheckoutItem::App(app),
        _ => bail!("Pass a plan id or --app <id>"),
    };
    let outcome = ctx.checkout.start_checkout(item).await?;
    output::print(&CheckoutView(outcome), ctx.format);
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ReturnView(ReturnOutcome);

impl fmt::Display for ReturnView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ReturnOutcome::SubscriptionConfirmed {
                subscription,
                product,
                tier_applied,
            } => {
                write!(f, "Subscription confirmed.")?;
                match subscription {
                    Some(subscription) => subscription_lines(f, subscription)?,
                    None => write!(f, "\n  The payment is still being processed.")?,
                }
                if let Some(product) = product {
                    product_line(f, product)?;
                }
                tier_line(f, *tier_applied)
            }
            ReturnOutcome::SimulatedSubscription {
                subscription,
                product,
                tier_applied,
            } => {
                write!(f, "Subscription activated (simulated).")?;
                product_line(f, product)?;
                subscription_lines(f, subscription)?;
                tier_line(f, *tier_applied)
            }
            ReturnOutcome::OneTimePurchase { product } => {
                write!(f, "Purchase complete.")?;
                product_line(f, product)
            }
            ReturnOutcome::PaymentProcessed => write!(f, "Payment processed."),
        }
    }
}

/// Reconcile after the provider redirected back to `url`.
pub async fn reconcile_return(ctx: &Context, url: &str) -> Result<()> {
    let params = ReturnParams::parse(url);
    let outcome = ctx.checkout.reconcile_after_return(params).await?;
    output::print(&ReturnView(outcome), ctx.format);
    Ok(())
}

#[derive(Debug, Serialize)]
struct SubscriptionView {
    subscription: Option<Subscription>,
    product: Option<ProductDescriptor>,
}

impl fmt::Display for SubscriptionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", heading("Subscription"))?;
        match &self.subscription {
            Some(subscription) => subscription_lines(f, subscription)?,
            None => write!(f, "\n  No subscription")?,
        }
        match &self.product {
            Some(product) => product_line(f, product),
            None => Ok(()),
        }
    }
}

/// Show the subscription recorded by the backend.
pub async fn subscription(ctx: &Context) -> Result<()> {
    if ctx.store.current_user().is_none() {
        bail!("Sign in to continue");
    }
    ctx.checkout.load_subscription().await?;
    let state = ctx.checkout.snapshot();
    let view = SubscriptionView {
        subscription: state.subscription,
        product: state.product,
    };
    output::print(&view, ctx.format);
    Ok(())
}

/// Cancel a subscription, asking first unless `yes` is set.
pub async fn cancel(ctx: &Context, subscription_id: &str, yes: bool) -> Result<()> {
    let prompt: &dyn ConfirmationPrompt = if yes { &AssumeYes } else { &StdinPrompt };
    match ctx.checkout.cancel_subscription(subscription_id, prompt).await? {
        CancelOutcome::Declined => output::print_success("Cancellation aborted", ctx.format),
        CancelOutcome::Cancelled { tier_applied } => {
            let tier = tier_applied.unwrap_or(ctx.store.snapshot().tier());
            output::print_success(
                &format!("Subscription cancelled. Current tier: {}", tier),
                ctx.format,
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use baas_client::SubscriptionStatus;
    use checkout_reconciler::PlanCatalog;

    #[test]
    fn plans_view_marks_current_tier() {
        let view = PlansView {
            current_tier: SubscriptionTier::Pro,
            plans: PlanCatalog::default().plans().to_vec(),
        };
        let text = view.to_string();
        let pro = text.lines().find(|line| line.contains("pro ")).unwrap();
        assert!(pro.contains("(current)"));
        assert!(!text.lines().any(|line| line.contains("enterprise") && line.contains("(current)")));
    }

    #[test]
    fn return_view_for_pending_payment() {
        let view = ReturnView(ReturnOutcome::SubscriptionConfirmed {
            subscription: None,
            product: None,
            tier_applied: None,
        });
        assert!(view.to_string().contains("still being processed"));
    }

    #[test]
    fn checkout_view_json_is_tagged() {
        let view = CheckoutView(CheckoutOutcome::Simulated {
            destination: "https://appmarket.dev/checkout/success?plan=pro".into(),
            subscription: Some(Subscription {
                subscription_id: Some("sim_pro".into()),
                status: SubscriptionStatus::Active,
                price_id: Some("price_pro".into()),
                current_period_end: None,
                cancel_at_period_end: false,
            }),
            tier_applied: Some(SubscriptionTier::Pro),
        });
        let json: serde_json::Value = serde_json::to_value(&view).unwrap();
        assert_eq!(json["kind"], "simulated");
        assert_eq!(json["tier_applied"], "pro");
        assert!(view.to_string().contains("simulated"));
    }
}
