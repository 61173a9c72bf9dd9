//! Checkout and subscription reconciliation for the marketplace client.
//!
//! [`CheckoutReconciler`] starts checkouts through the payment edge function,
//! degrades to a clearly marked simulated purchase when the provider cannot
//! be reached, and reconciles the local subscription tier once the user
//! returns from the provider.

mod error;
mod plans;
mod reconciler;
mod return_params;

pub use error::{CheckoutError, CheckoutResult};
pub use plans::{Plan, PlanCatalog, ProductDescriptor};
pub use reconciler::{
    CancelOutcome, CheckoutItem, CheckoutOutcome, CheckoutReconciler, CheckoutSettings,
    CheckoutState, ConfirmationPrompt, ReturnOutcome,
};
pub use return_params::ReturnParams;
