//! Backend-as-a-service client for the marketplace.
//!
//! This crate provides:
//! - Typed models for sessions, profiles, subscriptions and app listings
//! - The seams the core talks through: [`AuthApi`], [`RowStore`], [`EdgeFunctions`]
//! - [`SupabaseClient`], the REST implementation (auth, PostgREST, edge functions)
//! - [`InMemoryBaas`], an in-process implementation for tests and offline demos

mod api;
mod error;
pub mod memory;
mod supabase_client;
mod types;

pub use api::{AuthApi, EdgeFunctions, RowStore};
pub use error::{BaasError, BaasResult};
pub use memory::InMemoryBaas;
pub use supabase_client::SupabaseClient;
pub use types::{
    AppListing, AuthChangeEvent, AuthUser, CheckoutMode, CheckoutRequest, CheckoutSession, Profile,
    ProfileUpdate, Role, Session, Subscription, SubscriptionStatus, SubscriptionTier, UserMetadata,
};
