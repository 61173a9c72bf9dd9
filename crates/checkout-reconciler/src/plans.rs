//! Plan list and display descriptors.

use baas_client::{AppListing, SubscriptionTier};
use serde::{Deserialize, Serialize};

/// A purchasable subscription plan. Prices are list constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Provider price identifier.
    pub price_id: String,
    /// Monthly price in USD.
    pub price: f64,
    /// Tier granted while the plan is active.
    pub tier: SubscriptionTier,
}

/// What the return view shows for a purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price: f64,
}

impl ProductDescriptor {
    /// Shown for a one-time purchase whose listing cannot be found.
    pub fn placeholder() -> Self {
        Self {
            name: "App Purchase".to_string(),
            description: None,
            price: 29.99,
        }
    }
}

impl From<&Plan> for ProductDescriptor {
    fn from(plan: &Plan) -> Self {
        Self {
            name: plan.name.clone(),
            description: Some(plan.description.clone()),
            price: plan.price,
        }
    }
}

impl From<AppListing> for ProductDescriptor {
    fn from(app: AppListing) -> Self {
        Self {
            name: app.name,
            description: app.description,
            price: app.price,
        }
    }
}

/// The plans on offer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(vec![
            Plan {
                id: "pro".to_string(),
                name: "Pro".to_string(),
                description: "Unlimited installs, early access and priority support".to_string(),
                price_id: "price_pro".to_string(),
                price: 12.99,
                tier: SubscriptionTier::Pro,
            },
            Plan {
                id: "enterprise".to_string(),
                name: "Enterprise".to_string(),
                description: "Team seats, private listings and a dedicated manager".to_string(),
                price_id: "price_enterprise".to_string(),
                price: 49.99,
                tier: SubscriptionTier::Enterprise,
            },
        ])
    }
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn get(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|plan| plan.id == plan_id)
    }

    pub fn by_price_id(&self, price_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|plan| plan.price_id == price_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_lookups() {
        let catalog = PlanCatalog::default();
        assert_eq!(catalog.plans().len(), 2);
        assert_eq!(catalog.get("pro").unwrap().price_id, "price_pro");
        assert_eq!(
            catalog.by_price_id("price_enterprise").unwrap().tier,
            SubscriptionTier::Enterprise
        );
        assert!(catalog.get("platinum").is_none());
    }

    #[test]
    fn placeholder_descriptor() {
        let placeholder = ProductDescriptor::placeholder();
        assert_eq!(placeholder.name, "App Purchase");
        assert_eq!(placeholder.price, 29.99);
    }

    #[test]
    fn placeholder_omits_missing_description() {
        let json = serde_json::to_value(ProductDescriptor::placeholder()).unwrap();
        assert_eq!(json, serde_json::json!({ "name": "App Purchase", "price": 29.99 }));
    }

    #[test]
    fn descriptor_from_listing() {
        let descriptor = ProductDescriptor::from(AppListing {
            id: "app-1".into(),
            name: "Notes Pro".into(),
            description: None,
            price: 4.99,
        });
        assert_eq!(descriptor.name, "Notes Pro");
        assert_eq!(descriptor.price, 4.99);
    }
}
