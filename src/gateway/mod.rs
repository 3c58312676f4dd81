//! Payment-gateway capability
//!
//! The application under test drives checkout and subscription flows through
//! [`CheckoutGateway`]. Two implementations exist and one is chosen when the
//! fixture is built: [`StubCheckoutGateway`] returns canned values without any
//! network traffic, [`HttpCheckoutGateway`] talks to a real Stripe-style API.

mod http;
mod stub;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpCheckoutGateway, DEFAULT_API_BASE};
pub use stub::{
    StubCheckoutGateway, STUB_CHECKOUT_SESSION_ID, STUB_CHECKOUT_URL, STUB_SUBSCRIPTION_ID,
    STUB_SUBSCRIPTION_ITEM_ID,
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] ureq::Error),
    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Gateway task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Parameters for a new subscription checkout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateCheckoutSession {
    pub price: String,
    pub quantity: u64,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub status: Option<String>,
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub items: ItemList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub quantity: u64,
}

/// Change of seat count on one subscription item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub item_id: String,
    pub quantity: u64,
    pub proration_behavior: Option<String>,
}

/// Checkout and subscription operations the application relies on
#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSession,
    ) -> GatewayResult<CheckoutSession>;

    async fn retrieve_checkout_session(&self, id: &str) -> GatewayResult<CheckoutSession>;

    async fn retrieve_subscription(&self, id: &str) -> GatewayResult<Subscription>;

    async fn update_subscription(&self, id: &str, update: SubscriptionUpdate)
        -> GatewayResult<()>;
}
