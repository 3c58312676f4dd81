//! Canned gateway responses

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{
    CheckoutGateway, CheckoutSession, CreateCheckoutSession, GatewayResult, ItemList,
    Subscription, SubscriptionItem, SubscriptionUpdate,
};

pub const STUB_CHECKOUT_SESSION_ID: &str = "cs_test_fixture";
pub const STUB_CHECKOUT_URL: &str = "https://checkout.example.test/c/pay/cs_test_fixture";
pub const STUB_SUBSCRIPTION_ID: &str = "sub_test_fixture";
pub const STUB_SUBSCRIPTION_ITEM_ID: &str = "si_test_fixture";

/// Gateway that answers every call with the same fixed value
///
/// Holds no state between calls. Completed checkout sessions carry the
/// organization and creator names the test wants the application to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubCheckoutGateway {
    pub organization_name: String,
    pub creator_name: String,
}

impl Default for StubCheckoutGateway {
    fn default() -> Self {
        Self::new("Fixture Org", "alice")
    }
}

impl StubCheckoutGateway {
    pub fn new(organization_name: impl Into<String>, creator_name: impl Into<String>) -> Self {
        Self {
            organization_name: organization_name.into(),
            creator_name: creator_name.into(),
        }
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "organization_name".to_string(),
                self.organization_name.clone(),
            ),
            ("creator_name".to_string(), self.creator_name.clone()),
        ])
    }
}

#[async_trait]
impl CheckoutGateway for StubCheckoutGateway {
    async fn create_checkout_session(
        &self,
        _request: CreateCheckoutSession,
    ) -> GatewayResult<CheckoutSession> {
        Ok(CheckoutSession {
            id: STUB_CHECKOUT_SESSION_ID.to_string(),
            url: Some(STUB_CHECKOUT_URL.to_string()),
            status: Some("open".to_string()),
            subscription: None,
            metadata: BTreeMap::new(),
        })
    }

    async fn retrieve_checkout_session(&self, _id: &str) -> GatewayResult<CheckoutSession> {
        Ok(CheckoutSession {
            id: STUB_CHECKOUT_SESSION_ID.to_string(),
            url: None,
            status: Some("complete".to_string()),
            subscription: Some(STUB_SUBSCRIPTION_ID.to_string()),
            metadata: self.metadata(),
        })
    }

    async fn retrieve_subscription(&self, _id: &str) -> GatewayResult<Subscription> {
        Ok(Subscription {
            id: STUB_SUBSCRIPTION_ID.to_string(),
            items: ItemList {
                data: vec![SubscriptionItem {
                    id: STUB_SUBSCRIPTION_ITEM_ID.to_string(),
                    quantity: 1,
                }],
            },
        })
    }

    async fn update_subscription(
        &self,
        _id: &str,
        _update: SubscriptionUpdate,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_ignores_request() {
        let gateway = StubCheckoutGateway::default();
        let a = gateway
            .create_checkout_session(CreateCheckoutSession::default())
            .await
            .unwrap();
        let b = gateway
            .create_checkout_session(CreateCheckoutSession {
                price: "price_other".to_string(),
                quantity: 12,
                customer_email: Some("x@example.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id, STUB_CHECKOUT_SESSION_ID);
        assert_eq!(a.url.as_deref(), Some(STUB_CHECKOUT_URL));
    }

    #[tokio::test]
    async fn test_retrieve_session_echoes_names() {
        let gateway = StubCheckoutGateway::new("Acme", "bob");
        let session = gateway.retrieve_checkout_session("cs_anything").await.unwrap();
        assert_eq!(session.status.as_deref(), Some("complete"));
        assert_eq!(session.subscription.as_deref(), Some(STUB_SUBSCRIPTION_ID));
        assert_eq!(session.metadata["organization_name"], "Acme");
        assert_eq!(session.metadata["creator_name"], "bob");
    }

    #[tokio::test]
    async fn test_subscription_has_one_item() {
        let gateway = StubCheckoutGateway::default();
        let subscription = gateway.retrieve_subscription("sub_x").await.unwrap();
        assert_eq!(
            subscription.items.data,
            vec![SubscriptionItem {
                id: STUB_SUBSCRIPTION_ITEM_ID.to_string(),
                quantity: 1
            }]
        );

        gateway
            .update_subscription(
                "sub_x",
                SubscriptionUpdate {
                    item_id: STUB_SUBSCRIPTION_ITEM_ID.to_string(),
                    quantity: 5,
                    proration_behavior: None,
                },
            )
            .await
            .unwrap();
    }
}
