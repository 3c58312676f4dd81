//! Gateway backed by a Stripe-style HTTP API
//!
//! ureq is blocking, so every request runs on the blocking pool.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{
    CheckoutGateway, CheckoutSession, CreateCheckoutSession, GatewayResult, Subscription,
    SubscriptionUpdate,
};

pub const DEFAULT_API_BASE: &str = "https://api.stripe.com/v1";

type Form = Vec<(String, String)>;

#[derive(Clone)]
pub struct HttpCheckoutGateway {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
}

impl fmt::Debug for HttpCheckoutGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCheckoutGateway")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl HttpCheckoutGateway {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::config_builder()
                .timeout_global(Some(Duration::from_secs(10)))
                .build()
                .new_agent(),
            api_key: api_key.into(),
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: String) -> GatewayResult<T> {
        let agent = self.agent.clone();
        let url = format!("{}{}", self.base_url, path);
        let auth = format!("Bearer {}", self.api_key);

        let body = tokio::task::spawn_blocking(move || -> GatewayResult<String> {
            let mut response = agent.get(&url).header("Authorization", &auth).call()?;
            Ok(response.body_mut().read_to_string()?)
        })
        .await??;
        Ok(serde_json::from_str(&body)?)
    }

    async fn post<T: DeserializeOwned>(&self, path: String, form: Form) -> GatewayResult<T> {
        let agent = self.agent.clone();
        let url = format!("{}{}", self.base_url, path);
        let auth = format!("Bearer {}", self.api_key);

        let body = tokio::task::spawn_blocking(move || -> GatewayResult<String> {
            let mut response = agent
                .post(&url)
                .header("Authorization", &auth)
                .send_form(form)?;
            Ok(response.body_mut().read_to_string()?)
        })
        .await??;
        Ok(serde_json::from_str(&body)?)
    }
}

fn checkout_form(request: &CreateCheckoutSession) -> Form {
    let mut form = vec![
        ("mode".to_string(), "subscription".to_string()),
        ("line_items[0][price]".to_string(), request.price.clone()),
        (
            "line_items[0][quantity]".to_string(),
            request.quantity.to_string(),
        ),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.clone()));
    }
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
    form
}

fn update_form(update: &SubscriptionUpdate) -> Form {
    let mut form = vec![
        ("items[0][id]".to_string(), update.item_id.clone()),
        ("items[0][quantity]".to_string(), update.quantity.to_string()),
    ];
    if let Some(behavior) = &update.proration_behavior {
        form.push(("proration_behavior".to_string(), behavior.clone()));
    }
    form
}

#[async_trait]
impl CheckoutGateway for HttpCheckoutGateway {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSession,
    ) -> GatewayResult<CheckoutSession> {
        self.post("/checkout/sessions".to_string(), checkout_form(&request))
            .await
    }

    async fn retrieve_checkout_session(&self, id: &str) -> GatewayResult<CheckoutSession> {
        self.get(format!("/checkout/sessions/{}", id)).await
    }

    async fn retrieve_subscription(&self, id: &str) -> GatewayResult<Subscription> {
        self.get(format!("/subscriptions/{}", id)).await
    }

    async fn update_subscription(
        &self,
        id: &str,
        update: SubscriptionUpdate,
    ) -> GatewayResult<()> {
        let _: serde_json::Value = self
            .post(format!("/subscriptions/{}", id), update_form(&update))
            .await?;
        Ok(())
    }
}
