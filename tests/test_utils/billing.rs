//! Small billing application used as the application under test
//!
//! It only knows its wiring: a connection string, a checkout gateway and the
//! cookie secret. Completing a checkout creates an organization row.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use pgharness::gateway::{CheckoutGateway, CreateCheckoutSession};
use pgharness::{AppRequest, AppResponse, AppWiring, CookieSecret, RequestDispatch};
use tokio_postgres::NoTls;

pub struct BillingApp {
    connection_string: String,
    gateway: Arc<dyn CheckoutGateway>,
    cookie_secret: CookieSecret,
}

impl BillingApp {
    pub fn from_wiring(wiring: AppWiring) -> Result<Self, Infallible> {
        Ok(Self {
            connection_string: wiring.connection_string,
            gateway: wiring.gateway,
            cookie_secret: wiring.cookie_secret,
        })
    }

    fn session_user(&self, request: &AppRequest) -> Option<String> {
        let cookie = request.header_value("cookie")?;
        let value = cookie.strip_prefix("session=")?;
        let (user, signature) = value.split_once(':')?;
        (signature == signature_for(user, &self.cookie_secret)).then(|| user.to_string())
    }

    async fn checkout(&self, user: &str, organization: &str) -> Result<AppResponse, String> {
        let session = self
            .gateway
            .create_checkout_session(CreateCheckoutSession {
                price: "price_seat".to_string(),
                quantity: 1,
                success_url: "https://app.test/billing/return".to_string(),
                cancel_url: "https://app.test/billing".to_string(),
                customer_email: None,
                metadata: BTreeMap::from([
                    ("organization_name".to_string(), organization.to_string()),
                    ("creator_name".to_string(), user.to_string()),
                ]),
            })
            .await
            .map_err(|e| e.to_string())?;

        let url = session.url.ok_or("checkout session has no url")?;
        Ok(AppResponse::new(303).header("Location", url))
    }

    async fn complete(&self, session_id: &str) -> Result<AppResponse, String> {
        let session = self
            .gateway
            .retrieve_checkout_session(session_id)
            .await
            .map_err(|e| e.to_string())?;
        if session.status.as_deref() != Some("complete") {
            return Ok(AppResponse::new(402));
        }

        let organization = session
            .metadata
            .get("organization_name")
            .ok_or("missing organization_name")?;
        let creator = session
            .metadata
            .get("creator_name")
            .ok_or("missing creator_name")?;
        let subscription_id = session.subscription.ok_or("missing subscription")?;
        let subscription = self
            .gateway
            .retrieve_subscription(&subscription_id)
            .await
            .map_err(|e| e.to_string())?;
        let seats = subscription
            .items
            .data
            .first()
            .map_or(Ok(1), |item| i64::try_from(item.quantity))
            .map_err(|e| e.to_string())?;

        let (client, connection) = tokio_postgres::connect(&self.connection_string, NoTls)
            .await
            .map_err(|e| e.to_string())?;
        let guard = tokio::spawn(async move {
            let _ = connection.await;
        });
        let inserted = client
            .execute(
                "INSERT INTO organizations (name, creator_id, subscription_id, seats) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                &[
                    &organization.as_str(),
                    &creator.as_str(),
                    &subscription_id.as_str(),
                    &seats,
                ],
            )
            .await
            .map_err(|e| e.to_string());
        drop(client);
        let _ = guard.await;
        inserted?;

        Ok(AppResponse::new(303).header("Location", format!("/orgs/{}", organization)))
    }
}

#[async_trait]
impl RequestDispatch for BillingApp {
    async fn dispatch(&self, request: AppRequest) -> AppResponse {
        let Some(user) = self.session_user(&request) else {
            return AppResponse::new(401);
        };

        let result = match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/billing/checkout") => {
                let organization = String::from_utf8_lossy(&request.body).into_owned();
                self.checkout(&user, &organization).await
            }
            ("GET", path) => match path.strip_prefix("/billing/return?session_id=") {
                Some(session_id) => self.complete(session_id).await,
                None => Ok(AppResponse::new(404)),
            },
            _ => Ok(AppResponse::new(404)),
        };

        result.unwrap_or_else(|message| {
            tracing::warn!(%message, "Request failed");
            AppResponse::new(500)
        })
    }
}

fn signature_for(user: &str, secret: &CookieSecret) -> String {
    let key = secret.expose();
    format!("{}{}", &key[..key.len().min(8)], user.len())
}

/// Cookie header value for `user`, signed with the session's secret
pub fn session_cookie(user: &str, secret: &CookieSecret) -> String {
    format!("session={}:{}", user, signature_for(user, secret))
}
