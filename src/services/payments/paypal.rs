use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use metrics::counter;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::PayPalConfig,
    entities::{PaymentMethodKind, PaymentProvider, PaymentStatus, RefundStatus},
    errors::ServiceError,
};

use super::{
    gateway::{
        ConfirmRequest, CreateIntentRequest, EventTarget, PaymentGateway, PaymentUpdate,
        ProviderEvent, ProviderIntent, ProviderRefund, ProviderRefundRequest, RefundUpdate,
    },
    token_cache::TokenCache,
};

type HmacSha256 = Hmac<Sha256>;

pub const TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
pub const TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";
pub const TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";

fn transmission_mac(
    secret: &str,
    transmission_id: &str,
    transmission_time: &str,
    body: &[u8],
) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{}|{}|", transmission_id, transmission_time).as_bytes());
    mac.update(body);
    Some(mac)
}

/// Base64 transmission signature for a webhook delivery.
pub fn sign_paypal_payload(
    secret: &str,
    transmission_id: &str,
    transmission_time: &str,
    body: &[u8],
) -> String {
    transmission_mac(secret, transmission_id, transmission_time, body)
        .map(|mac| BASE64.encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

fn reject(reason: &str) -> ServiceError {
    warn!(provider = "paypal", reason, "webhook signature rejected");
    ServiceError::InvalidSignature
}

/// Redirect-style provider: the payer approves on PayPal, then the order is
/// captured server-side. Saved payment methods are not offered.
#[derive(Clone)]
pub struct PayPalGateway {
    client: Client,
    config: PayPalConfig,
    tokens: Arc<TokenCache>,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorBody {
    name: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
    #[serde(default)]
    purchase_units: Vec<PayPalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PayPalPurchaseUnit {
    payments: Option<PayPalPayments>,
}

#[derive(Debug, Deserialize)]
struct PayPalPayments {
    #[serde(default)]
    captures: Vec<PayPalCapture>,
}

#[derive(Debug, Deserialize)]
struct PayPalCapture {
    id: String,
    status: String,
    status_details: Option<PayPalStatusDetails>,
}

#[derive(Debug, Deserialize)]
struct PayPalStatusDetails {
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayPalRefund {
    id: String,
    status: String,
    status_details: Option<PayPalStatusDetails>,
}

#[derive(Debug, Deserialize)]
struct PayPalEvent {
    id: String,
    event_type: String,
    resource: serde_json::Value,
}

impl PayPalOrder {
    fn approval_link(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }

    fn first_capture(&self) -> Option<&PayPalCapture> {
        self.purchase_units
            .iter()
            .filter_map(|u| u.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .next()
    }
}

impl PayPalGateway {
    pub fn new(client: Client, config: PayPalConfig) -> Self {
        Self {
            client,
            config,
            tokens: Arc::new(TokenCache::default()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ServiceError> {
        self.tokens
            .get_or_refresh(|| async {
                let token: AccessToken = self
                    .execute(
                        self.client
                            .post(self.url("/v1/oauth2/token"))
                            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                            .form(&[("grant_type", "client_credentials")]),
                        "oauth_token",
                    )
                    .await?;
                debug!(expires_in = token.expires_in, "PayPal access token issued");
                Ok((token.access_token, Duration::from_secs(token.expires_in)))
            })
            .await
    }

    /// Sends an authenticated request built by `build`. A 401 drops the
    /// cached token so the next call fetches a fresh one.
    async fn send<T, F>(&self, build: F, operation: &'static str) -> Result<T, ServiceError>
    where
        T: DeserializeOwned,
        F: FnOnce(&Client) -> RequestBuilder,
    {
        let result = match self.access_token().await {
            Ok(token) => {
                self.execute(build(&self.client).bearer_auth(token), operation)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(ServiceError::AuthError(_)) = &result {
            self.tokens.invalidate().await;
        }
        result.map_err(|e| match e {
            ServiceError::AuthError(message) => ServiceError::ProviderError(message),
            other => other,
        })
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T, ServiceError> {
        let response = request.send().await.map_err(|e| {
            counter!("orderline.provider.calls", 1, "provider" => "paypal", "operation" => operation, "result" => "unreachable");
            warn!(operation, error = %e, "PayPal request failed");
            ServiceError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            counter!("orderline.provider.calls", 1, "provider" => "paypal", "operation" => operation, "result" => "error");
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<PayPalErrorBody>(&body)
                .ok()
                .and_then(|b| b.message.or(b.name))
                .unwrap_or_else(|| format!("HTTP {}", status));
            warn!(operation, %status, %message, "PayPal API error");
            if status == StatusCode::UNAUTHORIZED {
                return Err(ServiceError::AuthError(format!("PayPal: {}", message)));
            }
            return Err(ServiceError::ProviderError(format!("PayPal: {}", message)));
        }

        counter!("orderline.provider.calls", 1, "provider" => "paypal", "operation" => operation, "result" => "ok");
        response.json::<T>().await.map_err(|e| {
            ServiceError::ProviderError(format!("Failed to parse PayPal response: {}", e))
        })
    }

    fn resource_str(resource: &serde_json::Value, pointer: &str) -> Option<String> {
        resource
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::PayPal
    }

    fn refunds_need_capture_id(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ServiceError> {
        let mut context = json!({ "user_action": "PAY_NOW" });
        if let Some(return_url) = &self.config.return_url {
            context["return_url"] = json!(return_url);
        }
        if let Some(cancel_url) = &self.config.cancel_url {
            context["cancel_url"] = json!(cancel_url);
        }
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": request.order_id.to_string(),
                "custom_id": request.customer_id.to_string(),
                "amount": {
                    "currency_code": request.currency.to_ascii_uppercase(),
                    "value": request.amount.round_dp(2).to_string(),
                },
            }],
            "application_context": context,
        });

        let order: PayPalOrder = self
            .send(
                |client| client.post(self.url("/v2/checkout/orders")).json(&body),
                "create_order",
            )
            .await?;

        let status = self.map_status(&order.status);
        let approval_link = order.approval_link();
        info!(external_id = %order.id, %status, "PayPal order created");
        Ok(ProviderIntent {
            next_action: approval_link.as_ref().map(|_| "redirect_to_approval".to_string()),
            client_token: approval_link,
            external_id: order.id,
            status,
            method_kind: PaymentMethodKind::PayPalWallet,
        })
    }

    /// Captures an approved order. The capture's own status wins over the
    /// order status when both are present.
    #[instrument(skip(self, _request))]
    async fn confirm(
        &self,
        external_id: &str,
        _request: &ConfirmRequest,
    ) -> Result<PaymentUpdate, ServiceError> {
        let url = self.url(&format!("/v2/checkout/orders/{}/capture", external_id));
        let order: PayPalOrder = self
            .send(
                |client| {
                    client
                        .post(url)
                        .header("PayPal-Request-Id", format!("capture-{}", external_id))
                        .json(&json!({}))
                },
                "capture",
            )
            .await?;

        let capture = order.first_capture();
        let status = match capture {
            Some(capture) => self.map_status(&capture.status),
            None => self.map_status(&order.status),
        };
        Ok(PaymentUpdate {
            external_id: order.id.clone(),
            status,
            capture_id: capture.map(|c| c.id.clone()),
            failure_reason: capture
                .and_then(|c| c.status_details.as_ref())
                .and_then(|d| d.reason.clone())
                .filter(|_| status == PaymentStatus::Failed),
        })
    }

    #[instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefund, ServiceError> {
        let capture_id = request.capture_id.as_deref().ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "PayPal order {} has no recorded capture to refund",
                request.payment_external_id
            ))
        })?;

        let mut body = json!({
            "amount": {
                "value": request.amount.round_dp(2).to_string(),
                "currency_code": request.currency.to_ascii_uppercase(),
            },
            "invoice_id": request.refund_id.to_string(),
        });
        if let Some(note) = &request.note {
            body["note_to_payer"] = json!(note);
        }

        let url = self.url(&format!("/v2/payments/captures/{}/refund", capture_id));
        let refund: PayPalRefund = self
            .send(
                |client| {
                    client
                        .post(url)
                        .header("PayPal-Request-Id", request.refund_id.to_string())
                        .json(&body)
                },
                "create_refund",
            )
            .await?;

        Ok(ProviderRefund {
            status: self.map_refund_status(&refund.status),
            external_id: refund.id,
            failure_reason: refund.status_details.and_then(|d| d.reason),
        })
    }

    fn map_status(&self, raw: &str) -> PaymentStatus {
        match raw {
            "CREATED" | "SAVED" => PaymentStatus::Pending,
            "PAYER_ACTION_REQUIRED" => PaymentStatus::RequiresAction,
            "APPROVED" => PaymentStatus::RequiresCapture,
            "PENDING" => PaymentStatus::Processing,
            "COMPLETED" => PaymentStatus::Succeeded,
            "VOIDED" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Failed,
        }
    }

    fn map_refund_status(&self, raw: &str) -> RefundStatus {
        match raw {
            "PENDING" => RefundStatus::Pending,
            "COMPLETED" => RefundStatus::Succeeded,
            "CANCELLED" => RefundStatus::Cancelled,
            _ => RefundStatus::Failed,
        }
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let transmission_id =
            header(TRANSMISSION_ID_HEADER).ok_or_else(|| reject("missing transmission id"))?;
        let transmission_time =
            header(TRANSMISSION_TIME_HEADER).ok_or_else(|| reject("missing transmission time"))?;
        let signature =
            header(TRANSMISSION_SIG_HEADER).ok_or_else(|| reject("missing transmission signature"))?;

        let sent_at = chrono::DateTime::parse_from_rfc3339(transmission_time)
            .map_err(|_| reject("malformed transmission time"))?;
        let age = chrono::Utc::now().signed_duration_since(sent_at);
        if age.num_seconds().abs() > self.config.webhook_tolerance_secs {
            return Err(reject("transmission time outside tolerance"));
        }

        let signature = BASE64
            .decode(signature)
            .map_err(|_| reject("signature is not base64"))?;
        let mac = transmission_mac(
            &self.config.webhook_secret,
            transmission_id,
            transmission_time,
            body,
        )
        .ok_or_else(|| reject("unusable webhook secret"))?;
        mac.verify_slice(&signature)
            .map_err(|_| reject("signature mismatch"))
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, ServiceError> {
        let event: PayPalEvent = serde_json::from_slice(body).map_err(|e| {
            ServiceError::ValidationError(format!("Malformed PayPal event: {}", e))
        })?;
        let resource = &event.resource;
        let resource_id = || {
            Self::resource_str(resource, "/id").ok_or_else(|| {
                ServiceError::ValidationError("PayPal event resource has no id".to_string())
            })
        };
        let resource_status = Self::resource_str(resource, "/status").unwrap_or_default();

        let target = match event.event_type.as_str() {
            // Resource is a capture; the local payment is keyed by its order.
            "PAYMENT.CAPTURE.COMPLETED"
            | "PAYMENT.CAPTURE.PENDING"
            | "PAYMENT.CAPTURE.DENIED"
            | "PAYMENT.CAPTURE.DECLINED" => {
                let capture_id = resource_id()?;
                let order_id =
                    Self::resource_str(resource, "/supplementary_data/related_ids/order_id")
                        .ok_or_else(|| {
                            ServiceError::ValidationError(
                                "PayPal capture event has no related order id".to_string(),
                            )
                        })?;
                let status = self.map_status(&resource_status);
                Some(EventTarget::Payment(PaymentUpdate {
                    external_id: order_id,
                    status,
                    capture_id: Some(capture_id),
                    failure_reason: Self::resource_str(resource, "/status_details/reason")
                        .filter(|_| status == PaymentStatus::Failed),
                }))
            }
            "CHECKOUT.ORDER.APPROVED" | "CHECKOUT.ORDER.VOIDED" | "CHECKOUT.ORDER.COMPLETED" => {
                Some(EventTarget::Payment(PaymentUpdate {
                    external_id: resource_id()?,
                    status: self.map_status(&resource_status),
                    capture_id: Self::resource_str(
                        resource,
                        "/purchase_units/0/payments/captures/0/id",
                    ),
                    failure_reason: None,
                }))
            }
            "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.REFUND.PENDING" | "PAYMENT.REFUND.FAILED" => {
                Some(EventTarget::Refund(RefundUpdate {
                    external_id: resource_id()?,
                    refund_id: Self::resource_str(resource, "/invoice_id")
                        .and_then(|id| Uuid::parse_str(&id).ok()),
                    status: self.map_refund_status(&resource_status),
                    failure_reason: Self::resource_str(resource, "/status_details/reason"),
                }))
            }
            _ => None,
        };

        Ok(ProviderEvent {
            event_id: Some(event.id),
            event_type: event.event_type,
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn gateway() -> PayPalGateway {
        PayPalGateway::new(
            Client::new(),
            PayPalConfig {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                webhook_secret: "wh_secret".to_string(),
                api_base: "http://localhost".to_string(),
                return_url: None,
                cancel_url: None,
                webhook_tolerance_secs: 300,
            },
        )
    }

    fn signed_headers(secret: &str, time: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSMISSION_ID_HEADER, HeaderValue::from_static("tx-1"));
        headers.insert(TRANSMISSION_TIME_HEADER, HeaderValue::from_str(time).unwrap());
        headers.insert(
            TRANSMISSION_SIG_HEADER,
            HeaderValue::from_str(&sign_paypal_payload(secret, "tx-1", time, body)).unwrap(),
        );
        headers
    }

    #[test]
    fn status_tables_fall_back_to_failed() {
        let g = gateway();
        assert_eq!(g.map_status("CREATED"), PaymentStatus::Pending);
        assert_eq!(g.map_status("SAVED"), PaymentStatus::Pending);
        assert_eq!(g.map_status("PAYER_ACTION_REQUIRED"), PaymentStatus::RequiresAction);
        assert_eq!(g.map_status("APPROVED"), PaymentStatus::RequiresCapture);
        assert_eq!(g.map_status("PENDING"), PaymentStatus::Processing);
        assert_eq!(g.map_status("COMPLETED"), PaymentStatus::Succeeded);
        assert_eq!(g.map_status("VOIDED"), PaymentStatus::Cancelled);
        assert_eq!(g.map_status("DECLINED"), PaymentStatus::Failed);
        assert_eq!(g.map_status("SOMETHING_ELSE"), PaymentStatus::Failed);
        assert_eq!(g.map_refund_status("PENDING"), RefundStatus::Pending);
        assert_eq!(g.map_refund_status("COMPLETED"), RefundStatus::Succeeded);
        assert_eq!(g.map_refund_status("CANCELLED"), RefundStatus::Cancelled);
        assert_eq!(g.map_refund_status("FAILED"), RefundStatus::Failed);
    }

    #[test]
    fn verifies_transmission_signature() {
        let body = br#"{"id":"WH-1"}"#;
        let now = chrono::Utc::now().to_rfc3339();
        let headers = signed_headers("wh_secret", &now, body);
        assert!(gateway().verify_webhook(&headers, body).is_ok());

        let headers = signed_headers("not_the_secret", &now, body);
        assert!(matches!(
            gateway().verify_webhook(&headers, body),
            Err(ServiceError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_old_transmissions() {
        let body = b"{}";
        let old = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let headers = signed_headers("wh_secret", &old, body);
        assert!(gateway().verify_webhook(&headers, body).is_err());
    }

    #[test]
    fn capture_event_targets_the_related_order() {
        let body = br#"{
            "id": "WH-7",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-1",
                "status": "COMPLETED",
                "supplementary_data": {"related_ids": {"order_id": "ORDER-1"}}
            }
        }"#;
        let event = gateway().parse_webhook(body).unwrap();
        assert_eq!(
            event.target,
            Some(EventTarget::Payment(PaymentUpdate {
                external_id: "ORDER-1".to_string(),
                status: PaymentStatus::Succeeded,
                capture_id: Some("CAP-1".to_string()),
                failure_reason: None,
            }))
        );
    }

    #[test]
    fn completed_order_event_carries_its_capture_id() {
        let body = br#"{
            "id": "WH-8",
            "event_type": "CHECKOUT.ORDER.COMPLETED",
            "resource": {
                "id": "ORDER-2",
                "status": "COMPLETED",
                "purchase_units": [{
                    "payments": {"captures": [{"id": "CAP-2", "status": "COMPLETED"}]}
                }]
            }
        }"#;
        let event = gateway().parse_webhook(body).unwrap();
        assert_eq!(
            event.target,
            Some(EventTarget::Payment(PaymentUpdate {
                external_id: "ORDER-2".to_string(),
                status: PaymentStatus::Succeeded,
                capture_id: Some("CAP-2".to_string()),
                failure_reason: None,
            }))
        );
    }

    #[test]
    fn refund_event_echoes_the_local_refund_id() {
        let local = Uuid::new_v4();
        let body = serde_json::to_vec(&json!({
            "id": "WH-9",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {"id": "REF-9", "status": "COMPLETED", "invoice_id": local.to_string()}
        }))
        .unwrap();
        let event = gateway().parse_webhook(&body).unwrap();
        assert_eq!(
            event.target,
            Some(EventTarget::Refund(RefundUpdate {
                external_id: "REF-9".to_string(),
                refund_id: Some(local),
                status: RefundStatus::Succeeded,
                failure_reason: None,
            }))
        );
    }

    #[tokio::test]
    async fn saved_methods_are_not_supported() {
        let g = gateway();
        assert!(!g.supports_saved_methods());
        assert!(matches!(
            g.list_payment_methods("cus_1").await,
            Err(ServiceError::NotSupported(_))
        ));
        assert!(matches!(
            g.detach_payment_method("pm_1").await,
            Err(ServiceError::NotSupported(_))
        ));
    }
}
