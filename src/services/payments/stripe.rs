use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::HeaderMap;
use metrics::counter;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::StripeConfig,
    entities::{PaymentMethodKind, PaymentProvider, PaymentStatus, RefundReason, RefundStatus},
    errors::ServiceError,
};

use super::gateway::{
    to_minor_units, ConfirmRequest, CreateIntentRequest, EventTarget, PaymentGateway,
    PaymentUpdate, ProviderEvent, ProviderIntent, ProviderRefund, ProviderRefundRequest,
    RefundUpdate, SavedPaymentMethod,
};

type HmacSha256 = Hmac<Sha256>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// Builds a `Stripe-Signature` header value for `body` signed at `timestamp`.
pub fn sign_stripe_payload(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let signature = stripe_mac(secret, timestamp, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

/// MAC over `"{timestamp}.{body}"`, ready to finalize or verify.
fn stripe_mac(secret: &str, timestamp: i64, body: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(body);
    Some(mac)
}

fn reject(reason: &str) -> ServiceError {
    warn!(provider = "stripe", reason, "webhook signature rejected");
    ServiceError::InvalidSignature
}

/// Card-style provider: form-encoded REST with a bearer secret key.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    client_secret: Option<String>,
    next_action: Option<StripeNextAction>,
    last_payment_error: Option<StripeErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StripeNextAction {
    #[serde(rename = "type")]
    action_type: String,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeCard {
    brand: Option<String>,
    last4: Option<String>,
    exp_month: Option<u32>,
    exp_year: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentMethod {
    id: String,
    #[serde(rename = "type")]
    method_type: String,
    card: Option<StripeCard>,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

impl From<StripePaymentMethod> for SavedPaymentMethod {
    fn from(method: StripePaymentMethod) -> Self {
        let card = method.card;
        Self {
            id: method.id,
            kind: method.method_type,
            brand: card.as_ref().and_then(|c| c.brand.clone()),
            last4: card.as_ref().and_then(|c| c.last4.clone()),
            exp_month: card.as_ref().and_then(|c| c.exp_month),
            exp_year: card.as_ref().and_then(|c| c.exp_year),
        }
    }
}

fn refund_reason_param(reason: RefundReason) -> Option<&'static str> {
    match reason {
        RefundReason::Duplicate => Some("duplicate"),
        RefundReason::Fraudulent => Some("fraudulent"),
        RefundReason::RequestedByCustomer => Some("requested_by_customer"),
        RefundReason::Other => None,
    }
}

impl StripeGateway {
    pub fn new(client: Client, config: StripeConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T, ServiceError> {
        let response = request
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| {
                counter!("orderline.provider.calls", 1, "provider" => "stripe", "operation" => operation, "result" => "unreachable");
                warn!(operation, error = %e, "Stripe request failed");
                ServiceError::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            counter!("orderline.provider.calls", 1, "provider" => "stripe", "operation" => operation, "result" => "error");
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.message.or(b.error.code))
                .unwrap_or_else(|| format!("HTTP {}", status));
            warn!(operation, %status, %message, "Stripe API error");
            return Err(ServiceError::ProviderError(format!("Stripe: {}", message)));
        }

        counter!("orderline.provider.calls", 1, "provider" => "stripe", "operation" => operation, "result" => "ok");
        response.json::<T>().await.map_err(|e| {
            ServiceError::ProviderError(format!("Failed to parse Stripe response: {}", e))
        })
    }

    fn intent_update(&self, intent: StripePaymentIntent) -> PaymentUpdate {
        let status = self.map_status(&intent.status);
        PaymentUpdate {
            external_id: intent.id,
            status,
            capture_id: None,
            failure_reason: intent
                .last_payment_error
                .and_then(|e| e.message)
                .filter(|_| status == PaymentStatus::Failed),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    fn supports_saved_methods(&self) -> bool {
        true
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ServiceError> {
        let amount = to_minor_units(request.amount, &request.currency)?;
        let mut params = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), request.currency.to_ascii_lowercase()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
            ("metadata[order_id]".to_string(), request.order_id.to_string()),
            ("metadata[customer_id]".to_string(), request.customer_id.to_string()),
        ];
        for (key, value) in &request.metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        let intent: StripePaymentIntent = self
            .send(
                self.client
                    .post(self.url("/v1/payment_intents"))
                    .form(&params),
                "create_intent",
            )
            .await?;

        let status = self.map_status(&intent.status);
        info!(external_id = %intent.id, %status, "Stripe payment intent created");
        Ok(ProviderIntent {
            external_id: intent.id,
            client_token: intent.client_secret,
            status,
            method_kind: PaymentMethodKind::Card,
            next_action: intent.next_action.map(|a| a.action_type),
        })
    }

    #[instrument(skip(self, request))]
    async fn confirm(
        &self,
        external_id: &str,
        request: &ConfirmRequest,
    ) -> Result<PaymentUpdate, ServiceError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(method) = &request.payment_method {
            params.push(("payment_method", method.clone()));
        }
        if let Some(return_url) = &request.return_url {
            params.push(("return_url", return_url.clone()));
        }

        let intent: StripePaymentIntent = self
            .send(
                self.client
                    .post(self.url(&format!("/v1/payment_intents/{}/confirm", external_id)))
                    .form(&params),
                "confirm",
            )
            .await?;
        Ok(self.intent_update(intent))
    }

    #[instrument(skip(self, request), fields(refund_id = %request.refund_id))]
    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefund, ServiceError> {
        let mut params = vec![
            ("payment_intent", request.payment_external_id.clone()),
            (
                "amount",
                to_minor_units(request.amount, &request.currency)?.to_string(),
            ),
            ("metadata[refund_id]", request.refund_id.to_string()),
        ];
        if let Some(reason) = refund_reason_param(request.reason) {
            params.push(("reason", reason.to_string()));
        }

        let refund: StripeRefund = self
            .send(
                self.client
                    .post(self.url("/v1/refunds"))
                    .header("Idempotency-Key", request.refund_id.to_string())
                    .form(&params),
                "create_refund",
            )
            .await?;

        Ok(ProviderRefund {
            status: self.map_refund_status(&refund.status),
            external_id: refund.id,
            failure_reason: refund.failure_reason,
        })
    }

    fn map_status(&self, raw: &str) -> PaymentStatus {
        match raw {
            "requires_payment_method" | "requires_confirmation" => PaymentStatus::Pending,
            "requires_action" => PaymentStatus::RequiresAction,
            "processing" => PaymentStatus::Processing,
            "requires_capture" => PaymentStatus::RequiresCapture,
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" => PaymentStatus::Cancelled,
            _ => PaymentStatus::Failed,
        }
    }

    fn map_refund_status(&self, raw: &str) -> RefundStatus {
        match raw {
            "pending" | "requires_action" => RefundStatus::Pending,
            "succeeded" => RefundStatus::Succeeded,
            "canceled" => RefundStatus::Cancelled,
            _ => RefundStatus::Failed,
        }
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        let header = headers
            .get(STRIPE_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject("missing signature header"))?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or_else(|| reject("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(reject("missing v1 signature"));
        }

        let age = chrono::Utc::now().timestamp() - timestamp;
        if age.abs() > self.config.webhook_tolerance_secs {
            return Err(reject("timestamp outside tolerance"));
        }

        let verified = signatures.iter().any(|candidate| {
            match (
                hex::decode(candidate),
                stripe_mac(&self.config.webhook_secret, timestamp, body),
            ) {
                (Ok(candidate), Some(mac)) => mac.verify_slice(&candidate).is_ok(),
                _ => false,
            }
        });

        if verified {
            Ok(())
        } else {
            Err(reject("signature mismatch"))
        }
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, ServiceError> {
        let event: StripeEvent = serde_json::from_slice(body).map_err(|e| {
            ServiceError::ValidationError(format!("Malformed Stripe event: {}", e))
        })?;
        let object = &event.data.object;
        let field = |name: &str| object.get(name).and_then(|v| v.as_str()).map(String::from);

        let target = match event.event_type.as_str() {
            "payment_intent.succeeded"
            | "payment_intent.processing"
            | "payment_intent.requires_action"
            | "payment_intent.amount_capturable_updated"
            | "payment_intent.canceled"
            | "payment_intent.payment_failed" => {
                let external_id = field("id").ok_or_else(|| {
                    ServiceError::ValidationError("Stripe event object has no id".to_string())
                })?;
                let status = if event.event_type == "payment_intent.payment_failed" {
                    PaymentStatus::Failed
                } else {
                    field("status")
                        .map(|s| self.map_status(&s))
                        .unwrap_or(PaymentStatus::Failed)
                };
                let failure_reason = object
                    .get("last_payment_error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .filter(|_| status == PaymentStatus::Failed);
                Some(EventTarget::Payment(PaymentUpdate {
                    external_id,
                    status,
                    capture_id: None,
                    failure_reason,
                }))
            }
            "refund.created" | "refund.updated" | "refund.failed" | "charge.refund.updated" => {
                let external_id = field("id").ok_or_else(|| {
                    ServiceError::ValidationError("Stripe refund object has no id".to_string())
                })?;
                Some(EventTarget::Refund(RefundUpdate {
                    external_id,
                    refund_id: object
                        .pointer("/metadata/refund_id")
                        .and_then(|v| v.as_str())
                        .and_then(|id| Uuid::parse_str(id).ok()),
                    status: field("status")
                        .map(|s| self.map_refund_status(&s))
                        .unwrap_or(RefundStatus::Failed),
                    failure_reason: field("failure_reason"),
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

    async fn list_payment_methods(
        &self,
        customer_ref: &str,
    ) -> Result<Vec<SavedPaymentMethod>, ServiceError> {
        let list: StripeList<StripePaymentMethod> = self
            .send(
                self.client
                    .get(self.url("/v1/payment_methods"))
                    .query(&[("customer", customer_ref), ("type", "card")]),
                "list_payment_methods",
            )
            .await?;
        Ok(list.data.into_iter().map(SavedPaymentMethod::from).collect())
    }

    async fn attach_payment_method(
        &self,
        customer_ref: &str,
        method_id: &str,
    ) -> Result<SavedPaymentMethod, ServiceError> {
        let method: StripePaymentMethod = self
            .send(
                self.client
                    .post(self.url(&format!("/v1/payment_methods/{}/attach", method_id)))
                    .form(&[("customer", customer_ref)]),
                "attach_payment_method",
            )
            .await?;
        Ok(method.into())
    }

    async fn detach_payment_method(&self, method_id: &str) -> Result<(), ServiceError> {
        let _: StripePaymentMethod = self
            .send(
                self.client
                    .post(self.url(&format!("/v1/payment_methods/{}/detach", method_id))),
                "detach_payment_method",
            )
            .await?;
        Ok(())
    }
}
