use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{PaymentMethodKind, PaymentProvider, PaymentStatus, RefundReason, RefundStatus},
    errors::ServiceError,
};

use super::{paypal::PayPalGateway, stripe::StripeGateway};

/// Currencies the card networks settle without a fractional unit.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND", "VUV",
    "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
}

/// Converts a major-unit amount to the provider's integer minor units.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    let scaled = if is_zero_decimal(currency) {
        amount
    } else {
        amount * Decimal::ONE_HUNDRED
    };
    if scaled.fract() != Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} {} has more precision than the currency allows",
            amount, currency
        )));
    }
    scaled.to_i64().ok_or_else(|| {
        ServiceError::ValidationError(format!("{} {} is out of range", amount, currency))
    })
}

pub fn from_minor_units(minor: i64, currency: &str) -> Decimal {
    if is_zero_decimal(currency) {
        Decimal::from(minor)
    } else {
        Decimal::new(minor, 2)
    }
}

#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

/// What a provider returned for a newly created intent
#[derive(Debug, Clone)]
pub struct ProviderIntent {
    pub external_id: String,
    /// Client secret (card) or approval link (redirect)
    pub client_token: Option<String>,
    pub status: PaymentStatus,
    pub method_kind: PaymentMethodKind,
    pub next_action: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfirmRequest {
    pub payment_method: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderRefundRequest {
    pub refund_id: Uuid,
    pub payment_external_id: String,
    pub capture_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub reason: RefundReason,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderRefund {
    pub external_id: String,
    pub status: RefundStatus,
    pub failure_reason: Option<String>,
}

/// Provider-reported state of a payment, from a webhook or an API response.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub external_id: String,
    pub status: PaymentStatus,
    pub capture_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Provider-reported state of a refund.
#[derive(Debug, Clone, PartialEq)]
pub struct RefundUpdate {
    pub external_id: String,
    /// Local refund id echoed back by the provider, used when the external
    /// id has not been stored yet.
    pub refund_id: Option<Uuid>,
    pub status: RefundStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventTarget {
    Payment(PaymentUpdate),
    Refund(RefundUpdate),
}

impl EventTarget {
    pub fn external_id(&self) -> &str {
        match self {
            EventTarget::Payment(update) => &update.external_id,
            EventTarget::Refund(update) => &update.external_id,
        }
    }
}

/// A webhook in provider-agnostic form. `target` is `None` for event types
/// this service does not act on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub target: Option<EventTarget>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SavedPaymentMethod {
    pub id: String,
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderCapabilities {
    pub provider: PaymentProvider,
    pub supports_saved_methods: bool,
    pub is_default: bool,
}

/// One payment provider's API behind a provider-agnostic contract.
///
/// Each implementation owns its status vocabulary; `map_status` and
/// `map_refund_status` are total and fall back to `Failed`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    fn supports_saved_methods(&self) -> bool {
        false
    }

    /// Whether refunds are issued against a capture id rather than the payment itself.
    fn refunds_need_capture_id(&self) -> bool {
        false
    }

    async fn create_intent(
        &self,
        request: &CreateIntentRequest,
    ) -> Result<ProviderIntent, ServiceError>;

    async fn confirm(
        &self,
        external_id: &str,
        request: &ConfirmRequest,
    ) -> Result<PaymentUpdate, ServiceError>;

    async fn create_refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefund, ServiceError>;

    fn map_status(&self, raw: &str) -> PaymentStatus;

    fn map_refund_status(&self, raw: &str) -> RefundStatus;

    /// Rejects any delivery whose signature does not match the shared secret.
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ServiceError>;

    fn parse_webhook(&self, body: &[u8]) -> Result<ProviderEvent, ServiceError>;

    async fn list_payment_methods(
        &self,
        _customer_ref: &str,
    ) -> Result<Vec<SavedPaymentMethod>, ServiceError> {
        Err(self.saved_methods_unsupported())
    }

    async fn attach_payment_method(
        &self,
        _customer_ref: &str,
        _method_id: &str,
    ) -> Result<SavedPaymentMethod, ServiceError> {
        Err(self.saved_methods_unsupported())
    }

    async fn detach_payment_method(&self, _method_id: &str) -> Result<(), ServiceError> {
        Err(self.saved_methods_unsupported())
    }

    fn saved_methods_unsupported(&self) -> ServiceError {
        ServiceError::NotSupported(format!(
            "{} does not support saved payment methods",
            self.provider()
        ))
    }
}

/// Gateways registered from configuration, keyed by provider.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentProvider, Arc<dyn PaymentGateway>>,
    default_provider: Option<PaymentProvider>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one gateway per configured provider section, sharing a
    /// client bounded by `payment_provider_timeout_secs`.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout())
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to build HTTP client: {}", e))
            })?;

        let mut registry = Self::new();
        if let Some(stripe) = &config.stripe {
            registry.register(Arc::new(StripeGateway::new(client.clone(), stripe.clone())));
        }
        if let Some(paypal) = &config.paypal {
            registry.register(Arc::new(PayPalGateway::new(client.clone(), paypal.clone())));
        }

        if let Some(name) = &config.default_payment_provider {
            let provider = name
                .parse::<PaymentProvider>()
                .map_err(ServiceError::ValidationError)?;
            registry = registry.with_default(provider);
        }

        info!(
            providers = ?registry.gateways.keys().collect::<Vec<_>>(),
            default = ?registry.default_provider,
            "payment gateways registered"
        );
        Ok(registry)
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn with_default(mut self, provider: PaymentProvider) -> Self {
        self.default_provider = Some(provider);
        self
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.gateways.get(&provider).cloned().ok_or_else(|| {
            ServiceError::NotSupported(format!("Payment provider {} is not configured", provider))
        })
    }

    /// Picks the requested provider, else the configured default, else the
    /// only registered one.
    pub fn resolve(
        &self,
        requested: Option<PaymentProvider>,
    ) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        if let Some(provider) = requested.or(self.default_provider) {
            return self.get(provider);
        }
        let mut gateways = self.gateways.values();
        match (gateways.next(), gateways.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(ServiceError::NotSupported(
                "No payment provider is configured".to_string(),
            )),
            _ => Err(ServiceError::ValidationError(
                "A payment provider must be specified".to_string(),
            )),
        }
    }

    pub fn capabilities(&self) -> Vec<ProviderCapabilities> {
        let mut capabilities: Vec<_> = self
            .gateways
            .values()
            .map(|g| ProviderCapabilities {
                provider: g.provider(),
                supports_saved_methods: g.supports_saved_methods(),
                is_default: self.default_provider == Some(g.provider()),
            })
            .collect();
        capabilities.sort_by_key(|c| c.provider.as_str());
        capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_respect_zero_decimal_currencies() {
        assert_eq!(to_minor_units(dec!(12.34), "USD").unwrap(), 1234);
        assert_eq!(to_minor_units(dec!(500), "jpy").unwrap(), 500);
        assert_eq!(from_minor_units(1234, "EUR"), dec!(12.34));
        assert_eq!(from_minor_units(500, "JPY"), dec!(500));
    }

    #[test]
    fn sub_cent_amounts_are_rejected() {
        assert!(to_minor_units(dec!(1.005), "USD").is_err());
        assert!(to_minor_units(dec!(10.5), "JPY").is_err());
    }

    #[test]
    fn empty_registry_resolves_to_not_supported() {
        let registry = GatewayRegistry::new();
        assert!(matches!(
            registry.resolve(None),
            Err(ServiceError::NotSupported(_))
        ));
        assert!(registry.capabilities().is_empty());
    }
}
