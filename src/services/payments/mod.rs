pub mod gateway;
pub mod paypal;
pub mod stripe;
pub mod token_cache;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::OrderStatus,
        payment::{self, PaymentMethodKind, PaymentProvider, PaymentStatus},
        refund::{self, RefundReason, RefundStatus},
    },
    errors::ServiceError,
    services::{order_lifecycle::load_order, reconciliation::WebhookReconciler},
};

pub use gateway::{
    ConfirmRequest, CreateIntentRequest, GatewayRegistry, PaymentGateway, ProviderCapabilities,
    SavedPaymentMethod,
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentView {
    pub id: Uuid,
    pub order_id: Uuid,
    pub provider: PaymentProvider,
    pub external_id: String,
    pub method_kind: PaymentMethodKind,
    pub status: PaymentStatus,
    pub requires_action: bool,
    pub amount: Decimal,
    pub currency: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<payment::Model> for PaymentView {
    fn from(model: payment::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            provider: model.provider,
            external_id: model.external_id,
            method_kind: model.method_kind,
            requires_action: model.status.requires_action(),
            status: model.status,
            amount: model.amount,
            currency: model.currency,
            failure_reason: model.failure_reason,
            created_at: model.created_at,
            updated_at: model.updated_at,
            processed_at: model.processed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentResponse {
    #[serde(flatten)]
    pub payment: PaymentView,
    /// Card client secret, or the approval URL for redirect providers
    pub client_token: Option<String>,
    pub next_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundView {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub provider: PaymentProvider,
    pub external_id: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: RefundReason,
    pub note: Option<String>,
    pub processed_by: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<refund::Model> for RefundView {
    fn from(model: refund::Model) -> Self {
        Self {
            id: model.id,
            payment_id: model.payment_id,
            provider: model.provider,
            external_id: model.external_id,
            amount: model.amount,
            currency: model.currency,
            status: model.status,
            reason: model.reason,
            note: model.note,
            processed_by: model.processed_by,
            failure_reason: model.failure_reason,
            created_at: model.created_at,
            processed_at: model.processed_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateIntentInput {
    pub order_id: Uuid,
    /// Defaults to the configured provider
    pub provider: Option<PaymentProvider>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
pub struct ConfirmPaymentInput {
    #[validate(length(min = 1, max = 255))]
    pub payment_method: Option<String>,
    #[validate(url)]
    pub return_url: Option<String>,
}

impl From<ConfirmPaymentInput> for ConfirmRequest {
    fn from(input: ConfirmPaymentInput) -> Self {
        Self {
            payment_method: input.payment_method,
            return_url: input.return_url,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateRefundInput {
    pub amount: Decimal,
    #[serde(default = "default_refund_reason")]
    pub reason: RefundReason,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

fn default_refund_reason() -> RefundReason {
    RefundReason::RequestedByCustomer
}

/// Remaining refundable balance: payment amount minus pending and
/// succeeded refunds.
pub fn refundable_balance(amount: Decimal, refunds: &[refund::Model]) -> Decimal {
    let committed: Decimal = refunds
        .iter()
        .filter(|r| r.status.counts_against_balance())
        .map(|r| r.amount)
        .sum();
    amount - committed
}

/// Payment intents, confirmations and refunds against the configured providers.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    reconciler: Arc<WebhookReconciler>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<GatewayRegistry>,
        reconciler: Arc<WebhookReconciler>,
    ) -> Self {
        Self {
            db,
            registry,
            reconciler,
        }
    }

    pub fn providers(&self) -> Vec<ProviderCapabilities> {
        self.registry.capabilities()
    }

    /// Opens a payment with the provider for the order's total, then records
    /// it. A provider failure or timeout leaves nothing behind, so the call
    /// is safe to retry.
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn create_payment_intent(
        &self,
        customer_id: Uuid,
        input: CreateIntentInput,
    ) -> Result<PaymentIntentResponse, ServiceError> {
        input.validate()?;
        let order = load_order(&*self.db, input.order_id).await?;
        if order.customer_id != customer_id {
            return Err(ServiceError::Unauthorized(format!(
                "Order {} does not belong to the caller",
                order.id
            )));
        }
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is {} and no longer accepts payment",
                order.order_number, order.status
            )));
        }
        let already_paid = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Succeeded.to_value()))
            .one(&*self.db)
            .await?;
        if already_paid.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is already paid",
                order.order_number
            )));
        }

        let gateway = self.registry.resolve(input.provider)?;
        let mut metadata = input.metadata.unwrap_or_default();
        metadata.insert("order_number".to_string(), order.order_number.clone());
        let request = CreateIntentRequest {
            order_id: order.id,
            customer_id,
            amount: order.total_amount,
            currency: order.currency.clone(),
            metadata,
        };

        let intent = gateway.create_intent(&request).await.map_err(|e| {
            warn!(provider = %gateway.provider(), error = %e, "payment intent creation failed");
            e
        })?;

        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            customer_id: Set(customer_id),
            provider: Set(gateway.provider()),
            external_id: Set(intent.external_id.clone()),
            provider_capture_id: Set(None),
            method_kind: Set(intent.method_kind),
            status: Set(intent.status),
            amount: Set(request.amount),
            currency: Set(request.currency.clone()),
            failure_reason: Set(None),
            metadata: Set(serde_json::to_value(&request.metadata).ok()),
            created_at: Set(now),
            updated_at: Set(now),
            processed_at: Set(None),
            version: Set(1),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| {
            error!(
                external_id = %intent.external_id,
                error = %e,
                "provider intent created but not recorded; webhook will report unknown entity"
            );
            ServiceError::DatabaseError(e)
        })?;

        counter!("orderline.payments.intents", 1, "provider" => payment.provider.as_str());
        info!(
            payment_id = %payment.id,
            external_id = %payment.external_id,
            status = %payment.status,
            "payment intent created"
        );

        Ok(PaymentIntentResponse {
            payment: payment.into(),
            client_token: intent.client_token,
            next_action: intent.next_action,
        })
    }

    /// Confirms (card) or captures (redirect) a payment. The stored status
    /// only ever changes from the provider's response; on failure or
    /// timeout it is left for a later webhook.
    #[instrument(skip(self, input))]
    pub async fn confirm_payment(
        &self,
        payment_id: Uuid,
        customer_id: Option<Uuid>,
        input: ConfirmPaymentInput,
    ) -> Result<PaymentView, ServiceError> {
        input.validate()?;
        let payment = self.load_payment(payment_id, customer_id).await?;
        if payment.status.is_terminal() {
            info!(status = %payment.status, "payment already settled; nothing to confirm");
            return Ok(payment.into());
        }

        let gateway = self.registry.get(payment.provider)?;
        let update = gateway
            .confirm(&payment.external_id, &input.into())
            .await
            .map_err(|e| {
                warn!(
                    status = %payment.status,
                    error = %e,
                    "payment confirmation failed; status left for webhook reconciliation"
                );
                e
            })?;

        let reconciled = self
            .reconciler
            .apply_payment_update(payment.provider, &update)
            .await?;
        info!(outcome = %reconciled.outcome, "confirmation applied");

        Ok(self.load_payment(payment_id, None).await?.into())
    }

    /// Issues a refund after checking the payment's remaining refundable
    /// balance. The check and the pending refund row commit together under
    /// the payment's version, so concurrent refunds cannot overdraw it.
    #[instrument(skip(self, input), fields(amount = %input.amount))]
    pub async fn create_refund(
        &self,
        payment_id: Uuid,
        input: CreateRefundInput,
        actor_id: Uuid,
    ) -> Result<RefundView, ServiceError> {
        input.validate()?;
        if input.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Refund amount must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if payment.status != PaymentStatus::Succeeded {
            return Err(ServiceError::ValidationError(format!(
                "Payment {} is {}; only succeeded payments can be refunded",
                payment_id, payment.status
            )));
        }
        let gateway = self.registry.get(payment.provider)?;
        if gateway.refunds_need_capture_id() && payment.provider_capture_id.is_none() {
            return Err(ServiceError::ValidationError(format!(
                "Payment {} has no recorded capture to refund",
                payment_id
            )));
        }

        let existing = refund::Entity::find()
            .filter(refund::Column::PaymentId.eq(payment_id))
            .all(&txn)
            .await?;
        let remaining = refundable_balance(payment.amount, &existing);
        if input.amount > remaining {
            warn!(%remaining, "refund exceeds refundable balance");
            return Err(ServiceError::InsufficientRefundableAmount {
                requested: input.amount,
                remaining,
            });
        }

        let now = Utc::now();
        let guard = payment::Entity::update_many()
            .col_expr(
                payment::Column::Version,
                Expr::col(payment::Column::Version).add(1),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Version.eq(payment.version))
            .exec(&txn)
            .await?;
        if guard.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(payment.id));
        }

        let pending = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(payment.id),
            provider: Set(payment.provider),
            external_id: Set(None),
            amount: Set(input.amount),
            currency: Set(payment.currency.clone()),
            status: Set(RefundStatus::Pending),
            reason: Set(input.reason),
            note: Set(input.note.clone()),
            processed_by: Set(Some(actor_id)),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            processed_at: Set(None),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        let request = gateway::ProviderRefundRequest {
            refund_id: pending.id,
            payment_external_id: payment.external_id.clone(),
            capture_id: payment.provider_capture_id.clone(),
            amount: input.amount,
            currency: payment.currency.clone(),
            reason: input.reason,
            note: input.note,
        };

        match gateway.create_refund(&request).await {
            Ok(provider_refund) => {
                refund::Entity::update_many()
                    .col_expr(
                        refund::Column::ExternalId,
                        Expr::value(provider_refund.external_id.clone()),
                    )
                    .col_expr(refund::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(refund::Column::Id.eq(pending.id))
                    .exec(&*self.db)
                    .await?;
                self.reconciler
                    .apply_refund_update(
                        payment.provider,
                        &gateway::RefundUpdate {
                            external_id: provider_refund.external_id,
                            refund_id: Some(pending.id),
                            status: provider_refund.status,
                            failure_reason: provider_refund.failure_reason,
                        },
                    )
                    .await?;
                counter!("orderline.refunds.issued", 1, "provider" => payment.provider.as_str());
            }
            Err(e) => {
                error!(refund_id = %pending.id, error = %e, "provider rejected refund");
                let now = Utc::now();
                refund::Entity::update_many()
                    .col_expr(
                        refund::Column::Status,
                        Expr::value(RefundStatus::Failed.to_value()),
                    )
                    .col_expr(refund::Column::FailureReason, Expr::value(e.to_string()))
                    .col_expr(refund::Column::UpdatedAt, Expr::value(now))
                    .col_expr(refund::Column::ProcessedAt, Expr::value(now))
                    .filter(refund::Column::Id.eq(pending.id))
                    .filter(refund::Column::Status.eq(RefundStatus::Pending.to_value()))
                    .exec(&*self.db)
                    .await?;
                return Err(match e {
                    ServiceError::ProviderError(_) => e,
                    other => ServiceError::ProviderError(other.to_string()),
                });
            }
        }

        let refund = refund::Entity::find_by_id(pending.id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Refund {} not found", pending.id)))?;
        info!(refund_id = %refund.id, status = %refund.status, "refund recorded");
        Ok(refund.into())
    }

    pub async fn get_payment(
        &self,
        payment_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<PaymentView, ServiceError> {
        Ok(self.load_payment(payment_id, customer_id).await?.into())
    }

    pub async fn list_order_payments(
        &self,
        order_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<Vec<PaymentView>, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        if customer_id.is_some_and(|c| c != order.customer_id) {
            return Err(ServiceError::Unauthorized(format!(
                "Order {} does not belong to the caller",
                order_id
            )));
        }
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(PaymentView::from)
            .collect())
    }

    pub async fn list_refunds(&self, payment_id: Uuid) -> Result<Vec<RefundView>, ServiceError> {
        self.load_payment(payment_id, None).await?;
        Ok(refund::Entity::find()
            .filter(refund::Column::PaymentId.eq(payment_id))
            .order_by_asc(refund::Column::CreatedAt)
            .all(&*self.db)
            .await?
            .into_iter()
            .map(RefundView::from)
            .collect())
    }

    pub async fn list_payment_methods(
        &self,
        provider: PaymentProvider,
        customer_ref: &str,
    ) -> Result<Vec<SavedPaymentMethod>, ServiceError> {
        self.saved_methods_gateway(provider)?
            .list_payment_methods(customer_ref)
            .await
    }

    pub async fn attach_payment_method(
        &self,
        provider: PaymentProvider,
        customer_ref: &str,
        method_id: &str,
    ) -> Result<SavedPaymentMethod, ServiceError> {
        self.saved_methods_gateway(provider)?
            .attach_payment_method(customer_ref, method_id)
            .await
    }

    pub async fn detach_payment_method(
        &self,
        provider: PaymentProvider,
        method_id: &str,
    ) -> Result<(), ServiceError> {
        self.saved_methods_gateway(provider)?
            .detach_payment_method(method_id)
            .await
    }

    fn saved_methods_gateway(
        &self,
        provider: PaymentProvider,
    ) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        let gateway = self.registry.get(provider)?;
        if !gateway.supports_saved_methods() {
            return Err(gateway.saved_methods_unsupported());
        }
        Ok(gateway)
    }

    async fn load_payment(
        &self,
        payment_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<payment::Model, ServiceError> {
        let payment = payment::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if customer_id.is_some_and(|c| c != payment.customer_id) {
            return Err(ServiceError::Unauthorized(format!(
                "Payment {} does not belong to the caller",
                payment_id
            )));
        }
        Ok(payment)
    }
}
