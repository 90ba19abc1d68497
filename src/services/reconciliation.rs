use std::sync::Arc;

use chrono::Utc;
use http::HeaderMap;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::OrderStatus,
        payment::{self, PaymentProvider, PaymentStatus},
        refund::{self, RefundStatus},
        webhook_event::{self, WebhookOutcome},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        order_lifecycle::{apply_transition, load_order, AppliedTransition},
        payments::gateway::{
            EventTarget, GatewayRegistry, PaymentUpdate, ProviderEvent, RefundUpdate,
        },
    },
    PaginatedResponse,
};

/// Statuses that can settle for good.
pub trait SettlementStatus: Copy + PartialEq {
    fn is_terminal(self) -> bool;
}

impl SettlementStatus for PaymentStatus {
    fn is_terminal(self) -> bool {
        PaymentStatus::is_terminal(self)
    }
}

impl SettlementStatus for RefundStatus {
    fn is_terminal(self) -> bool {
        RefundStatus::is_terminal(self)
    }
}

/// Decides what an inbound status means for a record in `recorded`.
/// `None` means the update should be applied.
pub fn classify<S: SettlementStatus>(recorded: S, inbound: S) -> Option<WebhookOutcome> {
    if recorded == inbound {
        Some(WebhookOutcome::Duplicate)
    } else if recorded.is_terminal() && inbound.is_terminal() {
        Some(WebhookOutcome::Conflict)
    } else if recorded.is_terminal() {
        Some(WebhookOutcome::Stale)
    } else {
        None
    }
}

/// Result of reconciling one provider-reported state.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub outcome: WebhookOutcome,
    pub detail: Option<String>,
}

impl Reconciled {
    fn new(outcome: WebhookOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
        }
    }
}

/// Applies provider-reported payment and refund states to local records,
/// at most once per terminal state. Webhooks and synchronous provider
/// responses both go through here.
#[derive(Clone)]
pub struct WebhookReconciler {
    db: Arc<DatabaseConnection>,
    registry: Arc<GatewayRegistry>,
    event_sender: Arc<EventSender>,
}

impl WebhookReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        registry: Arc<GatewayRegistry>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            registry,
            event_sender,
        }
    }

    /// Processes one webhook delivery.
    ///
    /// Returns `Err(InvalidSignature)` when the delivery cannot be
    /// authenticated and nothing was touched. Every authenticated delivery
    /// yields `Ok` with its recorded outcome, including internal failures.
    #[instrument(skip(self, headers, body), fields(provider = %provider))]
    pub async fn handle(
        &self,
        provider: PaymentProvider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        let gateway = self.registry.get(provider)?;
        if gateway.verify_webhook(headers, body).is_err() {
            counter!("orderline.webhooks.rejected", 1, "provider" => provider.as_str());
            return Err(ServiceError::InvalidSignature);
        }

        let payload = serde_json::from_slice::<serde_json::Value>(body).ok();
        let event = match gateway.parse_webhook(body) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "authenticated webhook could not be parsed");
                let event = ProviderEvent {
                    event_id: None,
                    event_type: "unparseable".to_string(),
                    target: None,
                };
                let outcome = WebhookOutcome::Failed;
                self.record(provider, None, &event, outcome, Some(e.to_string()), payload)
                    .await;
                return Ok(outcome);
            }
        };

        let prior = match &event.event_id {
            Some(event_id) => webhook_event::Entity::find()
                .filter(webhook_event::Column::Provider.eq(provider.to_value()))
                .filter(webhook_event::Column::EventId.eq(event_id.clone()))
                .one(&*self.db)
                .await
                .unwrap_or_else(|e| {
                    error!(error = %e, "webhook inbox lookup failed");
                    None
                }),
            None => None,
        };
        if let Some(prior) = &prior {
            if !prior.outcome.is_retryable() {
                info!(
                    event_id = ?event.event_id,
                    prior_outcome = %prior.outcome,
                    "webhook event already processed"
                );
                counter!("orderline.webhooks.processed", 1, "provider" => provider.as_str(), "outcome" => WebhookOutcome::Duplicate.as_str());
                return Ok(WebhookOutcome::Duplicate);
            }
            info!(
                event_id = ?event.event_id,
                prior_outcome = %prior.outcome,
                "retrying previously unapplied webhook event"
            );
        }

        let result = match &event.target {
            None => {
                info!(event_type = %event.event_type, "ignoring unhandled webhook event type");
                Ok(Reconciled {
                    outcome: WebhookOutcome::Ignored,
                    detail: None,
                })
            }
            Some(EventTarget::Payment(update)) => self.apply_payment_update(provider, update).await,
            Some(EventTarget::Refund(update)) => self.apply_refund_update(provider, update).await,
        };

        let reconciled = result.unwrap_or_else(|e| {
            error!(
                event_type = %event.event_type,
                event_id = ?event.event_id,
                error = %e,
                "webhook processing failed; acknowledged for operator follow-up"
            );
            Reconciled::new(WebhookOutcome::Failed, e.to_string())
        });

        self.record(
            provider,
            prior,
            &event,
            reconciled.outcome,
            reconciled.detail,
            payload,
        )
        .await;
        counter!("orderline.webhooks.processed", 1, "provider" => provider.as_str(), "outcome" => reconciled.outcome.as_str());
        Ok(reconciled.outcome)
    }

    /// Applies a provider-reported payment state by `(provider, external_id)`.
    #[instrument(skip(self, update), fields(external_id = %update.external_id, inbound = %update.status))]
    pub async fn apply_payment_update(
        &self,
        provider: PaymentProvider,
        update: &PaymentUpdate,
    ) -> Result<Reconciled, ServiceError> {
        let txn = self.db.begin().await?;

        let payment = match payment::Entity::find()
            .filter(payment::Column::Provider.eq(provider.to_value()))
            .filter(payment::Column::ExternalId.eq(update.external_id.clone()))
            .one(&txn)
            .await?
        {
            Some(payment) => payment,
            None => {
                warn!("no local payment for provider transaction; ignoring");
                return Ok(Reconciled::new(
                    WebhookOutcome::UnknownEntity,
                    format!("no payment with external id {}", update.external_id),
                ));
            }
        };

        let recorded = payment.status;
        if let Some(outcome) = classify(recorded, update.status) {
            // A capture can be reported after the payment already settled.
            if outcome == WebhookOutcome::Duplicate && payment.provider_capture_id.is_none() {
                if let Some(capture_id) = &update.capture_id {
                    payment::Entity::update_many()
                        .col_expr(
                            payment::Column::ProviderCaptureId,
                            Expr::value(capture_id.clone()),
                        )
                        .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
                        .filter(payment::Column::Id.eq(payment.id))
                        .filter(payment::Column::ProviderCaptureId.is_null())
                        .exec(&txn)
                        .await?;
                    info!(
                        payment_id = %payment.id,
                        capture_id = %capture_id,
                        "recorded late capture id"
                    );
                }
            }
            txn.commit().await?;
            return Ok(self
                .settled_outcome(provider, &update.external_id, outcome, recorded, update.status)
                .await);
        }

        let now = Utc::now();
        let mut cas = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(update.status.to_value()))
            .col_expr(
                payment::Column::Version,
                Expr::col(payment::Column::Version).add(1),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now));
        if update.status.is_terminal() {
            cas = cas.col_expr(payment::Column::ProcessedAt, Expr::value(now));
        }
        if let Some(capture_id) = &update.capture_id {
            cas = cas.col_expr(
                payment::Column::ProviderCaptureId,
                Expr::value(capture_id.clone()),
            );
        }
        if let Some(reason) = &update.failure_reason {
            cas = cas.col_expr(payment::Column::FailureReason, Expr::value(reason.clone()));
        }
        let result = cas
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Version.eq(payment.version))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            warn!(payment_id = %payment.id, "payment changed concurrently");
            return Err(ServiceError::ConcurrentModification(payment.id));
        }

        let mut transition: Option<AppliedTransition> = None;
        if update.status == PaymentStatus::Succeeded {
            let order = load_order(&txn, payment.order_id).await?;
            match order.status {
                OrderStatus::Pending => {
                    transition = Some(
                        apply_transition(
                            &txn,
                            &order,
                            OrderStatus::Confirmed,
                            Some(format!("Payment {} succeeded", update.external_id)),
                            None,
                        )
                        .await?,
                    );
                }
                OrderStatus::Cancelled => warn!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    "payment succeeded for a cancelled order; refund required"
                ),
                _ => {}
            }
        }

        txn.commit().await?;

        info!(payment_id = %payment.id, from = %recorded, to = %update.status, "payment reconciled");
        self.event_sender
            .send_or_log(Event::PaymentStatusChanged {
                payment_id: payment.id,
                order_id: payment.order_id,
                from: recorded,
                to: update.status,
            })
            .await;
        if let Some(applied) = transition {
            self.event_sender.send_or_log(applied.event()).await;
        }

        Ok(Reconciled::new(
            WebhookOutcome::Applied,
            format!("payment {} -> {}", recorded, update.status),
        ))
    }

    /// Applies a provider-reported refund state by `(provider, external_id)`.
    #[instrument(skip(self, update), fields(external_id = %update.external_id, inbound = %update.status))]
    pub async fn apply_refund_update(
        &self,
        provider: PaymentProvider,
        update: &RefundUpdate,
    ) -> Result<Reconciled, ServiceError> {
        let txn = self.db.begin().await?;

        let by_external_id = refund::Entity::find()
            .filter(refund::Column::Provider.eq(provider.to_value()))
            .filter(refund::Column::ExternalId.eq(update.external_id.clone()))
            .one(&txn)
            .await?;
        // The provider may report a refund before its id was stored locally.
        let by_local_id = match (&by_external_id, update.refund_id) {
            (None, Some(refund_id)) => {
                refund::Entity::find_by_id(refund_id)
                    .filter(refund::Column::Provider.eq(provider.to_value()))
                    .filter(refund::Column::ExternalId.is_null())
                    .one(&txn)
                    .await?
            }
            _ => None,
        };
        let refund = match by_external_id.or(by_local_id) {
            Some(refund) => refund,
            None => {
                warn!("no local refund for provider refund id; ignoring");
                return Ok(Reconciled::new(
                    WebhookOutcome::UnknownEntity,
                    format!("no refund with external id {}", update.external_id),
                ));
            }
        };
        if refund.external_id.is_none() {
            refund::Entity::update_many()
                .col_expr(
                    refund::Column::ExternalId,
                    Expr::value(update.external_id.clone()),
                )
                .filter(refund::Column::Id.eq(refund.id))
                .filter(refund::Column::ExternalId.is_null())
                .exec(&txn)
                .await?;
            info!(
                refund_id = %refund.id,
                external_id = %update.external_id,
                "linked provider refund id"
            );
        }

        let recorded = refund.status;
        if let Some(outcome) = classify(recorded, update.status) {
            txn.commit().await?;
            return Ok(self
                .settled_outcome(provider, &update.external_id, outcome, recorded, update.status)
                .await);
        }

        let now = Utc::now();
        let mut cas = refund::Entity::update_many()
            .col_expr(refund::Column::Status, Expr::value(update.status.to_value()))
            .col_expr(refund::Column::UpdatedAt, Expr::value(now));
        if update.status.is_terminal() {
            cas = cas.col_expr(refund::Column::ProcessedAt, Expr::value(now));
        }
        if let Some(reason) = &update.failure_reason {
            cas = cas.col_expr(refund::Column::FailureReason, Expr::value(reason.clone()));
        }
        let result = cas
            .filter(refund::Column::Id.eq(refund.id))
            .filter(refund::Column::Status.eq(recorded.to_value()))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            warn!(refund_id = %refund.id, "refund changed concurrently");
            return Err(ServiceError::ConcurrentModification(refund.id));
        }

        let parent = payment::Entity::find_by_id(refund.payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment {} not found", refund.payment_id))
            })?;

        let mut transition: Option<AppliedTransition> = None;
        if update.status == RefundStatus::Succeeded {
            let order = load_order(&txn, parent.order_id).await?;
            if order.status.can_transition_to(OrderStatus::Refunded) {
                transition = Some(
                    apply_transition(
                        &txn,
                        &order,
                        OrderStatus::Refunded,
                        Some(format!("Refund {} succeeded", update.external_id)),
                        refund.processed_by,
                    )
                    .await?,
                );
            } else if order.status != OrderStatus::Refunded {
                info!(
                    order_id = %order.id,
                    status = %order.status,
                    "refund succeeded; order status left for an operator"
                );
            }
        }

        txn.commit().await?;

        info!(refund_id = %refund.id, from = %recorded, to = %update.status, "refund reconciled");
        self.event_sender
            .send_or_log(Event::RefundStatusChanged {
                refund_id: refund.id,
                payment_id: parent.id,
                customer_id: parent.customer_id,
                amount: refund.amount,
                currency: refund.currency.clone(),
                status: update.status,
            })
            .await;
        if let Some(applied) = transition {
            self.event_sender.send_or_log(applied.event()).await;
        }

        Ok(Reconciled::new(
            WebhookOutcome::Applied,
            format!("refund {} -> {}", recorded, update.status),
        ))
    }

    /// Webhook deliveries that contradicted an already-settled record,
    /// newest first.
    pub async fn conflicts(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedResponse<webhook_event::Model>, ServiceError> {
        let page = page.max(1);
        let limit = limit.clamp(1, 100);
        let paginator = webhook_event::Entity::find()
            .filter(webhook_event::Column::Outcome.eq(WebhookOutcome::Conflict.to_value()))
            .order_by_desc(webhook_event::Column::ReceivedAt)
            .paginate(&*self.db, limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page - 1).await?;
        Ok(PaginatedResponse {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    async fn settled_outcome(
        &self,
        provider: PaymentProvider,
        external_id: &str,
        outcome: WebhookOutcome,
        recorded: impl std::fmt::Display,
        reported: impl std::fmt::Display,
    ) -> Reconciled {
        match outcome {
            WebhookOutcome::Conflict => {
                error!(
                    %provider,
                    external_id,
                    %recorded,
                    %reported,
                    "provider reported a different terminal state; keeping the recorded one"
                );
                counter!("orderline.webhooks.conflicts", 1, "provider" => provider.as_str());
                self.event_sender
                    .send_or_log(Event::ReconciliationConflict {
                        provider,
                        external_id: external_id.to_string(),
                        recorded: recorded.to_string(),
                        reported: reported.to_string(),
                    })
                    .await;
                Reconciled::new(
                    outcome,
                    format!("recorded {}, provider reported {}", recorded, reported),
                )
            }
            WebhookOutcome::Stale => {
                info!(external_id, %recorded, %reported, "out-of-order update ignored");
                Reconciled::new(
                    outcome,
                    format!("recorded {} is final; ignored {}", recorded, reported),
                )
            }
            _ => Reconciled::new(outcome, format!("already {}", recorded)),
        }
    }

    /// Writes the inbox row, reusing the row of a previously failed attempt.
    async fn record(
        &self,
        provider: PaymentProvider,
        prior: Option<webhook_event::Model>,
        event: &ProviderEvent,
        outcome: WebhookOutcome,
        detail: Option<String>,
        payload: Option<serde_json::Value>,
    ) {
        let external_id = event.target.as_ref().map(|t| t.external_id().to_string());
        let result = match prior {
            Some(prior) => {
                let mut row: webhook_event::ActiveModel = prior.into();
                row.event_type = Set(event.event_type.clone());
                row.external_id = Set(external_id);
                row.outcome = Set(outcome);
                row.detail = Set(detail);
                row.payload = Set(payload);
                row.received_at = Set(Utc::now());
                row.update(&*self.db).await.map(|_| ())
            }
            None => webhook_event::ActiveModel {
                id: Set(Uuid::new_v4()),
                provider: Set(provider),
                event_id: Set(event.event_id.clone()),
                event_type: Set(event.event_type.clone()),
                external_id: Set(external_id),
                outcome: Set(outcome),
                detail: Set(detail),
                payload: Set(payload),
                received_at: Set(Utc::now()),
            }
            .insert(&*self.db)
            .await
            .map(|_| ()),
        };

        if let Err(e) = result {
            error!(
                %provider,
                event_id = ?event.event_id,
                %outcome,
                error = %e,
                "failed to record webhook event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_status_is_duplicate() {
        assert_eq!(
            classify(PaymentStatus::Succeeded, PaymentStatus::Succeeded),
            Some(WebhookOutcome::Duplicate)
        );
        assert_eq!(
            classify(PaymentStatus::Processing, PaymentStatus::Processing),
            Some(WebhookOutcome::Duplicate)
        );
    }

    #[test]
    fn contradicting_terminal_states_conflict() {
        assert_eq!(
            classify(PaymentStatus::Succeeded, PaymentStatus::Failed),
            Some(WebhookOutcome::Conflict)
        );
        assert_eq!(
            classify(RefundStatus::Failed, RefundStatus::Succeeded),
            Some(WebhookOutcome::Conflict)
        );
    }

    #[test]
    fn late_non_terminal_update_is_stale() {
        assert_eq!(
            classify(PaymentStatus::Succeeded, PaymentStatus::Processing),
            Some(WebhookOutcome::Stale)
        );
        assert_eq!(
            classify(RefundStatus::Succeeded, RefundStatus::Pending),
            Some(WebhookOutcome::Stale)
        );
    }

    #[test]
    fn open_records_accept_updates() {
        assert_eq!(classify(PaymentStatus::Pending, PaymentStatus::Succeeded), None);
        assert_eq!(
            classify(PaymentStatus::RequiresAction, PaymentStatus::Processing),
            None
        );
        assert_eq!(classify(RefundStatus::Pending, RefundStatus::Failed), None);
    }
}
