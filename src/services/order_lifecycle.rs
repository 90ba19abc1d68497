use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait,
    ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_status_history::{self, Entity as HistoryEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Result of a committed-or-pending transition, carrying what the caller
/// needs to publish the change once its transaction commits.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub order: OrderModel,
    pub from: OrderStatus,
}

impl AppliedTransition {
    pub fn event(&self) -> Event {
        Event::OrderStatusChanged {
            order_id: self.order.id,
            customer_id: self.order.customer_id,
            order_number: self.order.order_number.clone(),
            from: self.from,
            to: self.order.status,
        }
    }
}

/// Checks the transition table, then moves `snapshot` to `target` with a
/// version-guarded update and appends the matching history entry.
///
/// `snapshot` must be the row as the caller last read it. If another writer
/// has moved the order since, no row matches the guard and the call fails
/// with `ConcurrentModification` without writing anything.
pub async fn apply_transition<C: ConnectionTrait>(
    conn: &C,
    snapshot: &OrderModel,
    target: OrderStatus,
    note: Option<String>,
    actor_id: Option<Uuid>,
) -> Result<AppliedTransition, ServiceError> {
    let from = snapshot.status;
    if !from.can_transition_to(target) {
        warn!(order_id = %snapshot.id, %from, to = %target, "rejected order transition");
        return Err(ServiceError::InvalidTransition { from, to: target });
    }

    let now = Utc::now();
    let next_version = snapshot.version + 1;

    let mut update = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(target.to_value()))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(now));

    match target {
        OrderStatus::Shipped => {
            update = update.col_expr(order::Column::ShippedAt, Expr::value(now));
        }
        OrderStatus::Delivered => {
            update = update.col_expr(order::Column::DeliveredAt, Expr::value(now));
        }
        _ => {}
    }

    let result = update
        .filter(order::Column::Id.eq(snapshot.id))
        .filter(order::Column::Version.eq(snapshot.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(order_id = %snapshot.id, version = snapshot.version, "order changed concurrently");
        return Err(ServiceError::ConcurrentModification(snapshot.id));
    }

    order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(snapshot.id),
        sequence: Set(next_version),
        from_status: Set(Some(from)),
        to_status: Set(target),
        note: Set(note),
        actor_id: Set(actor_id),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;
    counter!("orderline.orders.transitions", 1, "to" => target.as_str());

    let mut order = snapshot.clone();
    order.status = target;
    order.version = next_version;
    order.updated_at = now;
    match target {
        OrderStatus::Shipped => order.shipped_at = Some(now),
        OrderStatus::Delivered => order.delivered_at = Some(now),
        _ => {}
    }

    Ok(AppliedTransition { order, from })
}

/// History entry written alongside a freshly inserted `Pending` order.
pub(crate) fn initial_history_entry(
    order_id: Uuid,
    actor_id: Option<Uuid>,
) -> order_status_history::ActiveModel {
    order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        sequence: Set(1),
        from_status: Set(None),
        to_status: Set(OrderStatus::Pending),
        note: Set(Some("Order created".to_string())),
        actor_id: Set(actor_id),
        created_at: Set(Utc::now()),
    }
}

/// Single writer of `orders.status`.
#[derive(Clone)]
pub struct OrderLifecycleService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderLifecycleService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Moves an order to `target` if the transition table allows it.
    #[instrument(skip(self, note), fields(order_id = %order_id, target = %target))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        note: Option<String>,
        actor_id: Option<Uuid>,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let current = load_order(&txn, order_id).await?;
        let applied = apply_transition(&txn, &current, target, note, actor_id).await?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit transaction for order {}: {}", order_id, e);
            ServiceError::DatabaseError(e)
        })?;

        info!(
            "Order {} status updated from '{}' to '{}'",
            order_id, applied.from, target
        );
        self.event_sender.send_or_log(applied.event()).await;

        Ok(applied.order)
    }

    /// True only when `actor_id` owns the order and it has not shipped yet.
    #[instrument(skip(self))]
    pub async fn can_cancel(&self, order_id: Uuid, actor_id: Uuid) -> Result<bool, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        Ok(order.customer_id == actor_id && order.status.is_customer_cancellable())
    }

    /// Customer cancellation: ownership and cancellation-window checks, then
    /// the regular transition.
    #[instrument(skip(self, reason))]
    pub async fn cancel_by_customer(
        &self,
        order_id: Uuid,
        customer_id: Uuid,
        reason: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        if order.customer_id != customer_id {
            return Err(ServiceError::Unauthorized(format!(
                "Order {} does not belong to the caller",
                order_id
            )));
        }
        if !order.status.is_customer_cancellable() {
            return Err(ServiceError::InvalidTransition {
                from: order.status,
                to: OrderStatus::Cancelled,
            });
        }

        let note = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "Cancelled by customer".to_string());
        self.transition(
            order_id,
            OrderStatus::Cancelled,
            Some(note),
            Some(customer_id),
        )
        .await
    }

    /// Administrative status change. Skips ownership, never the transition table.
    pub async fn admin_transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        note: Option<String>,
        admin_id: Uuid,
    ) -> Result<OrderModel, ServiceError> {
        self.transition(order_id, target, note, Some(admin_id)).await
    }

    /// Status history in the order it was written.
    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        load_order(&*self.db, order_id).await?;
        Ok(HistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::Sequence)
            .all(&*self.db)
            .await?)
    }

    /// Records shipment tracking details. Does not touch status.
    #[instrument(skip(self))]
    pub async fn set_tracking(
        &self,
        order_id: Uuid,
        carrier: String,
        tracking_number: String,
    ) -> Result<OrderModel, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        let mut active: order::ActiveModel = order.into();
        active.carrier = Set(Some(carrier));
        active.tracking_number = Set(Some(tracking_number));
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;
        info!(%order_id, "tracking details recorded");
        Ok(updated)
    }
}

pub(crate) async fn load_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderModel, ServiceError> {
    OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}
