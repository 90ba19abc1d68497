use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_address::{self, AddressKind},
        order_item,
        order_status_history::{self, Entity as HistoryEntity},
    },
    errors::ServiceError,
    services::order_lifecycle::load_order,
    PaginatedResponse,
};

const SHIPPED_DELIVERY_DAYS: i64 = 5;
const UNSHIPPED_DELIVERY_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddressResponse {
    pub kind: AddressKind,
    pub name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    pub country: String,
    pub phone: Option<String>,
}

impl From<order_address::Model> for AddressResponse {
    fn from(a: order_address::Model) -> Self {
        Self {
            kind: a.kind,
            name: a.name,
            line1: a.line1,
            line2: a.line2,
            city: a.city,
            region: a.region,
            postal_code: a.postal_code,
            country: a.country,
            phone: a.phone,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub sku: String,
    pub name: String,
    pub image_url: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(i: order_item::Model) -> Self {
        Self {
            id: i.id,
            product_id: i.product_id,
            variant_id: i.variant_id,
            sku: i.sku,
            name: i.name,
            image_url: i.image_url,
            quantity: i.quantity,
            unit_price: i.unit_price,
            total_price: i.total_price,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusHistoryEntry {
    pub sequence: i32,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub note: Option<String>,
    pub actor_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<order_status_history::Model> for StatusHistoryEntry {
    fn from(h: order_status_history::Model) -> Self {
        Self {
            sequence: h.sequence,
            from_status: h.from_status,
            to_status: h.to_status,
            note: h.note,
            actor_id: h.actor_id,
            created_at: h.created_at,
        }
    }
}

/// Order header without line items, used in listings
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub currency: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
    pub notes: Option<String>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderModel> for OrderSummary {
    fn from(o: OrderModel) -> Self {
        Self {
            id: o.id,
            order_number: o.order_number,
            customer_id: o.customer_id,
            status: o.status,
            currency: o.currency,
            subtotal: o.subtotal,
            tax_amount: o.tax_amount,
            shipping_amount: o.shipping_amount,
            total_amount: o.total_amount,
            notes: o.notes,
            tracking_number: o.tracking_number,
            carrier: o.carrier,
            shipped_at: o.shipped_at,
            delivered_at: o.delivered_at,
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: OrderSummary,
    pub items: Vec<OrderItemResponse>,
    pub shipping_address: Option<AddressResponse>,
    pub billing_address: Option<AddressResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TrackingInfo {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub estimated_delivery: DateTime<Utc>,
    pub history: Vec<StatusHistoryEntry>,
}

/// Listing filters. `customer_id = None` lists across all customers (admin).
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

/// Ship date + 5 days once shipped, otherwise order date + 7 days.
pub fn estimate_delivery(order: &OrderModel) -> DateTime<Utc> {
    match order.shipped_at {
        Some(shipped_at) => shipped_at + Duration::days(SHIPPED_DELIVERY_DAYS),
        None => order.created_at + Duration::days(UNSHIPPED_DELIVERY_DAYS),
    }
}

/// Read side of the order store
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Loads an order with its items and address snapshots.
    /// When `customer_id` is given, the order must belong to that customer.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db;
        let order = self.owned_order(order_id, customer_id).await?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to fetch order items");
                ServiceError::DatabaseError(e)
            })?;

        let address_ids: Vec<Uuid> = [order.shipping_address_id, order.billing_address_id]
            .into_iter()
            .flatten()
            .collect();
        let addresses = if address_ids.is_empty() {
            Vec::new()
        } else {
            order_address::Entity::find()
                .filter(order_address::Column::Id.is_in(address_ids))
                .all(db)
                .await?
        };
        let find_address = |id: Option<Uuid>| {
            id.and_then(|id| addresses.iter().find(|a| a.id == id))
                .cloned()
                .map(AddressResponse::from)
        };

        Ok(OrderResponse {
            shipping_address: find_address(order.shipping_address_id),
            billing_address: find_address(order.billing_address_id),
            items: items.into_iter().map(OrderItemResponse::from).collect(),
            order: order.into(),
        })
    }

    /// Lists orders newest first
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        filter: OrderFilter,
        page: u64,
        limit: u64,
    ) -> Result<PaginatedResponse<OrderSummary>, ServiceError> {
        let db = &*self.db;
        let page = page.max(1);
        let limit = limit.clamp(1, 100);

        let mut condition = Condition::all();
        if let Some(customer_id) = filter.customer_id {
            condition = condition.add(order::Column::CustomerId.eq(customer_id));
        }
        if let Some(status) = filter.status {
            condition = condition.add(order::Column::Status.eq(status));
        }
        if let Some(from) = filter.from {
            condition = condition.add(order::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.to {
            condition = condition.add(order::Column::CreatedAt.lte(to));
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            condition = condition.add(
                Condition::any()
                    .add(order::Column::OrderNumber.contains(search))
                    .add(order::Column::Notes.contains(search)),
            );
        }

        let paginator = OrderEntity::find()
            .filter(condition)
            .order_by_desc(order::Column::CreatedAt)
            .paginate(db, limit);

        let total = paginator.num_items().await.map_err(|e| {
            error!(error = %e, "Failed to count orders");
            ServiceError::DatabaseError(e)
        })?;

        let orders = paginator.fetch_page(page - 1).await.map_err(|e| {
            error!(error = %e, page = page, limit = limit, "Failed to fetch orders page");
            ServiceError::DatabaseError(e)
        })?;

        info!(
            total = total,
            page = page,
            limit = limit,
            returned_count = orders.len(),
            "Orders listed successfully"
        );

        Ok(PaginatedResponse {
            items: orders.into_iter().map(OrderSummary::from).collect(),
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit),
        })
    }

    /// Current status, full history and an estimated delivery date
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn tracking(
        &self,
        order_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<TrackingInfo, ServiceError> {
        let order = self.owned_order(order_id, customer_id).await?;
        let history = HistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order.id))
            .order_by_asc(order_status_history::Column::Sequence)
            .all(&*self.db)
            .await?;

        Ok(TrackingInfo {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            carrier: order.carrier.clone(),
            tracking_number: order.tracking_number.clone(),
            shipped_at: order.shipped_at,
            delivered_at: order.delivered_at,
            estimated_delivery: estimate_delivery(&order),
            history: history.into_iter().map(StatusHistoryEntry::from).collect(),
        })
    }

    async fn owned_order(
        &self,
        order_id: Uuid,
        customer_id: Option<Uuid>,
    ) -> Result<OrderModel, ServiceError> {
        let order = load_order(&*self.db, order_id).await?;
        if let Some(customer_id) = customer_id {
            if order.customer_id != customer_id {
                return Err(ServiceError::Unauthorized(format!(
                    "Order {} does not belong to the caller",
                    order_id
                )));
            }
        }
        Ok(order)
    }
}
