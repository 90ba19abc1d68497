use crate::{
    entities::{
        order::{self, OrderStatus},
        order_address::{self, AddressKind},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        commerce::{
            cart_service::{add_line, delete_cart, load_cart_snapshot, CartSnapshot},
            catalog::products_by_id,
        },
        order_lifecycle::{initial_history_entry, load_order},
        orders::{OrderResponse, OrderService},
    },
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

const ORDER_NUMBER_SUFFIX_LEN: usize = 6;
const ORDER_NUMBER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AddressInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[validate(length(max = 255))]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub city: String,
    #[validate(length(max = 128))]
    pub region: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 3))]
    pub country: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    #[validate]
    pub shipping_address: AddressInput,
    /// Defaults to the shipping address
    pub billing_address: Option<AddressInput>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    /// Defaults to the cart's currency
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

/// Order totals. `total = subtotal + tax + shipping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub shipping: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    pub fn compute(subtotal: Decimal, tax_rate: Decimal, shipping: Decimal) -> Self {
        let tax = (subtotal * tax_rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        Self {
            subtotal,
            tax,
            shipping,
            total: subtotal + tax + shipping,
        }
    }
}

/// Settings the orchestrator reads from configuration
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub order_number_prefix: String,
    pub default_currency: String,
    pub tax_rate: Decimal,
    pub flat_shipping_rate: Decimal,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            order_number_prefix: "ORD".to_string(),
            default_currency: "USD".to_string(),
            tax_rate: Decimal::ZERO,
            flat_shipping_rate: Decimal::ZERO,
        }
    }
}

/// `{prefix}-{yyyymmddHHMMSS}-{6 random uppercase alphanumerics}`
pub fn generate_order_number(prefix: &str, at: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ORDER_NUMBER_SUFFIX_LEN)
        .map(|_| ORDER_NUMBER_CHARSET[rng.gen_range(0..ORDER_NUMBER_CHARSET.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, at.format("%Y%m%d%H%M%S"), suffix)
}

/// Converts a customer's cart into an order
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    order_service: Arc<OrderService>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        order_service: Arc<OrderService>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            order_service,
            settings,
        }
    }

    /// Creates a `Pending` order from the customer's cart.
    ///
    /// Address snapshots, the order, its items, the initial history entry and
    /// the cart deletion commit together or not at all.
    #[instrument(skip(self, request), fields(customer_id = %customer_id))]
    pub async fn create_order(
        &self,
        customer_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        if let Some(billing) = &request.billing_address {
            billing.validate()?;
        }

        let txn = self.db.begin().await.map_err(|e| {
            error!("Failed to begin checkout transaction: {}", e);
            ServiceError::DatabaseError(e)
        })?;

        let cart =
            load_cart_snapshot(&txn, customer_id, &self.settings.default_currency).await?;
        let cart_id = match cart.cart_id {
            Some(cart_id) if !cart.is_empty() => cart_id,
            _ => return Err(ServiceError::EmptyCart),
        };

        let products =
            products_by_id(&txn, cart.items.iter().map(|line| line.product_id).collect()).await?;
        // Variants share the product's stock, so lines are summed per product.
        let mut requested: HashMap<Uuid, i32> = HashMap::new();
        for line in &cart.items {
            *requested.entry(line.product_id).or_insert(0) += line.quantity;
        }
        for (product_id, quantity) in &requested {
            let product = products
                .get(product_id)
                .filter(|p| p.is_active)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Product {} is no longer available",
                        product_id
                    ))
                })?;
            if *quantity > product.stock_quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "{}: requested {}, available {}",
                    product.sku, quantity, product.stock_quantity
                )));
            }
        }

        let totals = OrderTotals::compute(
            cart.subtotal,
            self.settings.tax_rate,
            self.settings.flat_shipping_rate,
        );
        let currency = request
            .currency
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| cart.currency.clone());
        let now = Utc::now();

        let shipping_address = insert_address(
            &txn,
            AddressKind::Shipping,
            &request.shipping_address,
        )
        .await?;
        let billing_address = insert_address(
            &txn,
            AddressKind::Billing,
            request
                .billing_address
                .as_ref()
                .unwrap_or(&request.shipping_address),
        )
        .await?;

        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(
                &self.settings.order_number_prefix,
                now,
            )),
            customer_id: Set(customer_id),
            status: Set(OrderStatus::Pending),
            currency: Set(currency.clone()),
            subtotal: Set(totals.subtotal),
            tax_amount: Set(totals.tax),
            shipping_amount: Set(totals.shipping),
            total_amount: Set(totals.total),
            shipping_address_id: Set(Some(shipping_address.id)),
            billing_address_id: Set(Some(billing_address.id)),
            notes: Set(request.notes),
            tracking_number: Set(None),
            carrier: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await?;

        for line in &cart.items {
            // Presence was checked above; a missing product here means the
            // catalog changed under the transaction.
            let product = products.get(&line.product_id).ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Product {} is no longer available",
                    line.product_id
                ))
            })?;
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                variant_id: Set(line.variant_id),
                sku: Set(product.sku.clone()),
                name: Set(product.name.clone()),
                image_url: Set(product.image_url.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                total_price: Set(line.line_total()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        initial_history_entry(order_id, Some(customer_id))
            .insert(&txn)
            .await?;
        delete_cart(&txn, cart_id).await?;

        txn.commit().await.map_err(|e| {
            error!("Failed to commit checkout for customer {}: {}", customer_id, e);
            ServiceError::DatabaseError(e)
        })?;

        info!(
            order_id = %order_id,
            order_number = %order.order_number,
            total = %totals.total,
            "Checkout completed: order created from cart {}",
            cart_id
        );

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id,
                customer_id,
                order_number: order.order_number.clone(),
                total_amount: totals.total,
                currency,
            })
            .await;

        self.order_service.get_order(order_id, Some(customer_id)).await
    }

    /// Re-adds every item of a past order to the customer's cart at today's
    /// catalog price. Products that no longer exist are skipped.
    #[instrument(skip(self))]
    pub async fn reorder(
        &self,
        order_id: Uuid,
        customer_id: Uuid,
    ) -> Result<CartSnapshot, ServiceError> {
        let txn = self.db.begin().await?;

        let order = load_order(&txn, order_id).await?;
        if order.customer_id != customer_id {
            return Err(ServiceError::Unauthorized(format!(
                "Order {} does not belong to the caller",
                order_id
            )));
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        let products =
            products_by_id(&txn, items.iter().map(|item| item.product_id).collect()).await?;

        let mut added = 0usize;
        for item in &items {
            match products.get(&item.product_id).filter(|p| p.is_active) {
                Some(product) => {
                    add_line(
                        &txn,
                        customer_id,
                        product,
                        item.variant_id,
                        item.quantity,
                        &self.settings.default_currency,
                    )
                    .await?;
                    added += 1;
                }
                None => warn!(
                    order_id = %order_id,
                    product_id = %item.product_id,
                    sku = %item.sku,
                    "skipping reorder of unavailable product"
                ),
            }
        }

        let snapshot =
            load_cart_snapshot(&txn, customer_id, &self.settings.default_currency).await?;
        txn.commit().await?;

        info!(order_id = %order_id, added, skipped = items.len() - added, "reorder completed");
        Ok(snapshot)
    }
}

async fn insert_address(
    conn: &impl ConnectionTrait,
    kind: AddressKind,
    input: &AddressInput,
) -> Result<order_address::Model, ServiceError> {
    Ok(order_address::ActiveModel {
        id: Set(Uuid::new_v4()),
        kind: Set(kind),
        name: Set(input.name.clone()),
        line1: Set(input.line1.clone()),
        line2: Set(input.line2.clone()),
        city: Set(input.city.clone()),
        region: Set(input.region.clone()),
        postal_code: Set(input.postal_code.clone()),
        country: Set(input.country.to_ascii_uppercase()),
        phone: Set(input.phone.clone()),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?)
}
