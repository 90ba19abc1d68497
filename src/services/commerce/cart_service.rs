use crate::{
    entities::commerce::{cart, cart_item, Cart, CartItem, CartModel, ProductModel},
    errors::ServiceError,
    services::commerce::catalog::products_by_id,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// One line of a cart as checkout sees it
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub item_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Point-in-time view of a customer's cart
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartSnapshot {
    pub cart_id: Option<Uuid>,
    pub customer_id: Uuid,
    pub currency: String,
    pub items: Vec<CartLine>,
    pub subtotal: Decimal,
}

impl CartSnapshot {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn build(customer_id: Uuid, cart: Option<&CartModel>, items: Vec<cart_item::Model>, currency: &str) -> Self {
        let items: Vec<CartLine> = items
            .into_iter()
            .map(|i| CartLine {
                item_id: i.id,
                product_id: i.product_id,
                variant_id: i.variant_id,
                quantity: i.quantity,
                unit_price: i.unit_price,
            })
            .collect();
        let subtotal = items.iter().map(CartLine::line_total).sum();
        Self {
            cart_id: cart.map(|c| c.id),
            customer_id,
            currency: cart.map(|c| c.currency.clone()).unwrap_or_else(|| currency.to_string()),
            items,
            subtotal,
        }
    }
}

/// Input for adding an item to the caller's cart
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct AddToCartInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

/// Reads the customer's cart inside the caller's connection or transaction.
pub async fn load_cart_snapshot(
    conn: &impl ConnectionTrait,
    customer_id: Uuid,
    default_currency: &str,
) -> Result<CartSnapshot, ServiceError> {
    let cart = Cart::find()
        .filter(cart::Column::CustomerId.eq(customer_id))
        .one(conn)
        .await?;

    let items = match &cart {
        Some(cart) => {
            CartItem::find()
                .filter(cart_item::Column::CartId.eq(cart.id))
                .order_by_asc(cart_item::Column::CreatedAt)
                .all(conn)
                .await?
        }
        None => Vec::new(),
    };

    Ok(CartSnapshot::build(customer_id, cart.as_ref(), items, default_currency))
}

/// Deletes the cart and its lines.
pub async fn delete_cart(conn: &impl ConnectionTrait, cart_id: Uuid) -> Result<(), ServiceError> {
    CartItem::delete_many()
        .filter(cart_item::Column::CartId.eq(cart_id))
        .exec(conn)
        .await?;
    Cart::delete_by_id(cart_id).exec(conn).await?;
    Ok(())
}

/// Adds `quantity` of `product` at its current catalog price, merging into an
/// existing line for the same product and variant.
pub async fn add_line(
    conn: &impl ConnectionTrait,
    customer_id: Uuid,
    product: &ProductModel,
    variant_id: Option<Uuid>,
    quantity: i32,
    default_currency: &str,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let cart = match Cart::find()
        .filter(cart::Column::CustomerId.eq(customer_id))
        .one(conn)
        .await?
    {
        Some(cart) => cart,
        None => {
            cart::ActiveModel {
                id: Set(Uuid::new_v4()),
                customer_id: Set(customer_id),
                currency: Set(default_currency.to_string()),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await?
        }
    };

    let mut existing = CartItem::find()
        .filter(cart_item::Column::CartId.eq(cart.id))
        .filter(cart_item::Column::ProductId.eq(product.id));
    existing = match variant_id {
        Some(variant_id) => existing.filter(cart_item::Column::VariantId.eq(variant_id)),
        None => existing.filter(cart_item::Column::VariantId.is_null()),
    };

    if let Some(item) = existing.one(conn).await? {
        let current_quantity = item.quantity;
        let mut item: cart_item::ActiveModel = item.into();
        item.quantity = Set(current_quantity + quantity);
        item.unit_price = Set(product.price);
        item.updated_at = Set(now);
        item.update(conn).await?;
    } else {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(product.id),
            variant_id: Set(variant_id),
            quantity: Set(quantity),
            unit_price: Set(product.price),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await?;
    }

    let mut cart: cart::ActiveModel = cart.into();
    cart.updated_at = Set(now);
    cart.update(conn).await?;
    Ok(())
}

/// Shopping cart collaborator: one cart per customer
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    default_currency: String,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>, default_currency: impl Into<String>) -> Self {
        Self {
            db,
            default_currency: default_currency.into(),
        }
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    pub async fn get_cart(&self, customer_id: Uuid) -> Result<CartSnapshot, ServiceError> {
        load_cart_snapshot(&*self.db, customer_id, &self.default_currency).await
    }

    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        customer_id: Uuid,
        input: AddToCartInput,
    ) -> Result<CartSnapshot, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;

        let product = products_by_id(&txn, vec![input.product_id])
            .await?
            .remove(&input.product_id)
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", input.product_id))
            })?;

        add_line(
            &txn,
            customer_id,
            &product,
            input.variant_id,
            input.quantity,
            &self.default_currency,
        )
        .await?;
        let snapshot = load_cart_snapshot(&txn, customer_id, &self.default_currency).await?;
        txn.commit().await?;

        info!(
            "Added item to cart for customer {}: product {} x{}",
            customer_id, input.product_id, input.quantity
        );
        Ok(snapshot)
    }

    pub async fn clear_cart(&self, customer_id: Uuid) -> Result<(), ServiceError> {
        let snapshot = self.get_cart(customer_id).await?;
        if let Some(cart_id) = snapshot.cart_id {
            let txn = self.db.begin().await?;
            delete_cart(&txn, cart_id).await?;
            txn.commit().await?;
            info!("Cleared cart: {}", cart_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn snapshot_subtotal_sums_line_totals() {
        let customer_id = Uuid::new_v4();
        let now = Utc::now();
        let items = vec![
            cart_item::Model {
                id: Uuid::new_v4(),
                cart_id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                variant_id: None,
                quantity: 2,
                unit_price: dec!(25.00),
                created_at: now,
                updated_at: now,
            },
            cart_item::Model {
                id: Uuid::new_v4(),
                cart_id: Uuid::new_v4(),
                product_id: Uuid::new_v4(),
                variant_id: None,
                quantity: 1,
                unit_price: dec!(4.50),
                created_at: now,
                updated_at: now,
            },
        ];

        let snapshot = CartSnapshot::build(customer_id, None, items, "USD");
        assert_eq!(snapshot.subtotal, dec!(54.50));
        assert_eq!(snapshot.currency, "USD");
        assert!(snapshot.cart_id.is_none());
    }
}
