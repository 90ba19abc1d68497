use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::commerce::{product, Product, ProductModel},
    errors::ServiceError,
};

/// Input for registering a catalog product
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CreateProductInput {
    #[validate(length(min = 1, max = 64))]
    pub sku: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub price: Decimal,
    #[validate(range(min = 0))]
    pub stock_quantity: i32,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProductView {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub stock_quantity: i32,
    pub image_url: Option<String>,
    pub is_active: bool,
}

impl From<ProductModel> for ProductView {
    fn from(p: ProductModel) -> Self {
        Self {
            id: p.id,
            sku: p.sku,
            name: p.name,
            price: p.price,
            stock_quantity: p.stock_quantity,
            image_url: p.image_url,
            is_active: p.is_active,
        }
    }
}

/// Catalog and stock reader used by checkout and reorder
#[derive(Clone)]
pub struct CatalogService {
    db: Arc<DatabaseConnection>,
}

impl CatalogService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductModel, ServiceError> {
        Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
    }

    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn create_product(
        &self,
        input: CreateProductInput,
    ) -> Result<ProductModel, ServiceError> {
        input.validate()?;
        if input.price.is_sign_negative() {
            return Err(ServiceError::ValidationError(
                "price must not be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(input.sku),
            name: Set(input.name),
            price: Set(input.price),
            stock_quantity: Set(input.stock_quantity),
            image_url: Set(input.image_url),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(product_id = %product.id, "product created");
        Ok(product)
    }

    /// Changes the live price. Existing order items keep their snapshot.
    pub async fn update_price(
        &self,
        product_id: Uuid,
        price: Decimal,
    ) -> Result<ProductModel, ServiceError> {
        let mut active: product::ActiveModel = self.get_product(product_id).await?.into();
        active.price = Set(price);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }
}

/// Loads the given products keyed by id. Missing ids are simply absent.
pub async fn products_by_id(
    conn: &impl ConnectionTrait,
    ids: Vec<Uuid>,
) -> Result<HashMap<Uuid, ProductModel>, ServiceError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let products = Product::find()
        .filter(product::Column::Id.is_in(ids))
        .all(conn)
        .await?;
    Ok(products.into_iter().map(|p| (p.id, p)).collect())
}
