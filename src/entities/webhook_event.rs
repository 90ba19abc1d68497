use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use super::payment::PaymentProvider;

/// Inbox of every authenticated webhook delivery and what became of it.
/// Rows with outcome `conflict` form the manual review queue.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub provider: PaymentProvider,
    pub event_id: Option<String>,
    pub event_type: String,
    pub external_id: Option<String>,
    pub outcome: WebhookOutcome,
    pub detail: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payload: Option<Json>,
    pub received_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    #[sea_orm(string_value = "applied")]
    Applied,
    #[sea_orm(string_value = "duplicate")]
    Duplicate,
    #[sea_orm(string_value = "stale")]
    Stale,
    #[sea_orm(string_value = "conflict")]
    Conflict,
    #[sea_orm(string_value = "unknown_entity")]
    UnknownEntity,
    #[sea_orm(string_value = "ignored")]
    Ignored,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Conflict => "conflict",
            WebhookOutcome::UnknownEntity => "unknown_entity",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Failed => "failed",
        }
    }

    /// Deliveries that left no trace locally may be redelivered and applied.
    pub fn is_retryable(self) -> bool {
        matches!(self, WebhookOutcome::Failed | WebhookOutcome::UnknownEntity)
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
