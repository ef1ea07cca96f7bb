//! Order entity - Immutable record of one checkout.
//!
//! `items` holds a JSON array of [`OrderItem`] snapshots captured at checkout time. It is
//! never re-derived from live product rows; use [`Model::items`] to read it back validated.

use crate::models::{OrderItem, OrderStatus, decode_order_items};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Order database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    /// Unique identifier for the order
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Purchasing account
    pub account_id: i64,
    /// Total points debited at checkout
    pub total_price: i64,
    /// `"pending"`, `"completed"` or `"cancelled"`
    pub status: String,
    /// Serialized line snapshot
    #[sea_orm(column_type = "Text")]
    pub items: String,
    /// When the order was created
    pub created_at: DateTimeUtc,
    /// When the status last changed
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Decoded and validated line snapshot.
    pub fn items(&self) -> crate::errors::Result<Vec<OrderItem>> {
        decode_order_items(self.id, &self.items)
    }

    /// Parsed order status.
    pub fn status(&self) -> crate::errors::Result<OrderStatus> {
        OrderStatus::try_from(self.status.as_str())
    }
}

/// Defines relationships between Order and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each order belongs to one account
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
