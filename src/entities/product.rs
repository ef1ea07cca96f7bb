//! Product entity - Represents a catalog item purchasable with points.
//!
//! Stock is authoritative only at checkout; carts stage quantities optimistically.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Product database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Unique identifier for the product
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Name of the product (e.g., "AK-47 Redline"), unique
    #[sea_orm(unique)]
    pub name: String,
    /// Optional long description
    pub description: Option<String>,
    /// Price per unit in points, always positive
    pub price: i64,
    /// Units on hand, never negative
    pub stock: i32,
    /// Catalog category (e.g., "skin", "model", "privilege")
    pub category: String,
    /// Inactive products cannot be added to carts or checked out
    pub is_active: bool,
    /// When the product was created
    pub created_at: DateTimeUtc,
    /// When the product was last modified
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Product and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One product appears in many cart lines
    #[sea_orm(has_many = "super::cart_line::Entity")]
    CartLines,
}

impl Related<super::cart_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartLines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
