//! Ledger entry entity - Append-only record of one balance change.
//!
//! Entries are never updated or deleted except when an administrator wipes the whole
//! account. The account balance must always equal the sum of its entries' `amount`.
use crate::models::EntryKind;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ledger entry database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    /// Unique identifier for the entry
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Account whose balance changed
    pub account_id: i64,
    /// Signed change in points (positive for credits, negative for debits)
    pub amount: i64,
    /// `"recharge"`, `"purchase"` or `"refund"`
    pub kind: String,
    /// Human-readable description
    pub description: String,
    /// Order id or charge reference for reconciliation
    pub reference: Option<String>,
    /// When the entry was written
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Parsed entry kind.
    pub fn kind(&self) -> crate::errors::Result<EntryKind> {
        EntryKind::try_from(self.kind.as_str())
    }
}

/// Defines relationships between `LedgerEntry` and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each entry belongs to one account
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
