//! Account entity - Represents a registered user of the store.
//!
//! Holds credentials, the denormalized point balance (always equal to the sum of the
//! account's ledger entries), privilege tier and the invite code consumed at registration.

use crate::models::PrivilegeTier;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Account database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    /// Unique identifier for the account
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Login name, unique
    #[sea_orm(unique)]
    pub username: String,
    /// Contact email, unique
    #[sea_orm(unique)]
    pub email: String,
    /// Argon2 PHC string (algorithm, parameters, salt and hash)
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Current point balance, never negative
    pub balance: i64,
    /// `"normal"`, `"vip"` or `"admin"`
    pub privilege_tier: String,
    /// Banned accounts cannot log in or recharge
    pub is_banned: bool,
    /// Invite code redeemed during registration, if any
    pub invite_code_used: Option<String>,
    /// When the account was created
    pub created_at: DateTimeUtc,
    /// When the account was last modified
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Parsed privilege tier.
    pub fn tier(&self) -> crate::errors::Result<PrivilegeTier> {
        PrivilegeTier::try_from(self.privilege_tier.as_str())
    }
}

/// Defines relationships between Account and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One account has many cart lines
    #[sea_orm(has_many = "super::cart_line::Entity")]
    CartLines,
    /// One account has many orders
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
    /// One account has many ledger entries
    #[sea_orm(has_many = "super::ledger_entry::Entity")]
    LedgerEntries,
    /// One account has many recharge attempts
    #[sea_orm(has_many = "super::recharge::Entity")]
    Recharges,
}

impl Related<super::cart_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartLines.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl Related<super::ledger_entry::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LedgerEntries.def()
    }
}

impl Related<super::recharge::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Recharges.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
