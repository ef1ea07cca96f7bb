//! Recharge entity - One attempt to buy points through the payment gateway.
//!
//! `charge_ref` is our idempotency key: the status column moves out of an open state at
//! most once, and only the transition to `succeeded` writes a ledger credit.

use crate::models::RechargeStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Recharge database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "recharges")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Our reference for the charge, unique, sent to the gateway as the order id
    #[sea_orm(unique)]
    pub charge_ref: String,
    /// Payment id assigned by the gateway; `None` while degraded
    pub gateway_charge_id: Option<String>,
    /// Account to credit
    pub account_id: i64,
    /// Money amount in currency units
    pub amount: f64,
    /// Points credited, set on success
    pub points: Option<i64>,
    /// See [`RechargeStatus`]
    pub status: String,
    /// True when the gateway was unreachable and the charge awaits manual confirmation
    pub degraded: bool,
    /// Opaque QR/payment link returned by the gateway
    pub payment_url: Option<String>,
    /// When the attempt started
    pub created_at: DateTimeUtc,
    /// When the status last changed
    pub updated_at: DateTimeUtc,
    /// When the attempt reached a closed state
    pub completed_at: Option<DateTimeUtc>,
}

impl Model {
    /// Parsed status.
    pub fn status(&self) -> crate::errors::Result<RechargeStatus> {
        RechargeStatus::try_from(self.status.as_str())
    }
}

/// Defines relationships between Recharge and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each recharge belongs to one account
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
