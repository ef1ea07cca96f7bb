//! Invite code entity - Single-use token granting a privilege tier at registration.

use crate::models::PrivilegeTier;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Invite code database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invite_codes")]
pub struct Model {
    /// Unique identifier
    #[sea_orm(primary_key)]
    pub id: i64,
    /// The code users type in, unique
    #[sea_orm(unique)]
    pub code: String,
    /// Tier granted on redemption
    pub privilege_tier: String,
    /// Flips to true exactly once
    pub is_used: bool,
    /// Account that redeemed the code
    pub used_by_account_id: Option<i64>,
    /// When the code was generated
    pub created_at: DateTimeUtc,
    /// When the code was redeemed
    pub used_at: Option<DateTimeUtc>,
}

impl Model {
    /// Parsed tier bound to this code.
    pub fn tier(&self) -> crate::errors::Result<PrivilegeTier> {
        PrivilegeTier::try_from(self.privilege_tier.as_str())
    }
}

/// Invite codes have no foreign keys; redemption history survives account wipes.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
