//! Invite code business logic - Single-use codes that grant a privilege tier at signup.
//!
//! Redemption is a single conditional update (`... WHERE code = ? AND is_used = 0`), so of
//! any number of concurrent redeemers exactly one wins. Registration redeems inside its own
//! transaction so a failed signup leaves the code unused.

use crate::{
    core::retry::with_write_retry,
    entities::{InviteCode, invite_code},
    errors::{Error, Result},
    models::PrivilegeTier,
};
use rand::Rng;
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use tracing::{info, instrument, warn};

/// Alphabet for generated codes; excludes characters that are easy to misread.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const MAX_GENERATION_ATTEMPTS: usize = 5;

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
        .collect()
}

/// Creates a new unused invite code for `tier`.
///
/// Administrator codes are refused: admin accounts are created only through the
/// administrative path.
#[instrument(skip(db))]
pub async fn generate<C>(db: &C, tier: PrivilegeTier) -> Result<invite_code::Model>
where
    C: ConnectionTrait,
{
    if tier == PrivilegeTier::Admin {
        return Err(Error::invalid_argument(
            "invite codes cannot grant administrator privileges",
        ));
    }

    for _ in 0..MAX_GENERATION_ATTEMPTS {
        let code = random_code();
        let taken = InviteCode::find()
            .filter(invite_code::Column::Code.eq(code.as_str()))
            .one(db)
            .await?
            .is_some();
        if taken {
            warn!("Invite code collision on {}, regenerating", code);
            continue;
        }

        let model = invite_code::ActiveModel {
            code: Set(code),
            privilege_tier: Set(tier.as_str().to_string()),
            is_used: Set(false),
            used_by_account_id: Set(None),
            created_at: Set(chrono::Utc::now()),
            used_at: Set(None),
            ..Default::default()
        }
        .insert(db)
        .await?;
        info!("Generated invite code {} for tier {}", model.code, tier);
        return Ok(model);
    }

    Err(Error::Conflict {
        message: "could not generate a unique invite code".to_string(),
    })
}

/// Whether `code` exists and has not been redeemed.
pub async fn verify<C>(db: &C, code: &str) -> Result<bool>
where
    C: ConnectionTrait,
{
    Ok(InviteCode::find()
        .filter(invite_code::Column::Code.eq(code))
        .filter(invite_code::Column::IsUsed.eq(false))
        .one(db)
        .await?
        .is_some())
}

/// Marks `code` used by `account_id` and returns the tier it grants.
///
/// # Errors
/// - [`Error::NotFound`] if the code does not exist
/// - [`Error::AlreadyUsed`] if another redemption already won
#[instrument(skip(db))]
pub async fn redeem<C>(db: &C, code: &str, account_id: i64) -> Result<PrivilegeTier>
where
    C: ConnectionTrait,
{
    with_write_retry("invite redeem", || redeem_in(db, code, account_id)).await
}

/// [`redeem`] without retrying, for callers that hold the outer transaction.
pub(crate) async fn redeem_in<C>(db: &C, code: &str, account_id: i64) -> Result<PrivilegeTier>
where
    C: ConnectionTrait,
{
    let claimed = InviteCode::update_many()
        .col_expr(invite_code::Column::IsUsed, Expr::value(true))
        .col_expr(invite_code::Column::UsedByAccountId, Expr::value(account_id))
        .col_expr(invite_code::Column::UsedAt, Expr::value(chrono::Utc::now()))
        .filter(invite_code::Column::Code.eq(code))
        .filter(invite_code::Column::IsUsed.eq(false))
        .exec(db)
        .await?;

    let invite = InviteCode::find()
        .filter(invite_code::Column::Code.eq(code))
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("invite code", code))?;

    if claimed.rows_affected == 0 {
        return Err(Error::AlreadyUsed {
            code: code.to_string(),
        });
    }

    let tier = invite.tier()?;
    info!(
        "Invite code {} redeemed by account {} ({})",
        code, account_id, tier
    );
    Ok(tier)
}

/// Lists all invite codes, newest first.
pub async fn list<C>(db: &C) -> Result<Vec<invite_code::Model>>
where
    C: ConnectionTrait,
{
    InviteCode::find()
        .order_by_desc(invite_code::Column::CreatedAt)
        .order_by_desc(invite_code::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Deletes an invite code, used or not.
pub async fn delete<C>(db: &C, invite_id: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    let deleted = InviteCode::delete_by_id(invite_id).exec(db).await?;
    if deleted.rows_affected == 0 {
        return Err(Error::not_found("invite code", invite_id));
    }
    info!("Deleted invite code #{}", invite_id);
    Ok(())
}
