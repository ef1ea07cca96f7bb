//! Administration - Privileged account management.
//!
//! Every action takes the acting account's id and first checks that the actor is an
//! administrator who is not banned. The one exception is [`bootstrap_admin`], which the
//! binary uses to seed the first administrator before anyone can act.

use crate::{
    core::account::{self, NewAccount},
    entities::{Account, CartLine, LedgerEntry, Order, Recharge, account as account_entity},
    entities::{cart_line, ledger_entry, order, recharge},
    errors::{Error, Result},
    models::PrivilegeTier,
};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*};
use tracing::{info, instrument, warn};

/// Loads the actor and checks that it may perform administrative actions.
pub(crate) async fn require_admin<C>(db: &C, actor_id: i64) -> Result<account_entity::Model>
where
    C: ConnectionTrait,
{
    let actor = Account::find_by_id(actor_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::PermissionDenied {
            message: format!("unknown actor {actor_id}"),
        })?;

    if actor.is_banned || actor.tier()? != PrivilegeTier::Admin {
        warn!("Account {} attempted an administrative action", actor_id);
        return Err(Error::PermissionDenied {
            message: format!("account {actor_id} is not an active administrator"),
        });
    }
    Ok(actor)
}

/// Creates an administrator without an acting admin.
///
/// Used once at startup. If the username already belongs to an administrator that account
/// is returned unchanged, so repeated startups are harmless.
#[instrument(skip(db))]
pub async fn bootstrap_admin<C>(db: &C, new: NewAccount) -> Result<account_entity::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    new.validate()?;

    let existing = Account::find()
        .filter(account_entity::Column::Username.eq(new.username.as_str()))
        .one(db)
        .await?;
    if let Some(existing) = existing {
        if existing.tier()? == PrivilegeTier::Admin {
            info!("Administrator '{}' already present", existing.username);
            return Ok(existing);
        }
        return Err(Error::AccountExists {
            field: "username",
            value: new.username,
        });
    }

    create_admin(db, &new).await
}

/// Creates another administrator on behalf of `actor_id`.
#[instrument(skip(db))]
pub async fn create_admin_account<C>(
    db: &C,
    actor_id: i64,
    new: NewAccount,
) -> Result<account_entity::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    require_admin(db, actor_id).await?;
    new.validate()?;
    create_admin(db, &new).await
}

async fn create_admin<C>(db: &C, new: &NewAccount) -> Result<account_entity::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let password_hash = account::hash_password(&new.password).await?;
    let txn = db.begin().await?;
    account::ensure_unique(&txn, Some(&new.username), Some(&new.email), None).await?;
    let created =
        account::insert_account(&txn, new, &password_hash, PrivilegeTier::Admin).await?;
    txn.commit().await?;

    info!(
        "Created administrator account {} '{}'",
        created.id, created.username
    );
    Ok(created)
}

/// Changes another account's privilege tier.
#[instrument(skip(db))]
pub async fn set_privilege<C>(
    db: &C,
    actor_id: i64,
    target_id: i64,
    tier: PrivilegeTier,
) -> Result<account_entity::Model>
where
    C: ConnectionTrait,
{
    require_admin(db, actor_id).await?;
    let target = account::get_account(db, target_id).await?;

    let previous = target.privilege_tier.clone();
    let mut active: account_entity::ActiveModel = target.into();
    active.privilege_tier = Set(tier.as_str().to_string());
    active.updated_at = Set(chrono::Utc::now());
    let updated = active.update(db).await?;

    info!(
        "Admin {} changed tier of account {} from {} to {}",
        actor_id, target_id, previous, tier
    );
    Ok(updated)
}

/// Bans or unbans an account.
#[instrument(skip(db))]
pub async fn set_banned<C>(
    db: &C,
    actor_id: i64,
    target_id: i64,
    banned: bool,
) -> Result<account_entity::Model>
where
    C: ConnectionTrait,
{
    require_admin(db, actor_id).await?;
    if banned && actor_id == target_id {
        return Err(Error::invalid_argument("administrators cannot ban themselves"));
    }
    let target = account::get_account(db, target_id).await?;

    let mut active: account_entity::ActiveModel = target.into();
    active.is_banned = Set(banned);
    active.updated_at = Set(chrono::Utc::now());
    let updated = active.update(db).await?;

    info!(
        "Admin {} set banned={} on account {}",
        actor_id, banned, target_id
    );
    Ok(updated)
}

/// Deletes an account and everything it owns in one transaction.
///
/// Cart lines, orders, ledger entries and recharge attempts go first, then the account
/// row. Invite codes the account redeemed stay, marked as used.
#[instrument(skip(db))]
pub async fn wipe_account<C>(db: &C, actor_id: i64, target_id: i64) -> Result<()>
where
    C: ConnectionTrait + TransactionTrait,
{
    if actor_id == target_id {
        return Err(Error::invalid_argument("administrators cannot wipe themselves"));
    }

    let txn = db.begin().await?;
    require_admin(&txn, actor_id).await?;
    let target = account::get_account(&txn, target_id).await?;

    let cart_lines = CartLine::delete_many()
        .filter(cart_line::Column::AccountId.eq(target_id))
        .exec(&txn)
        .await?
        .rows_affected;
    let orders = Order::delete_many()
        .filter(order::Column::AccountId.eq(target_id))
        .exec(&txn)
        .await?
        .rows_affected;
    let entries = LedgerEntry::delete_many()
        .filter(ledger_entry::Column::AccountId.eq(target_id))
        .exec(&txn)
        .await?
        .rows_affected;
    let recharges = Recharge::delete_many()
        .filter(recharge::Column::AccountId.eq(target_id))
        .exec(&txn)
        .await?
        .rows_affected;
    Account::delete_by_id(target_id).exec(&txn).await?;

    txn.commit().await?;
    warn!(
        "Admin {} wiped account {} '{}' (balance {}): {} cart lines, {} orders, {} ledger entries, {} recharges",
        actor_id, target_id, target.username, target.balance, cart_lines, orders, entries, recharges
    );
    Ok(())
}

/// Lists every account, oldest first.
pub async fn list_accounts<C>(db: &C, actor_id: i64) -> Result<Vec<account_entity::Model>>
where
    C: ConnectionTrait,
{
    require_admin(db, actor_id).await?;
    Account::find()
        .order_by_asc(account_entity::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}
