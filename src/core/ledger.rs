//! Ledger business logic - The single path through which point balances change.
//!
//! Every credit or debit updates the denormalized `accounts.balance` and appends a ledger
//! entry inside one database transaction, so the balance always equals the sum of the
//! account's entries. Debits use a guarded `UPDATE ... WHERE balance >= amount`, which keeps
//! the balance non-negative even under concurrent writers. [`credit`] and [`debit`] rerun
//! their transaction when they lose the write lock to another connection. Callers that need
//! a larger atomic unit (checkout, recharge reconciliation) use `credit_in` / `debit_in`
//! with their own open transaction, where the ledger nests as a savepoint and the caller
//! owns the retry.

use crate::{
    core::retry::with_write_retry,
    entities::{Account, LedgerEntry, account, ledger_entry},
    errors::{Error, Result},
    models::EntryKind,
};
use sea_orm::{QueryOrder, QuerySelect, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{info, instrument};

/// Recorded balance alongside the sum of ledger entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAudit {
    /// Account audited
    pub account_id: i64,
    /// `accounts.balance`
    pub recorded: i64,
    /// Sum of `ledger_entries.amount`
    pub ledger_sum: i64,
}

impl BalanceAudit {
    /// Whether the denormalized balance matches the entry log.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.recorded == self.ledger_sum
    }
}

/// Adds points to an account and records why.
///
/// # Arguments
/// * `db` - Connection or open transaction
/// * `account_id` - Account to credit
/// * `amount` - Points to add, must be positive
/// * `kind` - Reason for the change
/// * `description` - Human-readable description
/// * `reference` - Order id or charge reference for reconciliation
#[instrument(skip(db, description))]
pub async fn credit<C>(
    db: &C,
    account_id: i64,
    amount: i64,
    kind: EntryKind,
    description: String,
    reference: Option<String>,
) -> Result<ledger_entry::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    with_write_retry("ledger credit", || {
        credit_in(db, account_id, amount, kind, description.clone(), reference.clone())
    })
    .await
}

/// [`credit`] without retrying, for callers that hold the outer transaction.
pub(crate) async fn credit_in<C>(
    db: &C,
    account_id: i64,
    amount: i64,
    kind: EntryKind,
    description: String,
    reference: Option<String>,
) -> Result<ledger_entry::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    if amount <= 0 {
        return Err(Error::InvalidAmount {
            amount: amount as f64,
        });
    }

    let txn = db.begin().await?;

    let updated = Account::update_many()
        .col_expr(
            account::Column::Balance,
            Expr::col(account::Column::Balance).add(amount),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(account::Column::Id.eq(account_id))
        .exec(&txn)
        .await?;
    if updated.rows_affected == 0 {
        return Err(Error::not_found("account", account_id));
    }

    let entry = append_entry(&txn, account_id, amount, kind, description, reference).await?;
    txn.commit().await?;

    info!(
        "Ledger credit: account_id={}, amount={}, kind={}, reference={:?}",
        account_id,
        amount,
        kind.as_str(),
        entry.reference
    );
    Ok(entry)
}

/// Removes points from an account and records why.
///
/// Fails with [`Error::InsufficientBalance`] if the balance would go negative; nothing is
/// written in that case.
#[instrument(skip(db, description))]
pub async fn debit<C>(
    db: &C,
    account_id: i64,
    amount: i64,
    kind: EntryKind,
    description: String,
    reference: Option<String>,
) -> Result<ledger_entry::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    with_write_retry("ledger debit", || {
        debit_in(db, account_id, amount, kind, description.clone(), reference.clone())
    })
    .await
}

/// [`debit`] without retrying, for callers that hold the outer transaction.
pub(crate) async fn debit_in<C>(
    db: &C,
    account_id: i64,
    amount: i64,
    kind: EntryKind,
    description: String,
    reference: Option<String>,
) -> Result<ledger_entry::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    if amount <= 0 {
        return Err(Error::InvalidAmount {
            amount: amount as f64,
        });
    }

    let txn = db.begin().await?;

    let updated = Account::update_many()
        .col_expr(
            account::Column::Balance,
            Expr::col(account::Column::Balance).sub(amount),
        )
        .col_expr(account::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(account::Column::Id.eq(account_id))
        .filter(account::Column::Balance.gte(amount))
        .exec(&txn)
        .await?;
    if updated.rows_affected == 0 {
        let account = Account::find_by_id(account_id)
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("account", account_id))?;
        return Err(Error::InsufficientBalance {
            balance: account.balance,
            required: amount,
        });
    }

    let entry = append_entry(&txn, account_id, -amount, kind, description, reference).await?;
    txn.commit().await?;

    info!(
        "Ledger debit: account_id={}, amount={}, kind={}, reference={:?}",
        account_id,
        amount,
        kind.as_str(),
        entry.reference
    );
    Ok(entry)
}

async fn append_entry<C>(
    db: &C,
    account_id: i64,
    signed_amount: i64,
    kind: EntryKind,
    description: String,
    reference: Option<String>,
) -> Result<ledger_entry::Model>
where
    C: ConnectionTrait,
{
    let entry = ledger_entry::ActiveModel {
        account_id: Set(account_id),
        amount: Set(signed_amount),
        kind: Set(kind.as_str().to_string()),
        description: Set(description),
        reference: Set(reference),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    };
    entry.insert(db).await.map_err(Into::into)
}

/// Retrieves all ledger entries for an account, newest first.
pub async fn list_entries<C>(db: &C, account_id: i64) -> Result<Vec<ledger_entry::Model>>
where
    C: ConnectionTrait,
{
    LedgerEntry::find()
        .filter(ledger_entry::Column::AccountId.eq(account_id))
        .order_by_desc(ledger_entry::Column::CreatedAt)
        .order_by_desc(ledger_entry::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Current balance of an account.
pub async fn balance<C>(db: &C, account_id: i64) -> Result<i64>
where
    C: ConnectionTrait,
{
    Account::find_by_id(account_id)
        .one(db)
        .await?
        .map(|account| account.balance)
        .ok_or_else(|| Error::not_found("account", account_id))
}

/// Compares the recorded balance with the sum of the account's ledger entries.
pub async fn audit_balance<C>(db: &C, account_id: i64) -> Result<BalanceAudit>
where
    C: ConnectionTrait,
{
    let recorded = balance(db, account_id).await?;
    let ledger_sum: Option<i64> = LedgerEntry::find()
        .select_only()
        .column_as(Expr::col(ledger_entry::Column::Amount).sum(), "total")
        .filter(ledger_entry::Column::AccountId.eq(account_id))
        .into_tuple::<Option<i64>>()
        .one(db)
        .await?
        .flatten();

    Ok(BalanceAudit {
        account_id,
        recorded,
        ledger_sum: ledger_sum.unwrap_or(0),
    })
}
