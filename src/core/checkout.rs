//! Checkout engine - Converts an account's cart into an order.
//!
//! A checkout is one database transaction that re-reads the cart, products and account,
//! validates them, then decrements stock per line, debits the account through the ledger,
//! inserts the order with a frozen snapshot of its lines, and clears the cart. Stock is
//! decremented with a guarded `UPDATE ... WHERE stock >= quantity`, and the debit uses the
//! same pattern on the balance, so two checkouts racing for the same stock or balance can
//! never both commit. A checkout that loses the write lock, or whose guard trips after
//! validation passed, is rolled back and rerun against fresh state. The rerun reports what
//! it then finds, so a buyer who lost the last unit gets [`Error::OutOfStock`].

use crate::{
    core::{ledger, retry::with_write_retry},
    entities::{Account, CartLine, Product, cart_line, order, product},
    errors::{Error, Result},
    models::{EntryKind, OrderItem, OrderStatus, encode_order_items},
};
use sea_orm::{
    DatabaseTransaction, QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr,
};
use tracing::{info, instrument};

/// Checks out the account's cart and returns the created order.
///
/// # Errors
/// - [`Error::EmptyCart`] if the cart has no lines
/// - [`Error::NotFound`] if the account or a product no longer exists
/// - [`Error::OutOfStock`] naming the first product whose stock is below its line quantity
/// - [`Error::InsufficientBalance`] if the total exceeds the balance
/// - [`Error::Conflict`] if concurrent writers kept invalidating the attempt
///
/// On any error nothing is written: stock, balance, ledger and cart are unchanged.
#[instrument(skip(db))]
pub async fn checkout<C>(db: &C, account_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let order = with_write_retry("checkout", || try_checkout(db, account_id)).await?;
    info!(
        "Checkout complete: account_id={}, order_id={}, total={}",
        account_id, order.id, order.total_price
    );
    Ok(order)
}

async fn try_checkout<C>(db: &C, account_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    let order = checkout_in(&txn, account_id).await?;
    txn.commit().await?;
    Ok(order)
}

async fn checkout_in(txn: &DatabaseTransaction, account_id: i64) -> Result<order::Model> {
    let account = Account::find_by_id(account_id)
        .one(txn)
        .await?
        .ok_or_else(|| Error::not_found("account", account_id))?;

    let lines = CartLine::find()
        .filter(cart_line::Column::AccountId.eq(account_id))
        .order_by_asc(cart_line::Column::Id)
        .all(txn)
        .await?;
    if lines.is_empty() {
        return Err(Error::EmptyCart { account_id });
    }

    let (items, total) = price_lines(txn, &lines).await?;

    if account.balance < total {
        return Err(Error::InsufficientBalance {
            balance: account.balance,
            required: total,
        });
    }

    for item in &items {
        let decremented = Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(item.quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(item.product_id))
            .filter(product::Column::Stock.gte(item.quantity))
            .exec(txn)
            .await?;
        if decremented.rows_affected != 1 {
            return Err(Error::Conflict {
                message: format!("stock of '{}' changed during checkout", item.name),
            });
        }
    }

    let now = chrono::Utc::now();
    let order = order::ActiveModel {
        account_id: Set(account_id),
        total_price: Set(total),
        status: Set(OrderStatus::Pending.as_str().to_string()),
        items: Set(encode_order_items(&items)?),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(txn)
    .await?;

    ledger::debit_in(
        txn,
        account_id,
        total,
        EntryKind::Purchase,
        format!("Order #{} ({} line(s))", order.id, items.len()),
        Some(order.id.to_string()),
    )
    .await
    .map_err(|e| match e {
        Error::InsufficientBalance { balance, required } => Error::Conflict {
            message: format!("balance changed during checkout ({balance} < {required})"),
        },
        other => other,
    })?;

    CartLine::delete_many()
        .filter(cart_line::Column::AccountId.eq(account_id))
        .exec(txn)
        .await?;

    Ok(order)
}

/// Reads each line's product and builds the order snapshot and total.
async fn price_lines(
    txn: &DatabaseTransaction,
    lines: &[cart_line::Model],
) -> Result<(Vec<OrderItem>, i64)> {
    let mut items = Vec::with_capacity(lines.len());
    let mut total: i64 = 0;

    for line in lines {
        let product = Product::find_by_id(line.product_id)
            .one(txn)
            .await?
            .filter(|product| product.is_active)
            .ok_or_else(|| Error::not_found("product", line.product_id))?;

        if product.stock < line.quantity {
            return Err(Error::OutOfStock {
                product: product.name,
                requested: line.quantity,
                available: product.stock,
            });
        }

        let item = OrderItem {
            product_id: product.id,
            name: product.name,
            unit_price: product.price,
            quantity: line.quantity,
        };
        total = total
            .checked_add(item.subtotal())
            .ok_or_else(|| Error::invalid_argument("order total overflows"))?;
        items.push(item);
    }

    Ok((items, total))
}
