//! Order business logic - Reading orders and moving them through their lifecycle.
//!
//! Orders are created only by checkout. Their line snapshot is immutable; the only field
//! that changes afterwards is `status`, which moves from pending to either completed or
//! cancelled exactly once. Cancelling refunds the total through the ledger and returns the
//! units to stock for products that still exist.

use crate::{
    core::{ledger, retry::with_write_retry},
    entities::{Order, Product, order, product},
    errors::{Error, Result},
    models::{EntryKind, OrderStatus},
};
use sea_orm::{QueryOrder, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{info, instrument};

/// Retrieves an order by id.
pub async fn get_order<C>(db: &C, order_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait,
{
    Order::find_by_id(order_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("order", order_id))
}

/// Lists an account's orders, newest first.
pub async fn list_orders_for_account<C>(db: &C, account_id: i64) -> Result<Vec<order::Model>>
where
    C: ConnectionTrait,
{
    Order::find()
        .filter(order::Column::AccountId.eq(account_id))
        .order_by_desc(order::Column::CreatedAt)
        .order_by_desc(order::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Lists every order in the shop, newest first.
pub async fn list_all_orders<C>(db: &C) -> Result<Vec<order::Model>>
where
    C: ConnectionTrait,
{
    Order::find()
        .order_by_desc(order::Column::CreatedAt)
        .order_by_desc(order::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Conditionally moves an order from pending to `to`. Returns whether this call won.
async fn transition_from_pending<C>(db: &C, order_id: i64, to: OrderStatus) -> Result<bool>
where
    C: ConnectionTrait,
{
    let updated = Order::update_many()
        .col_expr(order::Column::Status, Expr::value(to.as_str()))
        .col_expr(order::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(OrderStatus::Pending.as_str()))
        .exec(db)
        .await?;
    Ok(updated.rows_affected == 1)
}

async fn not_pending_error<C>(db: &C, order_id: i64, action: &str) -> Result<Error>
where
    C: ConnectionTrait,
{
    let order = get_order(db, order_id).await?;
    Ok(Error::InvalidState {
        message: format!(
            "order #{} is {} and cannot be {}",
            order.id, order.status, action
        ),
    })
}

/// Marks a pending order as delivered.
#[instrument(skip(db))]
pub async fn complete_order<C>(db: &C, order_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait,
{
    if !transition_from_pending(db, order_id, OrderStatus::Completed).await? {
        return Err(not_pending_error(db, order_id, "completed").await?);
    }
    info!("Order #{} completed", order_id);
    get_order(db, order_id).await
}

/// Cancels a pending order, refunding its total and restoring stock.
///
/// Stock is restored only for products that still exist. The refund is recorded as a
/// ledger entry referencing the order id. Only one cancellation can ever succeed.
#[instrument(skip(db))]
pub async fn cancel_order<C>(db: &C, order_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let order = with_write_retry("order cancel", || cancel_once(db, order_id)).await?;
    info!(
        "Order #{} cancelled, refunded {} points to account {}",
        order.id, order.total_price, order.account_id
    );
    Ok(order)
}

async fn cancel_once<C>(db: &C, order_id: i64) -> Result<order::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;

    if !transition_from_pending(&txn, order_id, OrderStatus::Cancelled).await? {
        return Err(not_pending_error(&txn, order_id, "cancelled").await?);
    }

    let order = get_order(&txn, order_id).await?;
    for item in order.items()? {
        Product::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(item.quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(product::Column::Id.eq(item.product_id))
            .exec(&txn)
            .await?;
    }

    ledger::credit_in(
        &txn,
        order.account_id,
        order.total_price,
        EntryKind::Refund,
        format!("Refund for order #{}", order.id),
        Some(order.id.to_string()),
    )
    .await?;

    txn.commit().await?;
    Ok(order)
}
