//! Cart business logic - Per-account staging area for purchases.
//!
//! Staging is optimistic: no stock check happens here, stock is authoritative only at
//! checkout. Re-adding a product merges into the existing line. Listed prices always come
//! from the live product row; prices are frozen only when an order is created.

use crate::{
    core::retry::with_write_retry,
    entities::{CartLine, Product, cart_line, product},
    errors::{Error, Result},
    models::CartItemView,
};
use sea_orm::{QueryOrder, Set, SqlErr, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{debug, instrument};

fn validate_quantity(quantity: i32) -> Result<()> {
    if quantity <= 0 {
        return Err(Error::invalid_argument(format!(
            "quantity must be at least 1 (got {quantity})"
        )));
    }
    Ok(())
}

/// Adds `quantity` units of a product to an account's cart.
///
/// If the account already has a line for the product its quantity is incremented,
/// otherwise a new line is inserted. Fails with [`Error::NotFound`] if the product does
/// not exist or is inactive. Two first adds racing for the same product end up merged
/// into one line.
#[instrument(skip(db))]
pub async fn add_item<C>(
    db: &C,
    account_id: i64,
    product_id: i64,
    quantity: i32,
) -> Result<cart_line::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    validate_quantity(quantity)?;

    let line = with_write_retry("cart add", || {
        add_item_once(db, account_id, product_id, quantity)
    })
    .await?;
    debug!(
        "Cart line {} for account {}: product {} x{}",
        line.id, account_id, product_id, line.quantity
    );
    Ok(line)
}

async fn add_item_once<C>(
    db: &C,
    account_id: i64,
    product_id: i64,
    quantity: i32,
) -> Result<cart_line::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;

    Product::find_by_id(product_id)
        .filter(product::Column::IsActive.eq(true))
        .one(&txn)
        .await?
        .ok_or_else(|| Error::not_found("product", product_id))?;

    let now = chrono::Utc::now();
    let merged = CartLine::update_many()
        .col_expr(
            cart_line::Column::Quantity,
            Expr::col(cart_line::Column::Quantity).add(quantity),
        )
        .col_expr(cart_line::Column::UpdatedAt, Expr::value(now))
        .filter(cart_line::Column::AccountId.eq(account_id))
        .filter(cart_line::Column::ProductId.eq(product_id))
        .exec(&txn)
        .await?;

    let line = if merged.rows_affected == 0 {
        cart_line::ActiveModel {
            account_id: Set(account_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .map_err(|err| match err.sql_err() {
            // Another add inserted the line first; the rerun merges into it
            Some(SqlErr::UniqueConstraintViolation(detail)) => Error::Conflict { message: detail },
            _ => err.into(),
        })?
    } else {
        CartLine::find()
            .filter(cart_line::Column::AccountId.eq(account_id))
            .filter(cart_line::Column::ProductId.eq(product_id))
            .one(&txn)
            .await?
            .ok_or_else(|| Error::not_found("cart line", product_id))?
    };

    txn.commit().await?;
    Ok(line)
}

/// Sets the quantity of an existing cart line.
pub async fn update_quantity<C>(db: &C, line_id: i64, quantity: i32) -> Result<cart_line::Model>
where
    C: ConnectionTrait,
{
    validate_quantity(quantity)?;

    let line = CartLine::find_by_id(line_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("cart line", line_id))?;

    let mut line: cart_line::ActiveModel = line.into();
    line.quantity = Set(quantity);
    line.updated_at = Set(chrono::Utc::now());
    line.update(db).await.map_err(Into::into)
}

/// Removes a cart line.
///
/// Returns [`Error::NotFound`] if the line is already gone; callers that only care about
/// the end state may ignore it.
pub async fn remove_item<C>(db: &C, line_id: i64) -> Result<()>
where
    C: ConnectionTrait,
{
    let deleted = CartLine::delete_by_id(line_id).exec(db).await?;
    if deleted.rows_affected == 0 {
        return Err(Error::not_found("cart line", line_id));
    }
    Ok(())
}

/// Lists an account's cart lines with current product name, price and stock.
///
/// Lines whose product has been deleted are skipped.
pub async fn list_items<C>(db: &C, account_id: i64) -> Result<Vec<CartItemView>>
where
    C: ConnectionTrait,
{
    let rows = CartLine::find()
        .filter(cart_line::Column::AccountId.eq(account_id))
        .order_by_asc(cart_line::Column::Id)
        .find_also_related(Product)
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(line, product)| {
            product.map(|product| CartItemView {
                line_id: line.id,
                product_id: product.id,
                name: product.name,
                unit_price: product.price,
                quantity: line.quantity,
                available_stock: product.stock,
            })
        })
        .collect())
}

/// Sum of `unit_price * quantity` over the cart at current prices.
pub async fn cart_total<C>(db: &C, account_id: i64) -> Result<i64>
where
    C: ConnectionTrait,
{
    Ok(list_items(db, account_id)
        .await?
        .iter()
        .map(CartItemView::subtotal)
        .sum())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::core::catalog::{self, ProductChanges};
    use crate::test_utils::*;
    use sea_orm::DatabaseConnection;

    #[tokio::test]
    async fn test_quantity_validation() -> Result<()> {
        let db = DatabaseConnection::Disconnected;

        let result = add_item(&db, 1, 1, 0).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));

        let result = update_quantity(&db, 1, -3).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_add_item_merges_existing_line() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let product = create_test_product(&db, "M4A4 Howl", 30, 5).await?;

        let first = add_item(&db, account.id, product.id, 2).await?;
        let second = add_item(&db, account.id, product.id, 3).await?;

        assert_eq!(first.id, second.id);
        assert_eq!(second.quantity, 5);

        let items = list_items(&db, account.id).await?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 5);

        Ok(())
    }

    #[tokio::test]
    async fn test_add_item_does_not_check_stock() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let product = create_test_product(&db, "Rare Case", 30, 1).await?;

        let line = add_item(&db, account.id, product.id, 10).await?;
        assert_eq!(line.quantity, 10);

        Ok(())
    }

    #[tokio::test]
    async fn test_add_item_unknown_or_inactive_product() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;

        let result = add_item(&db, account.id, 999, 1).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound { entity: "product", .. }));

        let product = create_test_product(&db, "Retired", 30, 1).await?;
        catalog::update_product(
            &db,
            product.id,
            ProductChanges {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await?;
        let result = add_item(&db, account.id, product.id, 1).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_update_and_remove() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let product = create_test_product(&db, "Gloves", 30, 5).await?;
        let line = add_item(&db, account.id, product.id, 1).await?;

        let updated = update_quantity(&db, line.id, 4).await?;
        assert_eq!(updated.quantity, 4);

        remove_item(&db, line.id).await?;
        assert!(list_items(&db, account.id).await?.is_empty());

        // Second removal reports NotFound
        let again = remove_item(&db, line.id).await;
        assert!(matches!(again.unwrap_err(), Error::NotFound { .. }));

        let missing = update_quantity(&db, line.id, 2).await;
        assert!(matches!(missing.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_list_items_reflects_current_price() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let product = create_test_product(&db, "Sticker", 30, 5).await?;
        add_item(&db, account.id, product.id, 2).await?;
        assert_eq!(cart_total(&db, account.id).await?, 60);

        catalog::update_product(
            &db,
            product.id,
            ProductChanges {
                price: Some(45),
                ..Default::default()
            },
        )
        .await?;

        let items = list_items(&db, account.id).await?;
        assert_eq!(items[0].unit_price, 45);
        assert_eq!(cart_total(&db, account.id).await?, 90);

        Ok(())
    }

    #[tokio::test]
    async fn test_carts_are_per_account() -> Result<()> {
        let (db, alice) = setup_with_funded_account(0).await?;
        let bob = create_test_account(&db, "bob").await?;
        let product = create_test_product(&db, "Shared", 30, 5).await?;

        add_item(&db, alice.id, product.id, 1).await?;
        add_item(&db, bob.id, product.id, 2).await?;

        assert_eq!(list_items(&db, alice.id).await?[0].quantity, 1);
        assert_eq!(list_items(&db, bob.id).await?[0].quantity, 2);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_adds_merge_into_one_line() -> Result<()> {
        let (db, _dir) = setup_file_test_db().await?;
        let account = create_test_account(&db, "alice").await?;
        let product = create_test_product(&db, "Popular", 10, 100).await?;
        let (account_id, product_id) = (account.id, product.id);

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move { add_item(&db, account_id, product_id, 1).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap()?;
        }

        let items = list_items(&db, account_id).await?;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 6);
        Ok(())
    }
}
