//! Catalog business logic - Handles all product-related operations.
//!
//! Products are created, edited and deleted by administrators. Prices are positive point
//! amounts and stock never goes negative. Checkout is the only place stock is consumed;
//! this module only exposes explicit restocking.

use crate::{
    entities::{CartLine, Product, cart_line, product},
    errors::{Error, Result},
};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{info, instrument};

/// Fields required to create a product.
#[derive(Debug, Clone)]
pub struct NewProduct {
    /// Unique product name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Price in points, positive
    pub price: i64,
    /// Initial stock, non-negative
    pub stock: i32,
    /// Catalog category
    pub category: String,
}

/// Partial update of a product; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ProductChanges {
    /// New name
    pub name: Option<String>,
    /// New description (`Some(None)` clears it)
    pub description: Option<Option<String>>,
    /// New price
    pub price: Option<i64>,
    /// New absolute stock level
    pub stock: Option<i32>,
    /// New category
    pub category: Option<String>,
    /// Activate or deactivate
    pub is_active: Option<bool>,
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_argument("product name cannot be empty"));
    }
    Ok(trimmed.to_string())
}

fn validate_price(price: i64) -> Result<()> {
    if price <= 0 {
        return Err(Error::InvalidAmount {
            amount: price as f64,
        });
    }
    Ok(())
}

fn validate_stock(stock: i32) -> Result<()> {
    if stock < 0 {
        return Err(Error::invalid_argument(format!(
            "stock cannot be negative (got {stock})"
        )));
    }
    Ok(())
}

async fn ensure_name_available<C>(db: &C, name: &str, except_id: Option<i64>) -> Result<()>
where
    C: ConnectionTrait,
{
    let mut query = Product::find().filter(product::Column::Name.eq(name));
    if let Some(id) = except_id {
        query = query.filter(product::Column::Id.ne(id));
    }
    if query.one(db).await?.is_some() {
        return Err(Error::invalid_argument(format!(
            "a product named '{name}' already exists"
        )));
    }
    Ok(())
}

/// Retrieves all active products, ordered alphabetically by name.
pub async fn list_active_products<C>(db: &C) -> Result<Vec<product::Model>>
where
    C: ConnectionTrait,
{
    Product::find()
        .filter(product::Column::IsActive.eq(true))
        .order_by_asc(product::Column::Name)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Retrieves active products in one category, ordered alphabetically by name.
pub async fn list_products_by_category<C>(db: &C, category: &str) -> Result<Vec<product::Model>>
where
    C: ConnectionTrait,
{
    Product::find()
        .filter(product::Column::IsActive.eq(true))
        .filter(product::Column::Category.eq(category))
        .order_by_asc(product::Column::Name)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Retrieves a product by id, active or not.
pub async fn get_product<C>(db: &C, product_id: i64) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    Product::find_by_id(product_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("product", product_id))
}

/// Creates a new active product after validating its fields.
///
/// # Errors
/// Returns an error if:
/// - The name is empty or already taken
/// - The price is not positive
/// - The stock is negative
pub async fn create_product<C>(db: &C, new: NewProduct) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    let name = validate_name(&new.name)?;
    validate_price(new.price)?;
    validate_stock(new.stock)?;
    ensure_name_available(db, &name, None).await?;

    let now = chrono::Utc::now();
    let product = product::ActiveModel {
        name: Set(name),
        description: Set(new.description),
        price: Set(new.price),
        stock: Set(new.stock),
        category: Set(new.category.trim().to_string()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let created = product.insert(db).await?;
    info!(
        "Created product {} '{}' price={} stock={}",
        created.id, created.name, created.price, created.stock
    );
    Ok(created)
}

/// Applies a partial update to a product.
///
/// Existing orders are unaffected: they carry their own snapshot of name and price.
pub async fn update_product<C>(
    db: &C,
    product_id: i64,
    changes: ProductChanges,
) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    let existing = get_product(db, product_id).await?;
    let mut product: product::ActiveModel = existing.into();

    if let Some(name) = changes.name {
        let name = validate_name(&name)?;
        ensure_name_available(db, &name, Some(product_id)).await?;
        product.name = Set(name);
    }
    if let Some(description) = changes.description {
        product.description = Set(description);
    }
    if let Some(price) = changes.price {
        validate_price(price)?;
        product.price = Set(price);
    }
    if let Some(stock) = changes.stock {
        validate_stock(stock)?;
        product.stock = Set(stock);
    }
    if let Some(category) = changes.category {
        product.category = Set(category.trim().to_string());
    }
    if let Some(is_active) = changes.is_active {
        product.is_active = Set(is_active);
    }
    product.updated_at = Set(chrono::Utc::now());

    product.update(db).await.map_err(Into::into)
}

/// Adds (or with a negative delta, removes) stock atomically.
///
/// Fails with [`Error::InvalidArgument`] if the result would be negative.
#[instrument(skip(db))]
pub async fn restock<C>(db: &C, product_id: i64, delta: i32) -> Result<product::Model>
where
    C: ConnectionTrait,
{
    if delta == 0 {
        return get_product(db, product_id).await;
    }

    let updated = Product::update_many()
        .col_expr(
            product::Column::Stock,
            Expr::col(product::Column::Stock).add(delta),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Stock.gte(-delta.min(0)))
        .exec(db)
        .await?;

    let product = get_product(db, product_id).await?;
    if updated.rows_affected == 0 {
        return Err(Error::invalid_argument(format!(
            "cannot remove {} units from '{}', only {} in stock",
            -delta, product.name, product.stock
        )));
    }
    info!(
        "Restocked product {} by {}: stock now {}",
        product_id, delta, product.stock
    );
    Ok(product)
}

/// Permanently deletes a product together with any cart lines that reference it.
///
/// Historical orders keep their snapshot and are not touched.
#[instrument(skip(db))]
pub async fn delete_product<C>(db: &C, product_id: i64) -> Result<()>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;

    let removed_lines = CartLine::delete_many()
        .filter(cart_line::Column::ProductId.eq(product_id))
        .exec(&txn)
        .await?;
    let deleted = Product::delete_by_id(product_id).exec(&txn).await?;
    if deleted.rows_affected == 0 {
        return Err(Error::not_found("product", product_id));
    }

    txn.commit().await?;
    info!(
        "Deleted product {} and {} cart line(s)",
        product_id, removed_lines.rows_affected
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;
    use sea_orm::DatabaseConnection;

    fn new_product(name: &str, price: i64, stock: i32) -> NewProduct {
        NewProduct {
            name: name.to_string(),
            description: None,
            price,
            stock,
            category: "skin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_product_validation() -> Result<()> {
        let db = DatabaseConnection::Disconnected;

        // Test empty name validation
        let result = create_product(&db, new_product("   ", 10, 1)).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));

        // Test non-positive price validation
        let result = create_product(&db, new_product("Skin", 0, 1)).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidAmount { .. }));

        // Test negative stock validation
        let result = create_product(&db, new_product("Skin", 10, -1)).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_create_product_integration() -> Result<()> {
        let db = setup_test_db().await?;

        let product = create_test_product(&db, "  AWP Dragon Lore ", 300, 4).await?;

        assert_eq!(product.name, "AWP Dragon Lore");
        assert_eq!(product.price, 300);
        assert_eq!(product.stock, 4);
        assert!(product.is_active);

        let duplicate = create_test_product(&db, "AWP Dragon Lore", 10, 1).await;
        assert!(matches!(duplicate.unwrap_err(), Error::InvalidArgument { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_list_active_products_sorted_and_filtered() -> Result<()> {
        let db = setup_test_db().await?;

        let b = create_test_product(&db, "B Knife", 10, 1).await?;
        let a = create_test_product(&db, "A Gloves", 10, 1).await?;
        let hidden = create_test_product(&db, "C Sticker", 10, 1).await?;
        update_product(
            &db,
            hidden.id,
            ProductChanges {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await?;

        let products = list_active_products(&db).await?;
        assert_eq!(
            products.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );

        assert_eq!(list_products_by_category(&db, "skin").await?.len(), 2);
        assert!(list_products_by_category(&db, "privilege").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_update_product_integration() -> Result<()> {
        let db = setup_test_db().await?;
        let product = create_test_product(&db, "Original", 10, 3).await?;

        let updated = update_product(
            &db,
            product.id,
            ProductChanges {
                name: Some("Renamed".to_string()),
                price: Some(25),
                description: Some(Some("Shiny".to_string())),
                ..Default::default()
            },
        )
        .await?;

        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.price, 25);
        assert_eq!(updated.stock, 3);
        assert_eq!(updated.description.as_deref(), Some("Shiny"));

        let bad = update_product(
            &db,
            product.id,
            ProductChanges {
                price: Some(-1),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(bad.unwrap_err(), Error::InvalidAmount { .. }));

        let missing = update_product(&db, 999, ProductChanges::default()).await;
        assert!(matches!(missing.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_restock_never_goes_negative() -> Result<()> {
        let db = setup_test_db().await?;
        let product = create_test_product(&db, "Case", 5, 2).await?;

        assert_eq!(restock(&db, product.id, 3).await?.stock, 5);
        assert_eq!(restock(&db, product.id, -5).await?.stock, 0);

        let result = restock(&db, product.id, -1).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidArgument { .. }));
        assert_eq!(get_product(&db, product.id).await?.stock, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_product_removes_cart_lines() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let product = create_test_product(&db, "Doomed", 5, 2).await?;
        crate::core::cart::add_item(&db, account.id, product.id, 1).await?;

        delete_product(&db, product.id).await?;

        assert!(matches!(
            get_product(&db, product.id).await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(crate::core::cart::list_items(&db, account.id).await?.is_empty());

        let again = delete_product(&db, product.id).await;
        assert!(matches!(again.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }
}
