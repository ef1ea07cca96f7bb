//! Database configuration module.
//!
//! This module handles `SQLite` database connection and table creation using `SeaORM`.
//! Tables are generated from the entity definitions with `Schema::create_table_from_entity`,
//! so the schema always matches the Rust structs. Parent tables are created before the
//! tables that reference them.

use crate::entities::{
    Account, CartLine, InviteCode, LedgerEntry, Order, Product, Recharge, cart_line,
};
use crate::errors::Result;
use sea_orm::sea_query::Index;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use std::path::Path;
use tracing::{debug, info};

const DEFAULT_DATABASE_URL: &str = "sqlite://data/pointshop.sqlite?mode=rwc";

/// Gets the database URL from environment variable or returns default `SQLite` path.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Directory that must exist before `SQLite` can create the database file, if any.
fn sqlite_parent_dir(database_url: &str) -> Option<&Path> {
    let rest = database_url.strip_prefix("sqlite://")?;
    let file = rest.split('?').next().unwrap_or_default();
    Path::new(file)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
}

/// Establishes a connection to the database named by `DATABASE_URL`.
///
/// Falls back to a local `SQLite` file if no environment variable is set, creating its
/// directory when needed.
pub async fn create_connection() -> Result<DatabaseConnection> {
    let database_url = get_database_url();
    if let Some(dir) = sqlite_parent_dir(&database_url) {
        std::fs::create_dir_all(dir)?;
    }
    debug!("Connecting to database at {}", database_url);
    Database::connect(&database_url).await.map_err(Into::into)
}

/// Creates all tables (if missing) from the entity definitions.
///
/// Also creates the unique `(account_id, product_id)` index that keeps one cart line per
/// product per account.
pub async fn create_tables<C>(db: &C) -> Result<()>
where
    C: ConnectionTrait,
{
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    db.execute(builder.build(schema.create_table_from_entity(Account).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(Product).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(CartLine).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(Order).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(LedgerEntry).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(InviteCode).if_not_exists()))
        .await?;
    db.execute(builder.build(schema.create_table_from_entity(Recharge).if_not_exists()))
        .await?;

    let cart_line_index = Index::create()
        .name("idx_cart_lines_account_product")
        .table(CartLine)
        .col(cart_line::Column::AccountId)
        .col(cart_line::Column::ProductId)
        .unique()
        .if_not_exists()
        .to_owned();
    db.execute(builder.build(&cart_line_index)).await?;

    info!("Database tables ensured.");
    Ok(())
}
