//! Shared test utilities.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    core::{account, catalog, ledger},
    entities,
    errors::Result,
    models::{EntryKind, PrivilegeTier},
};
use sea_orm::{ActiveModelTrait, ConnectOptions, DatabaseConnection, EntityTrait, Set};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Creates an in-memory `SQLite` database with all tables initialized.
///
/// The pool is pinned to one connection: every connection to `sqlite::memory:` is a
/// separate database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    init_test_tracing();
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = sea_orm::Database::connect(options).await?;
    crate::config::database::create_tables(&db).await?;
    Ok(db)
}

/// Creates a file-backed `SQLite` database with a multi-connection pool.
///
/// Unlike [`setup_test_db`], concurrent callers here really hold separate connections and
/// compete for the write lock. The database lives until the returned directory is dropped.
pub async fn setup_file_test_db() -> Result<(DatabaseConnection, TempDir)> {
    init_test_tracing();
    let dir = TempDir::new()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("shop.sqlite").display());
    let mut options = ConnectOptions::new(url);
    options.max_connections(8).sqlx_logging(false);
    let db = sea_orm::Database::connect(options).await?;
    crate::config::database::create_tables(&db).await?;
    Ok((db, dir))
}

/// Creates a normal-tier test account with zero balance.
///
/// # Defaults
/// * `email`: `"<username>@example.com"`
/// * `password`: `"password123"`
pub async fn create_test_account(
    db: &DatabaseConnection,
    username: &str,
) -> Result<entities::account::Model> {
    account::register(db, account::NewAccount::new(username, &format!("{username}@example.com"), "password123"))
        .await
}

/// Creates an administrator account through the privileged path.
pub async fn create_test_admin(
    db: &DatabaseConnection,
    username: &str,
) -> Result<entities::account::Model> {
    crate::core::admin::bootstrap_admin(
        db,
        account::NewAccount::new(username, &format!("{username}@example.com"), "password123"),
    )
    .await
}

/// Sets an account's tier directly, bypassing the admin surface.
pub async fn set_test_tier(
    db: &DatabaseConnection,
    account_id: i64,
    tier: PrivilegeTier,
) -> Result<entities::account::Model> {
    let account = entities::Account::find_by_id(account_id)
        .one(db)
        .await?
        .ok_or_else(|| crate::errors::Error::not_found("account", account_id))?;
    let mut active: entities::account::ActiveModel = account.into();
    active.privilege_tier = Set(tier.as_str().to_string());
    active.update(db).await.map_err(Into::into)
}

/// Credits points to an account through the ledger, as a recharge.
pub async fn fund_account(db: &DatabaseConnection, account_id: i64, points: i64) -> Result<()> {
    ledger::credit(
        db,
        account_id,
        points,
        EntryKind::Recharge,
        "Test funding".to_string(),
        None,
    )
    .await?;
    Ok(())
}

/// Creates an active test product.
///
/// # Defaults
/// * `category`: `"skin"`
/// * `description`: None
pub async fn create_test_product(
    db: &DatabaseConnection,
    name: &str,
    price: i64,
    stock: i32,
) -> Result<entities::product::Model> {
    catalog::create_product(
        db,
        catalog::NewProduct {
            name: name.to_string(),
            description: None,
            price,
            stock,
            category: "skin".to_string(),
        },
    )
    .await
}

/// Sets up a database with one funded account.
/// Returns (db, account) for common test scenarios.
pub async fn setup_with_funded_account(
    balance: i64,
) -> Result<(DatabaseConnection, entities::account::Model)> {
    let db = setup_test_db().await?;
    let account = create_test_account(&db, "alice").await?;
    if balance > 0 {
        fund_account(&db, account.id, balance).await?;
    }
    let account = account::get_account(&db, account.id).await?;
    Ok((db, account))
}
