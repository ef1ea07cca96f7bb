use dotenvy::dotenv;
use pointshop::{
    config::{database, settings},
    core::{
        account::NewAccount,
        admin, ledger,
        payment::RechargeService,
    },
    entities::Account,
    errors::Result,
};
use sea_orm::{DatabaseConnection, EntityTrait};
use std::env;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Seeds an administrator from `ADMIN_USERNAME` / `ADMIN_EMAIL` / `ADMIN_PASSWORD` when all
/// three are set.
async fn bootstrap_admin(db: &DatabaseConnection) -> Result<()> {
    let (Ok(username), Ok(email), Ok(password)) = (
        env::var("ADMIN_USERNAME"),
        env::var("ADMIN_EMAIL"),
        env::var("ADMIN_PASSWORD"),
    ) else {
        info!("ADMIN_USERNAME/ADMIN_EMAIL/ADMIN_PASSWORD not all set, skipping admin bootstrap.");
        return Ok(());
    };

    admin::bootstrap_admin(db, NewAccount::new(&username, &email, &password))
        .await
        .inspect(|created| info!("Administrator '{}' ready (id {}).", created.username, created.id))?;
    Ok(())
}

/// Compares every account's balance with its ledger and reports mismatches.
async fn audit_ledger(db: &DatabaseConnection) -> Result<usize> {
    let mut inconsistent = 0;
    for account in Account::find().all(db).await? {
        let audit = ledger::audit_balance(db, account.id).await?;
        if !audit.is_consistent() {
            inconsistent += 1;
            error!(
                "Ledger mismatch for account {} '{}': recorded {}, ledger sum {}",
                account.id, account.username, audit.recorded, audit.ledger_sum
            );
        }
    }
    Ok(inconsistent)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();

    // 3. Load the engine configuration
    let app_config = settings::load_app_configuration()
        .inspect_err(|e| error!("Failed to load configuration: {}", e))?;
    info!("Configuration loaded.");

    // 4. Connect and ensure the schema
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|_| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to initialize database: {}", e))?;

    // 5. Seed the first administrator
    bootstrap_admin(&db).await?;

    // 6. Build the recharge service; a misconfigured gateway stops startup
    let recharges = RechargeService::from_config(db.clone(), &app_config)
        .inspect_err(|e| error!("Payment gateway unusable: {}", e))?;

    // 7. Settle charges left open by a previous run
    let open = recharges.open_charges().await?;
    if !open.is_empty() {
        info!("Reconciling {} open charge(s).", open.len());
        for (charge_ref, status) in recharges.reconcile_open_charges().await? {
            info!("Charge {} is now {}.", charge_ref, status.as_str());
        }
    }

    // 8. Check that balances still match the ledger
    let inconsistent = audit_ledger(&db).await?;
    if inconsistent == 0 {
        info!("Ledger audit passed.");
    } else {
        warn!("Ledger audit found {} inconsistent account(s).", inconsistent);
    }

    Ok(())
}
