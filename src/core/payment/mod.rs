//! Payment reconciliation - Turns real-money charges into point credits.
//!
//! Each recharge attempt is a row in `recharges`, written before the gateway is
//! contacted and keyed by a unique `charge_ref`. Its status moves
//! `created → awaiting_confirmation → succeeded | failed | timed_out`, or to `cancelled`
//! from any open state. Crediting is a conditional status update from an open state to
//! `succeeded` in the same transaction as the ledger credit, so a charge is credited at
//! most once no matter how often or concurrently it is polled, and never after it was
//! cancelled.
//!
//! Gateway outages degrade instead of failing: after the retry budget is spent the
//! charge is left awaiting confirmation and the caller gets a structured receipt telling
//! the user to check back or ask an administrator for manual confirmation.

pub mod gateway;

use crate::{
    config::settings::{AppConfig, ExchangeRates, PaymentSettings},
    core::{account, admin, ledger, retry::with_write_retry},
    entities::{Recharge, recharge},
    errors::{Error, Result},
    models::{EntryKind, RechargeStatus},
};
use backon::{ExponentialBuilder, Retryable};
use gateway::{CreatedCharge, GatewayError, GatewayStatus, HttpGateway, PaymentGateway, SimulatedGateway};
use rand::Rng;
use sea_orm::{DatabaseConnection, QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};

/// What the caller shows the user after starting a recharge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    /// Our reference for the charge; pass it to [`RechargeService::poll_status`]
    pub charge_ref: String,
    /// Status after the create call
    pub status: RechargeStatus,
    /// Where the user pays (QR target), when the gateway provided one
    pub payment_url: Option<String>,
    /// True when the gateway could not be reached and the charge awaits manual checking
    pub degraded: bool,
    /// Short message for display
    pub message: String,
}

/// Recharge workflow bound to one database and one gateway.
#[derive(Clone)]
pub struct RechargeService {
    db: DatabaseConnection,
    gateway: Arc<dyn PaymentGateway>,
    settings: PaymentSettings,
    rates: ExchangeRates,
}

impl std::fmt::Debug for RechargeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RechargeService")
            .field("gateway", &self.gateway.name())
            .field("rates", &self.rates)
            .finish_non_exhaustive()
    }
}

fn open_status_values() -> Vec<&'static str> {
    RechargeStatus::open().iter().map(|s| s.as_str()).collect()
}

/// Points credited for `amount` currency units at `rate`, rounded to the nearest point.
#[allow(clippy::cast_possible_truncation)]
fn points_for(amount: f64, rate: f64) -> Result<i64> {
    let points = (amount * rate).round();
    if !points.is_finite() || points < 1.0 || points > i64::MAX as f64 {
        return Err(Error::InvalidAmount { amount });
    }
    Ok(points as i64)
}

fn new_charge_ref(account_id: i64) -> String {
    let suffix: u32 = rand::rng().random_range(0..1_000_000);
    format!(
        "RC{}-{}-{:06}",
        account_id,
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

impl RechargeService {
    /// Creates a service around an existing gateway.
    #[must_use]
    pub fn new(db: DatabaseConnection, gateway: Arc<dyn PaymentGateway>, config: &AppConfig) -> Self {
        Self {
            db,
            gateway,
            settings: config.payment.clone(),
            rates: config.exchange_rates.clone(),
        }
    }

    /// Creates a service with the gateway the configuration selects.
    ///
    /// Fails with [`Error::PaymentConfiguration`] if the HTTP gateway cannot be built; a
    /// misconfigured gateway is never silently replaced by the simulation.
    pub fn from_config(db: DatabaseConnection, config: &AppConfig) -> Result<Self> {
        let gateway: Arc<dyn PaymentGateway> = if config.payment.simulation {
            warn!("Payment simulation enabled: every charge will be reported as paid");
            Arc::new(SimulatedGateway)
        } else {
            Arc::new(HttpGateway::new(&config.payment).map_err(|e| {
                Error::PaymentConfiguration {
                    message: e.to_string(),
                }
            })?)
        };
        info!("Recharge service using {} gateway", gateway.name());
        Ok(Self::new(db, gateway, config))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn backoff(&self) -> ExponentialBuilder {
        let retry = &self.settings.retry;
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(retry.initial_backoff_ms))
            .with_factor(retry.backoff_factor as f32)
            .with_max_times(retry.max_attempts.saturating_sub(1) as usize)
    }

    async fn find_charge(&self, charge_ref: &str) -> Result<recharge::Model> {
        Recharge::find()
            .filter(recharge::Column::ChargeRef.eq(charge_ref))
            .one(&self.db)
            .await?
            .ok_or_else(|| Error::not_found("recharge", charge_ref))
    }

    /// Conditionally closes an open charge. Returns whether this call made the transition.
    async fn close_charge(&self, charge_ref: &str, to: RechargeStatus) -> Result<bool> {
        let now = chrono::Utc::now();
        let mut update = Recharge::update_many()
            .col_expr(recharge::Column::Status, Expr::value(to.as_str()))
            .col_expr(recharge::Column::UpdatedAt, Expr::value(now));
        if !to.is_open() {
            update = update.col_expr(recharge::Column::CompletedAt, Expr::value(now));
        }
        let result = update
            .filter(recharge::Column::ChargeRef.eq(charge_ref))
            .filter(recharge::Column::Status.is_in(open_status_values()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Starts a recharge of `amount` currency units for an account.
    ///
    /// Never fails because the gateway is down: in that case the receipt comes back
    /// `degraded` and awaiting confirmation, with no ledger change.
    ///
    /// # Errors
    /// - [`Error::InvalidAmount`] if `amount` is not a positive finite number, or is too
    ///   small to be worth a single point at the lowest configured rate
    /// - [`Error::NotFound`] / [`Error::AccountBanned`] for the account
    /// - [`Error::PaymentConfiguration`] if the gateway rejects our credentials
    #[instrument(skip(self))]
    pub async fn create_charge(&self, account_id: i64, amount: f64) -> Result<ChargeReceipt> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::InvalidAmount { amount });
        }
        // Every accepted charge must be worth at least one point at any tier
        points_for(amount, self.rates.min_rate())?;
        let owner = account::get_account(&self.db, account_id).await?;
        if owner.is_banned {
            return Err(Error::AccountBanned { account_id });
        }

        let charge_ref = new_charge_ref(account_id);
        let now = chrono::Utc::now();
        recharge::ActiveModel {
            charge_ref: Set(charge_ref.clone()),
            gateway_charge_id: Set(None),
            account_id: Set(account_id),
            amount: Set(amount),
            points: Set(None),
            status: Set(RechargeStatus::Created.as_str().to_string()),
            degraded: Set(false),
            payment_url: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        info!(
            "Recharge {} created: account_id={}, amount={:.2}",
            charge_ref, account_id, amount
        );

        let created = (|| async { self.gateway.create_charge(&charge_ref, amount).await })
            .retry(self.backoff())
            .when(GatewayError::is_retryable)
            .notify(|err: &GatewayError, delay: Duration| {
                warn!(
                    "Gateway create for {} failed ({}), retrying in {:?}",
                    charge_ref, err, delay
                );
            })
            .await;

        match created {
            Ok(created) => self.record_created(&charge_ref, created).await,
            Err(err @ (GatewayError::Unavailable(_) | GatewayError::Malformed(_))) => {
                self.record_degraded(&charge_ref, &err).await
            }
            Err(GatewayError::Rejected(reason)) => {
                self.close_charge(&charge_ref, RechargeStatus::Failed)
                    .await?;
                warn!("Gateway rejected recharge {}: {}", charge_ref, reason);
                Ok(ChargeReceipt {
                    charge_ref,
                    status: RechargeStatus::Failed,
                    payment_url: None,
                    degraded: false,
                    message: format!("The payment could not be started: {reason}"),
                })
            }
            Err(GatewayError::Configuration(message)) => {
                self.close_charge(&charge_ref, RechargeStatus::Failed)
                    .await?;
                error!("Payment gateway misconfigured: {}", message);
                Err(Error::PaymentConfiguration { message })
            }
        }
    }

    async fn record_created(&self, charge_ref: &str, created: CreatedCharge) -> Result<ChargeReceipt> {
        let status = match created.status {
            GatewayStatus::Failed => RechargeStatus::Failed,
            GatewayStatus::Paid | GatewayStatus::Pending => RechargeStatus::AwaitingConfirmation,
        };
        let mut update = Recharge::update_many()
            .col_expr(recharge::Column::Status, Expr::value(status.as_str()))
            .col_expr(
                recharge::Column::GatewayChargeId,
                Expr::value(created.gateway_charge_id.clone()),
            )
            .col_expr(
                recharge::Column::PaymentUrl,
                Expr::value(created.payment_url.clone()),
            )
            .col_expr(recharge::Column::UpdatedAt, Expr::value(chrono::Utc::now()));
        if status == RechargeStatus::Failed {
            update = update.col_expr(recharge::Column::CompletedAt, Expr::value(chrono::Utc::now()));
        }
        update
            .filter(recharge::Column::ChargeRef.eq(charge_ref))
            .filter(recharge::Column::Status.eq(RechargeStatus::Created.as_str()))
            .exec(&self.db)
            .await?;

        debug!(
            "Recharge {} handed to gateway as {}",
            charge_ref, created.gateway_charge_id
        );
        let message = match status {
            RechargeStatus::Failed => created
                .message
                .unwrap_or_else(|| "The payment could not be started.".to_string()),
            _ => "Complete the payment, then check its status.".to_string(),
        };
        Ok(ChargeReceipt {
            charge_ref: charge_ref.to_string(),
            status,
            payment_url: created.payment_url,
            degraded: false,
            message,
        })
    }

    async fn record_degraded(&self, charge_ref: &str, err: &GatewayError) -> Result<ChargeReceipt> {
        Recharge::update_many()
            .col_expr(
                recharge::Column::Status,
                Expr::value(RechargeStatus::AwaitingConfirmation.as_str()),
            )
            .col_expr(recharge::Column::Degraded, Expr::value(true))
            .col_expr(recharge::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(recharge::Column::ChargeRef.eq(charge_ref))
            .filter(recharge::Column::Status.eq(RechargeStatus::Created.as_str()))
            .exec(&self.db)
            .await?;

        error!(
            "Gateway unavailable for recharge {} after retries: {}",
            charge_ref, err
        );
        let message = Error::GatewayUnavailable {
            message: err.to_string(),
        }
        .user_message();
        Ok(ChargeReceipt {
            charge_ref: charge_ref.to_string(),
            status: RechargeStatus::AwaitingConfirmation,
            payment_url: None,
            degraded: true,
            message,
        })
    }

    /// Credits a charge exactly once. Returns the charge's status afterwards.
    async fn finalize(&self, charge: &recharge::Model) -> Result<RechargeStatus> {
        with_write_retry("recharge credit", || self.finalize_once(charge)).await
    }

    async fn finalize_once(&self, charge: &recharge::Model) -> Result<RechargeStatus> {
        let txn = self.db.begin().await?;

        let owner = account::get_account(&txn, charge.account_id).await?;
        let rate = self.rates.rate_for(owner.tier()?);
        let points = points_for(charge.amount, rate)?;

        let now = chrono::Utc::now();
        let claimed = Recharge::update_many()
            .col_expr(
                recharge::Column::Status,
                Expr::value(RechargeStatus::Succeeded.as_str()),
            )
            .col_expr(recharge::Column::Points, Expr::value(points))
            .col_expr(recharge::Column::CompletedAt, Expr::value(now))
            .col_expr(recharge::Column::UpdatedAt, Expr::value(now))
            .filter(recharge::Column::ChargeRef.eq(charge.charge_ref.as_str()))
            .filter(recharge::Column::Status.is_in(open_status_values()))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            let current = self.find_charge(&charge.charge_ref).await?.status()?;
            debug!(
                "Recharge {} already closed as {}, not crediting",
                charge.charge_ref,
                current.as_str()
            );
            return Ok(current);
        }

        ledger::credit_in(
            &txn,
            charge.account_id,
            points,
            EntryKind::Recharge,
            format!("Recharge of {:.2} at {} points per unit", charge.amount, rate),
            Some(charge.charge_ref.clone()),
        )
        .await?;
        txn.commit().await?;

        info!(
            "Recharge {} succeeded: account_id={}, points={}",
            charge.charge_ref, charge.account_id, points
        );
        Ok(RechargeStatus::Succeeded)
    }

    /// One gateway query for an open charge. Transient query failures count as still
    /// pending; rejected credentials are fatal.
    async fn check_once(&self, charge: &recharge::Model) -> Result<Option<RechargeStatus>> {
        let Some(gateway_id) = charge.gateway_charge_id.as_deref() else {
            return Ok(None);
        };
        match self.gateway.check_charge(gateway_id).await {
            Ok(GatewayStatus::Paid) => self.finalize(charge).await.map(Some),
            Ok(GatewayStatus::Failed) => {
                self.close_charge(&charge.charge_ref, RechargeStatus::Failed)
                    .await?;
                let current = self.find_charge(&charge.charge_ref).await?.status()?;
                info!("Recharge {} closed as {}", charge.charge_ref, current.as_str());
                Ok(Some(current))
            }
            Ok(GatewayStatus::Pending) => Ok(None),
            Err(GatewayError::Configuration(message)) => {
                error!(
                    "Payment gateway misconfigured while checking {}: {}",
                    charge.charge_ref, message
                );
                Err(Error::PaymentConfiguration { message })
            }
            Err(err) => {
                warn!("Status check for {} failed: {}", charge.charge_ref, err);
                Ok(None)
            }
        }
    }

    /// Polls the gateway until the charge reaches a terminal state or the polling budget
    /// runs out, in which case the charge becomes `timed_out` (still confirmable later).
    ///
    /// Closed charges return their status without contacting the gateway, so repeated
    /// polls are harmless. Fails with [`Error::PaymentConfiguration`] if the gateway
    /// rejects our credentials; the charge then stays open.
    #[instrument(skip(self))]
    pub async fn poll_status(&self, charge_ref: &str) -> Result<RechargeStatus> {
        let polling = &self.settings.polling;

        for attempt in 1..=polling.attempts {
            let charge = self.find_charge(charge_ref).await?;
            let status = charge.status()?;
            if !status.is_open() {
                return Ok(status);
            }
            if charge.gateway_charge_id.is_none() {
                debug!("Recharge {} has no gateway id, awaiting manual confirmation", charge_ref);
                return Ok(status);
            }

            if let Some(settled) = self.check_once(&charge).await? {
                return Ok(settled);
            }
            if attempt < polling.attempts {
                tokio::time::sleep(polling.interval()).await;
            }
        }

        if self
            .close_charge(charge_ref, RechargeStatus::TimedOut)
            .await?
        {
            warn!(
                "Recharge {} timed out after {} status checks",
                charge_ref, polling.attempts
            );
        }
        self.find_charge(charge_ref).await?.status()
    }

    /// Cancels an open charge owned by `account_id`. A cancelled charge is never credited,
    /// even if the gateway later reports it paid.
    #[instrument(skip(self))]
    pub async fn cancel(&self, account_id: i64, charge_ref: &str) -> Result<recharge::Model> {
        let charge = self.find_charge(charge_ref).await?;
        if charge.account_id != account_id {
            return Err(Error::not_found("recharge", charge_ref));
        }

        if !self
            .close_charge(charge_ref, RechargeStatus::Cancelled)
            .await?
        {
            let current = self.find_charge(charge_ref).await?;
            return Err(Error::InvalidState {
                message: format!("recharge {} is already {}", charge_ref, current.status),
            });
        }

        info!("Recharge {} cancelled by account {}", charge_ref, account_id);
        self.find_charge(charge_ref).await
    }

    /// Administrator confirmation that money arrived for a degraded or timed-out charge.
    /// Uses the same exactly-once credit path as polling.
    #[instrument(skip(self))]
    pub async fn confirm_manually(&self, actor_id: i64, charge_ref: &str) -> Result<RechargeStatus> {
        admin::require_admin(&self.db, actor_id).await?;
        let charge = self.find_charge(charge_ref).await?;
        let status = charge.status()?;
        if !status.is_open() {
            return Err(Error::InvalidState {
                message: format!("recharge {} is already {}", charge_ref, status.as_str()),
            });
        }

        let result = self.finalize(&charge).await?;
        info!(
            "Recharge {} manually confirmed by admin {}: {}",
            charge_ref,
            actor_id,
            result.as_str()
        );
        Ok(result)
    }

    /// An account's recharge attempts, newest first.
    pub async fn list_recharges(&self, account_id: i64) -> Result<Vec<recharge::Model>> {
        Recharge::find()
            .filter(recharge::Column::AccountId.eq(account_id))
            .order_by_desc(recharge::Column::CreatedAt)
            .order_by_desc(recharge::Column::Id)
            .all(&self.db)
            .await
            .map_err(Into::into)
    }

    /// Every charge that can still be credited or cancelled, oldest first.
    pub async fn open_charges(&self) -> Result<Vec<recharge::Model>> {
        Recharge::find()
            .filter(recharge::Column::Status.is_in(open_status_values()))
            .order_by_asc(recharge::Column::Id)
            .all(&self.db)
            .await
            .map_err(Into::into)
    }

    /// Checks every open charge once with the gateway and settles those with an answer.
    /// Returns the charges that changed state.
    pub async fn reconcile_open_charges(&self) -> Result<Vec<(String, RechargeStatus)>> {
        let mut settled = Vec::new();
        for charge in self.open_charges().await? {
            if let Some(status) = self.check_once(&charge).await? {
                settled.push((charge.charge_ref, status));
            }
        }
        info!("Reconciliation sweep settled {} charge(s)", settled.len());
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::settings::{PollingSettings, RetrySettings};
    use crate::models::PrivilegeTier;
    use crate::test_utils::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gateway double that replays scripted answers, then falls back to defaults.
    #[derive(Default)]
    struct ScriptedGateway {
        creates: Mutex<VecDeque<std::result::Result<CreatedCharge, GatewayError>>>,
        checks: Mutex<VecDeque<std::result::Result<GatewayStatus, GatewayError>>>,
        fallback_check: Mutex<Option<GatewayStatus>>,
        create_calls: AtomicUsize,
        check_calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn with_creates(
            self,
            creates: Vec<std::result::Result<CreatedCharge, GatewayError>>,
        ) -> Self {
            *self.creates.lock().unwrap() = creates.into();
            self
        }

        fn with_checks(self, checks: Vec<std::result::Result<GatewayStatus, GatewayError>>) -> Self {
            *self.checks.lock().unwrap() = checks.into();
            self
        }

        fn set_fallback_check(&self, status: GatewayStatus) {
            *self.fallback_check.lock().unwrap() = Some(status);
        }

        fn create_calls(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }

        fn check_calls(&self) -> usize {
            self.check_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_charge(
            &self,
            charge_ref: &str,
            _amount: f64,
        ) -> std::result::Result<CreatedCharge, GatewayError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.creates.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(CreatedCharge {
                    gateway_charge_id: format!("gw-{charge_ref}"),
                    payment_url: Some(format!("https://pay.example.com/{charge_ref}")),
                    status: GatewayStatus::Pending,
                    message: None,
                })
            })
        }

        async fn check_charge(
            &self,
            _gateway_charge_id: &str,
        ) -> std::result::Result<GatewayStatus, GatewayError> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            self.checks.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(self
                    .fallback_check
                    .lock()
                    .unwrap()
                    .unwrap_or(GatewayStatus::Pending))
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.payment.retry = RetrySettings {
            max_attempts: 3,
            initial_backoff_ms: 0,
            backoff_factor: 2.0,
        };
        config.payment.polling = PollingSettings {
            attempts: 3,
            interval_ms: 0,
        };
        config
    }

    fn service(
        db: &DatabaseConnection,
        gateway: &Arc<ScriptedGateway>,
        config: &AppConfig,
    ) -> RechargeService {
        let gateway: Arc<dyn PaymentGateway> = Arc::clone(gateway) as Arc<dyn PaymentGateway>;
        RechargeService::new(db.clone(), gateway, config)
    }

    fn unavailable() -> std::result::Result<CreatedCharge, GatewayError> {
        Err(GatewayError::Unavailable("connection refused".to_string()))
    }

    #[test]
    fn test_points_rounding() {
        assert_eq!(points_for(50.0, 100.0).unwrap(), 5000);
        assert_eq!(points_for(0.015, 100.0).unwrap(), 2);
        assert!(points_for(0.001, 100.0).is_err());
        assert!(points_for(f64::NAN, 100.0).is_err());
    }

    #[test]
    fn test_charge_refs_are_distinct() {
        let a = new_charge_ref(7);
        assert!(a.starts_with("RC7-"));
        assert_ne!(a, new_charge_ref(7));
    }

    #[tokio::test]
    async fn test_recharge_credits_exactly_once() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_checks(vec![
            Ok(GatewayStatus::Pending),
            Ok(GatewayStatus::Paid),
        ]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 50.0).await?;
        assert_eq!(receipt.status, RechargeStatus::AwaitingConfirmation);
        assert!(!receipt.degraded);
        assert!(receipt.payment_url.is_some());

        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Succeeded);
        assert_eq!(ledger::balance(&db, account.id).await?, 5000);

        // Polling again neither contacts the gateway nor credits twice
        let checks = gateway.check_calls();
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Succeeded);
        assert_eq!(gateway.check_calls(), checks);
        assert_eq!(ledger::balance(&db, account.id).await?, 5000);

        let entries = ledger::list_entries(&db, account.id).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind()?, EntryKind::Recharge);
        assert_eq!(entries[0].reference.as_deref(), Some(receipt.charge_ref.as_str()));

        let stored = svc.list_recharges(account.id).await?;
        assert_eq!(stored[0].points, Some(5000));
        assert!(stored[0].completed_at.is_some());
        assert!(ledger::audit_balance(&db, account.id).await?.is_consistent());

        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_polls_credit_once() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_fallback_check(GatewayStatus::Paid);
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 10.0).await?;
        let (a, b) = tokio::join!(
            svc.poll_status(&receipt.charge_ref),
            svc.poll_status(&receipt.charge_ref)
        );
        assert_eq!(a?, RechargeStatus::Succeeded);
        assert_eq!(b?, RechargeStatus::Succeeded);
        assert_eq!(ledger::balance(&db, account.id).await?, 1000);

        Ok(())
    }

    #[tokio::test]
    async fn test_rate_depends_on_tier_and_promotion() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        set_test_tier(&db, account.id, PrivilegeTier::Vip).await?;
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_fallback_check(GatewayStatus::Paid);

        let svc = service(&db, &gateway, &test_config());
        let receipt = svc.create_charge(account.id, 10.0).await?;
        svc.poll_status(&receipt.charge_ref).await?;
        assert_eq!(ledger::balance(&db, account.id).await?, 1200);

        let mut promo = test_config();
        promo.exchange_rates.promotion_active = true;
        let bob = create_test_account(&db, "bob").await?;
        let svc = service(&db, &gateway, &promo);
        let receipt = svc.create_charge(bob.id, 10.0).await?;
        svc.poll_status(&receipt.charge_ref).await?;
        assert_eq!(ledger::balance(&db, bob.id).await?, 1500);

        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_outage_degrades_without_ledger_change() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let admin = create_test_admin(&db, "root").await?;
        let gateway = Arc::new(
            ScriptedGateway::default().with_creates(vec![unavailable(), unavailable(), unavailable()]),
        );
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 50.0).await?;
        assert_eq!(gateway.create_calls(), 3);
        assert!(receipt.degraded);
        assert_eq!(receipt.status, RechargeStatus::AwaitingConfirmation);
        assert!(receipt.message.contains("may still be processing"));
        assert_eq!(ledger::balance(&db, account.id).await?, 0);
        assert!(ledger::list_entries(&db, account.id).await?.is_empty());

        // Without a gateway id there is nothing to poll
        assert_eq!(
            svc.poll_status(&receipt.charge_ref).await?,
            RechargeStatus::AwaitingConfirmation
        );
        assert_eq!(gateway.check_calls(), 0);
        assert_eq!(svc.open_charges().await?.len(), 1);

        // Only an administrator may confirm it
        let denied = svc.confirm_manually(account.id, &receipt.charge_ref).await;
        assert!(matches!(denied.unwrap_err(), Error::PermissionDenied { .. }));

        assert_eq!(
            svc.confirm_manually(admin.id, &receipt.charge_ref).await?,
            RechargeStatus::Succeeded
        );
        assert_eq!(ledger::balance(&db, account.id).await?, 5000);

        let again = svc.confirm_manually(admin.id, &receipt.charge_ref).await;
        assert!(matches!(again.unwrap_err(), Error::InvalidState { .. }));
        assert_eq!(ledger::balance(&db, account.id).await?, 5000);

        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_creates(vec![unavailable()]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 5.0).await?;
        assert_eq!(gateway.create_calls(), 2);
        assert!(!receipt.degraded);
        assert_eq!(receipt.status, RechargeStatus::AwaitingConfirmation);

        Ok(())
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried_or_simulated() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_creates(vec![Err(
            GatewayError::Configuration("HTTP 401 Unauthorized".to_string()),
        )]));
        let svc = service(&db, &gateway, &test_config());

        let result = svc.create_charge(account.id, 50.0).await;
        assert!(matches!(result.unwrap_err(), Error::PaymentConfiguration { .. }));
        assert_eq!(gateway.create_calls(), 1);

        let stored = svc.list_recharges(account.id).await?;
        assert_eq!(stored[0].status()?, RechargeStatus::Failed);
        assert!(svc.open_charges().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_charge_fails() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_creates(vec![Err(
            GatewayError::Rejected("amount below minimum".to_string()),
        )]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 0.5).await?;
        assert_eq!(receipt.status, RechargeStatus::Failed);
        assert!(receipt.message.contains("amount below minimum"));

        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_charge_is_never_credited() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default());
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 50.0).await?;
        let cancelled = svc.cancel(account.id, &receipt.charge_ref).await?;
        assert_eq!(cancelled.status()?, RechargeStatus::Cancelled);

        // The gateway reports it paid after all
        gateway.set_fallback_check(GatewayStatus::Paid);
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Cancelled);
        assert_eq!(svc.reconcile_open_charges().await?.len(), 0);
        assert_eq!(ledger::balance(&db, account.id).await?, 0);

        let twice = svc.cancel(account.id, &receipt.charge_ref).await;
        assert!(matches!(twice.unwrap_err(), Error::InvalidState { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_requires_owner() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let other = create_test_account(&db, "bob").await?;
        let gateway = Arc::new(ScriptedGateway::default());
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 5.0).await?;
        let result = svc.cancel(other.id, &receipt.charge_ref).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_poll_times_out_then_settles_later() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_checks(vec![
            Ok(GatewayStatus::Pending),
            Err(GatewayError::Unavailable("timeout".to_string())),
            Ok(GatewayStatus::Pending),
        ]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 20.0).await?;
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::TimedOut);
        assert_eq!(gateway.check_calls(), 3);
        assert_eq!(ledger::balance(&db, account.id).await?, 0);

        // A timed-out charge stays open for reconciliation
        gateway.set_fallback_check(GatewayStatus::Paid);
        let settled = svc.reconcile_open_charges().await?;
        assert_eq!(settled, vec![(receipt.charge_ref.clone(), RechargeStatus::Succeeded)]);
        assert_eq!(ledger::balance(&db, account.id).await?, 2000);

        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_reported_failure() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway =
            Arc::new(ScriptedGateway::default().with_checks(vec![Ok(GatewayStatus::Failed)]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 20.0).await?;
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Failed);
        assert_eq!(ledger::balance(&db, account.id).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_create_charge_validation() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let admin = create_test_admin(&db, "root").await?;
        let gateway = Arc::new(ScriptedGateway::default());
        let svc = service(&db, &gateway, &test_config());

        for amount in [0.0, -5.0, f64::INFINITY, 0.004] {
            let result = svc.create_charge(account.id, amount).await;
            assert!(matches!(result.unwrap_err(), Error::InvalidAmount { .. }));
        }
        assert!(matches!(
            svc.create_charge(999, 5.0).await.unwrap_err(),
            Error::NotFound { .. }
        ));

        admin::set_banned(&db, admin.id, account.id, true).await?;
        assert!(matches!(
            svc.create_charge(account.id, 5.0).await.unwrap_err(),
            Error::AccountBanned { .. }
        ));
        assert_eq!(gateway.create_calls(), 0);

        Ok(())
    }

    #[test]
    fn test_from_config_refuses_missing_gateway() {
        let db = sea_orm::DatabaseConnection::Disconnected;
        let result = RechargeService::from_config(db, &AppConfig::default());
        assert!(matches!(result.unwrap_err(), Error::PaymentConfiguration { .. }));

        let db = sea_orm::DatabaseConnection::Disconnected;
        let mut config = AppConfig::default();
        config.payment.simulation = true;
        assert!(RechargeService::from_config(db, &config).is_ok());
    }

    #[tokio::test]
    async fn test_amount_below_one_point_never_reaches_gateway() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default());
        let mut config = test_config();
        config.exchange_rates.vip = 50.0;
        let svc = service(&db, &gateway, &config);

        // 0.004 * 100 rounds to 0 points
        let result = svc.create_charge(account.id, 0.004).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidAmount { .. }));
        // 0.009 is one point for a normal account but zero at the VIP rate of 50
        let result = svc.create_charge(account.id, 0.009).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidAmount { .. }));

        assert_eq!(gateway.create_calls(), 0);
        assert!(svc.list_recharges(account.id).await?.is_empty());
        assert!(svc.open_charges().await?.is_empty());

        let receipt = svc.create_charge(account.id, 0.02).await?;
        gateway.set_fallback_check(GatewayStatus::Paid);
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Succeeded);
        assert_eq!(ledger::balance(&db, account.id).await?, 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_credentials_while_polling_are_fatal() -> Result<()> {
        let (db, account) = setup_with_funded_account(0).await?;
        let gateway = Arc::new(ScriptedGateway::default().with_checks(vec![Err(
            GatewayError::Configuration("HTTP 403 Forbidden".to_string()),
        )]));
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 10.0).await?;
        let result = svc.poll_status(&receipt.charge_ref).await;
        assert!(matches!(result.unwrap_err(), Error::PaymentConfiguration { .. }));
        assert_eq!(gateway.check_calls(), 1);

        // Not timed out: the charge is still open once the credentials are fixed
        let stored = svc.list_recharges(account.id).await?;
        assert_eq!(stored[0].status()?, RechargeStatus::AwaitingConfirmation);
        gateway.set_fallback_check(GatewayStatus::Paid);
        assert_eq!(svc.poll_status(&receipt.charge_ref).await?, RechargeStatus::Succeeded);
        assert_eq!(ledger::balance(&db, account.id).await?, 1000);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_polls_across_connections_credit_once() -> Result<()> {
        let (db, _dir) = setup_file_test_db().await?;
        let account = create_test_account(&db, "alice").await?;
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_fallback_check(GatewayStatus::Paid);
        let svc = service(&db, &gateway, &test_config());

        let receipt = svc.create_charge(account.id, 10.0).await?;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let svc = svc.clone();
                let charge_ref = receipt.charge_ref.clone();
                tokio::spawn(async move { svc.poll_status(&charge_ref).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap()?, RechargeStatus::Succeeded);
        }

        assert_eq!(ledger::balance(&db, account.id).await?, 1000);
        assert_eq!(ledger::list_entries(&db, account.id).await?.len(), 1);
        assert!(ledger::audit_balance(&db, account.id).await?.is_consistent());
        Ok(())
    }
}
