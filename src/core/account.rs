//! Account business logic - Registration, login and self-service profile edits.
//!
//! Registration inserts the account and redeems its invite code (if any) in one
//! transaction: a code that is already used, missing, or grants a tier that cannot be
//! self-assigned rolls the whole signup back. Passwords are stored as Argon2 PHC strings,
//! which embed their own salt and parameters.

use crate::{
    core::{invite, retry::with_write_retry},
    entities::{Account, account},
    errors::{Error, Result},
    models::PrivilegeTier,
};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sea_orm::{Set, TransactionTrait, prelude::*};
use tokio::task;
use tracing::{info, instrument, warn};

const USERNAME_MIN_CHARS: usize = 3;
const USERNAME_MAX_CHARS: usize = 50;
const PASSWORD_MIN_CHARS: usize = 6;

/// Registration input.
#[derive(Clone)]
pub struct NewAccount {
    /// Login name
    pub username: String,
    /// Contact email
    pub email: String,
    /// Plain-text password, hashed before storage
    pub password: String,
    /// Invite code to redeem during registration
    pub invite_code: Option<String>,
}

impl NewAccount {
    /// Registration input without an invite code.
    #[must_use]
    pub fn new(username: &str, email: &str, password: &str) -> Self {
        Self {
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
            invite_code: None,
        }
    }

    /// Attaches an invite code to redeem.
    #[must_use]
    pub fn with_invite(mut self, code: &str) -> Self {
        let code = code.trim();
        self.invite_code = (!code.is_empty()).then(|| code.to_string());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        validate_email(&self.email)?;
        validate_password(&self.password)
    }
}

impl std::fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("invite_code", &self.invite_code)
            .finish_non_exhaustive()
    }
}

/// Self-service profile changes. `None` leaves a field untouched.
#[derive(Default, Clone)]
pub struct ProfileUpdate {
    /// New login name
    pub username: Option<String>,
    /// New email
    pub email: Option<String>,
    /// New plain-text password
    pub password: Option<String>,
}

impl std::fmt::Debug for ProfileUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileUpdate")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

fn validate_username(username: &str) -> Result<()> {
    let chars = username.chars().count();
    if !(USERNAME_MIN_CHARS..=USERNAME_MAX_CHARS).contains(&chars) {
        return Err(Error::invalid_argument(format!(
            "username must be {USERNAME_MIN_CHARS} to {USERNAME_MAX_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    };
    if !valid {
        return Err(Error::invalid_argument(format!(
            "'{email}' is not a valid email address"
        )));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < PASSWORD_MIN_CHARS {
        return Err(Error::invalid_argument(format!(
            "password must be at least {PASSWORD_MIN_CHARS} characters"
        )));
    }
    Ok(())
}

#[cfg(not(test))]
fn hasher() -> Result<Argon2<'static>> {
    Ok(Argon2::default())
}

// Minimum-cost parameters keep the test suite fast.
#[cfg(test)]
fn hasher() -> Result<Argon2<'static>> {
    let params = argon2::Params::new(argon2::Params::MIN_M_COST, 1, 1, None)
        .map_err(|e| Error::Internal {
            message: format!("invalid Argon2 params: {e}"),
        })?;
    Ok(Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        params,
    ))
}

fn hash_password_blocking(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    hasher()?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal {
            message: format!("failed to hash password: {e}"),
        })
}

fn verify_password_blocking(password: &str, password_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(password_hash).map_err(|e| Error::Internal {
        message: format!("invalid password hash format: {e}"),
    })?;
    Ok(hasher()?
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Hashes a password off the async runtime.
pub(crate) async fn hash_password(password: &str) -> Result<String> {
    let password = password.to_string();
    task::spawn_blocking(move || hash_password_blocking(&password))
        .await
        .map_err(|e| Error::Internal {
            message: format!("password hashing task failed: {e}"),
        })?
}

async fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let password = password.to_string();
    let password_hash = password_hash.to_string();
    task::spawn_blocking(move || verify_password_blocking(&password, &password_hash))
        .await
        .map_err(|e| Error::Internal {
            message: format!("password verification task failed: {e}"),
        })?
}

/// Fails with [`Error::AccountExists`] if the username or email is taken by an account
/// other than `except`.
pub(crate) async fn ensure_unique<C>(
    db: &C,
    username: Option<&str>,
    email: Option<&str>,
    except: Option<i64>,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let mut checks = Vec::new();
    if let Some(username) = username {
        checks.push(("username", account::Column::Username, username));
    }
    if let Some(email) = email {
        checks.push(("email", account::Column::Email, email));
    }

    for (field, column, value) in checks {
        let mut query = Account::find().filter(column.eq(value));
        if let Some(id) = except {
            query = query.filter(account::Column::Id.ne(id));
        }
        if query.one(db).await?.is_some() {
            return Err(Error::AccountExists {
                field,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Inserts an account row with the given tier. Caller validates, hashes the password
/// and checks uniqueness.
pub(crate) async fn insert_account<C>(
    db: &C,
    new: &NewAccount,
    password_hash: &str,
    tier: PrivilegeTier,
) -> Result<account::Model>
where
    C: ConnectionTrait,
{
    let now = chrono::Utc::now();
    account::ActiveModel {
        username: Set(new.username.clone()),
        email: Set(new.email.clone()),
        password_hash: Set(password_hash.to_string()),
        balance: Set(0),
        privilege_tier: Set(tier.as_str().to_string()),
        is_banned: Set(false),
        invite_code_used: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(Into::into)
}

/// Registers a new account with a zero balance.
///
/// Without an invite code the account is `normal`. With one, the code is redeemed for the
/// new account inside the same transaction and its tier applied.
///
/// # Errors
/// - [`Error::InvalidArgument`] for a malformed username, email or password
/// - [`Error::AccountExists`] if the username or email is taken
/// - [`Error::NotFound`] / [`Error::AlreadyUsed`] for a bad invite code
/// - [`Error::PermissionDenied`] if the code grants administrator privileges
#[instrument(skip(db))]
pub async fn register<C>(db: &C, new: NewAccount) -> Result<account::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    new.validate()?;
    let password_hash = hash_password(&new.password).await?;

    let created = with_write_retry("registration", || {
        register_once(db, &new, &password_hash)
    })
    .await?;
    info!(
        "Registered account {} '{}' ({})",
        created.id, created.username, created.privilege_tier
    );
    Ok(created)
}

async fn register_once<C>(db: &C, new: &NewAccount, password_hash: &str) -> Result<account::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    ensure_unique(&txn, Some(&new.username), Some(&new.email), None).await?;

    let created = insert_account(&txn, new, password_hash, PrivilegeTier::Normal).await?;

    let created = match &new.invite_code {
        Some(code) => {
            let tier = invite::redeem_in(&txn, code, created.id).await?;
            if tier == PrivilegeTier::Admin {
                warn!(
                    "Rejected registration of '{}' with administrator invite code",
                    new.username
                );
                return Err(Error::PermissionDenied {
                    message: "administrator accounts cannot be created with an invite code"
                        .to_string(),
                });
            }
            let mut active: account::ActiveModel = created.into();
            active.privilege_tier = Set(tier.as_str().to_string());
            active.invite_code_used = Set(Some(code.clone()));
            active.update(&txn).await?
        }
        None => created,
    };

    txn.commit().await?;
    Ok(created)
}

/// Checks credentials and returns the account.
///
/// Unknown usernames and wrong passwords are indistinguishable to the caller.
#[instrument(skip(db, password))]
pub async fn authenticate<C>(db: &C, username: &str, password: &str) -> Result<account::Model>
where
    C: ConnectionTrait,
{
    let Some(found) = Account::find()
        .filter(account::Column::Username.eq(username.trim()))
        .one(db)
        .await?
    else {
        return Err(Error::InvalidCredentials);
    };

    if !verify_password(password, &found.password_hash).await? {
        return Err(Error::InvalidCredentials);
    }
    if found.is_banned {
        return Err(Error::AccountBanned {
            account_id: found.id,
        });
    }
    Ok(found)
}

/// Retrieves an account by id.
pub async fn get_account<C>(db: &C, account_id: i64) -> Result<account::Model>
where
    C: ConnectionTrait,
{
    Account::find_by_id(account_id)
        .one(db)
        .await?
        .ok_or_else(|| Error::not_found("account", account_id))
}

/// Applies self-service profile changes. Tier and balance are never touched here.
#[instrument(skip(db))]
pub async fn update_profile<C>(
    db: &C,
    account_id: i64,
    changes: ProfileUpdate,
) -> Result<account::Model>
where
    C: ConnectionTrait + TransactionTrait,
{
    let username = changes.username.as_deref().map(str::trim);
    let email = changes.email.as_deref().map(str::trim);
    if let Some(username) = username {
        validate_username(username)?;
    }
    if let Some(email) = email {
        validate_email(email)?;
    }
    if let Some(password) = &changes.password {
        validate_password(password)?;
    }

    let txn = db.begin().await?;
    let existing = get_account(&txn, account_id).await?;
    ensure_unique(&txn, username, email, Some(account_id)).await?;

    let mut active: account::ActiveModel = existing.into();
    if let Some(username) = username {
        active.username = Set(username.to_string());
    }
    if let Some(email) = email {
        active.email = Set(email.to_string());
    }
    if let Some(password) = &changes.password {
        active.password_hash = Set(hash_password(password).await?);
    }
    active.updated_at = Set(chrono::Utc::now());

    let updated = active.update(&txn).await?;
    txn.commit().await?;
    info!("Updated profile of account {}", account_id);
    Ok(updated)
}
