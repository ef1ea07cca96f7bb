//! Unified error type for the points store engine.
//!
//! Every core operation returns [`Result`]. Variants carry enough structured context for
//! callers to branch on them, and [`Error::user_message`] turns each one into the short,
//! actionable text a UI collaborator shows to the user.

use sea_orm::DbErr;
use thiserror::Error;

/// All errors produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be read or is invalid
    #[error("Configuration error: {message}")]
    Config {
        /// What went wrong
        message: String,
    },

    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    /// I/O failure (config file, data directory)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Required environment variable missing or unreadable
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    /// A referenced entity does not exist
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity kind ("account", "product", "cart line", ...)
        entity: &'static str,
        /// Lookup key that missed
        key: String,
    },

    /// A caller-supplied argument is malformed
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem
        message: String,
    },

    /// A points or money amount is zero, negative or not finite
    #[error("Invalid amount: {amount}")]
    InvalidAmount {
        /// Offending amount
        amount: f64,
    },

    /// A product does not have enough stock for the requested quantity
    #[error("Out of stock: {product} (requested {requested}, available {available})")]
    OutOfStock {
        /// Product name
        product: String,
        /// Quantity requested
        requested: i32,
        /// Quantity on hand
        available: i32,
    },

    /// Account balance cannot cover the requested debit
    #[error("Insufficient balance: have {balance}, need {required}")]
    InsufficientBalance {
        /// Current balance in points
        balance: i64,
        /// Points required
        required: i64,
    },

    /// Checkout was requested with no cart lines
    #[error("Cart is empty for account {account_id}")]
    EmptyCart {
        /// Account whose cart is empty
        account_id: i64,
    },

    /// Invite code was already consumed
    #[error("Invite code already used: {code}")]
    AlreadyUsed {
        /// The code
        code: String,
    },

    /// Payment gateway could not be reached after all retries
    #[error("Payment gateway unavailable: {message}")]
    GatewayUnavailable {
        /// Last transport error seen
        message: String,
    },

    /// Payment gateway is misconfigured (bad URL, rejected credentials)
    #[error("Payment gateway configuration error: {message}")]
    PaymentConfiguration {
        /// Description of the problem
        message: String,
    },

    /// Concurrent modification detected and the retry budget is spent
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the contended state
        message: String,
    },

    /// Username or email already taken
    #[error("Account already exists with {field} '{value}'")]
    AccountExists {
        /// `"username"` or `"email"`
        field: &'static str,
        /// The duplicated value
        value: String,
    },

    /// Unknown username or wrong password
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Account is banned
    #[error("Account {account_id} is banned")]
    AccountBanned {
        /// Banned account
        account_id: i64,
    },

    /// Actor lacks the privilege tier required for the action
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description of the missing privilege
        message: String,
    },

    /// Requested status transition is not allowed from the current state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the transition
        message: String,
    },

    /// Unexpected internal failure (hashing, background task)
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },

    /// A persisted record failed validation on read
    #[error("Corrupt record {entity} {id}: {message}")]
    CorruptRecord {
        /// Entity kind
        entity: &'static str,
        /// Row id
        id: i64,
        /// Validation failure
        message: String,
    },
}

impl Error {
    /// Short, user-facing message for display by UI collaborators.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { entity, .. } => format!("The requested {entity} no longer exists."),
            Self::InvalidArgument { message } => format!("Invalid input: {message}."),
            Self::InvalidAmount { .. } => "Please enter an amount greater than zero.".to_string(),
            Self::OutOfStock {
                product, available, ..
            } => format!("Not enough stock for {product}: only {available} left."),
            Self::InsufficientBalance { balance, required } => format!(
                "Insufficient points, need {} more.",
                required.saturating_sub(*balance)
            ),
            Self::EmptyCart { .. } => "Your cart is empty.".to_string(),
            Self::AlreadyUsed { .. } => "This invite code has already been used.".to_string(),
            Self::GatewayUnavailable { .. } => {
                "The payment service is unreachable. Your payment may still be processing; \
                 please check again later or contact support for manual confirmation."
                    .to_string()
            }
            Self::PaymentConfiguration { .. } => {
                "Recharge is currently unavailable. Please contact an administrator.".to_string()
            }
            Self::Conflict { .. } => {
                "Someone else changed these items at the same time. Please try again.".to_string()
            }
            Self::AccountExists { field, .. } => format!("That {field} is already registered."),
            Self::InvalidCredentials => "Wrong username or password.".to_string(),
            Self::AccountBanned { .. } => "This account has been banned.".to_string(),
            Self::PermissionDenied { .. } => {
                "You do not have permission to do that.".to_string()
            }
            Self::InvalidState { message } => format!("That action is not possible: {message}."),
            Self::Config { .. }
            | Self::Database(_)
            | Self::Io(_)
            | Self::EnvVar(_)
            | Self::Internal { .. }
            | Self::CorruptRecord { .. } => {
                "Something went wrong. Please try again or contact support.".to_string()
            }
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;
