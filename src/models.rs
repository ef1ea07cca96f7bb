//! Domain types shared across the core.
//!
//! Enumerations are persisted as lowercase strings. Each enum has exactly one
//! `as_str` / `TryFrom<&str>` pair, which is the only place the string form is known.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account privilege tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    /// Regular member
    Normal,
    /// VIP member with a better exchange rate
    Vip,
    /// Administrator
    Admin,
}

impl PrivilegeTier {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Vip => "vip",
            Self::Admin => "admin",
        }
    }

    /// Display text for UI collaborators.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Normal => "Member",
            Self::Vip => "VIP Member",
            Self::Admin => "Administrator",
        }
    }
}

impl TryFrom<&str> for PrivilegeTier {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "normal" => Ok(Self::Normal),
            "vip" => Ok(Self::Vip),
            "admin" => Ok(Self::Admin),
            other => Err(Error::invalid_argument(format!(
                "unknown privilege tier: {other}"
            ))),
        }
    }
}

impl fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Reason a ledger entry was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Points bought through the payment gateway
    Recharge,
    /// Points spent at checkout
    Purchase,
    /// Points returned for a cancelled order
    Refund,
}

impl EntryKind {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recharge => "recharge",
            Self::Purchase => "purchase",
            Self::Refund => "refund",
        }
    }
}

impl TryFrom<&str> for EntryKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "recharge" => Ok(Self::Recharge),
            "purchase" => Ok(Self::Purchase),
            "refund" => Ok(Self::Refund),
            other => Err(Error::invalid_argument(format!(
                "unknown ledger entry kind: {other}"
            ))),
        }
    }
}

/// Order lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created by checkout, awaiting fulfillment
    Pending,
    /// Fulfilled
    Completed,
    /// Cancelled and refunded
    Cancelled,
}

impl OrderStatus {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::invalid_argument(format!(
                "unknown order status: {other}"
            ))),
        }
    }
}

/// State of one recharge attempt.
///
/// `Created → AwaitingConfirmation → Succeeded | Failed | TimedOut`, with `Cancelled`
/// reachable from any open state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RechargeStatus {
    /// Row written, gateway not yet contacted
    Created,
    /// Charge handed to the gateway (or degraded), waiting for payment
    AwaitingConfirmation,
    /// Gateway confirmed payment and points were credited
    Succeeded,
    /// Gateway reported failure or rejected the charge
    Failed,
    /// Polling budget exhausted without a terminal answer
    TimedOut,
    /// User cancelled; never credited
    Cancelled,
}

impl RechargeStatus {
    /// Storage form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses from which a charge can still be credited or cancelled.
    #[must_use]
    pub const fn open() -> [Self; 3] {
        [Self::Created, Self::AwaitingConfirmation, Self::TimedOut]
    }

    /// Whether the charge can still change state.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(
            self,
            Self::Created | Self::AwaitingConfirmation | Self::TimedOut
        )
    }
}

impl TryFrom<&str> for RechargeStatus {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(Self::Created),
            "awaiting_confirmation" => Ok(Self::AwaitingConfirmation),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::invalid_argument(format!(
                "unknown recharge status: {other}"
            ))),
        }
    }
}

/// Frozen snapshot of one purchased line, stored inside the order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product id at purchase time
    pub product_id: i64,
    /// Product name at purchase time
    pub name: String,
    /// Unit price in points at purchase time
    pub unit_price: i64,
    /// Quantity purchased
    pub quantity: i32,
}

impl OrderItem {
    /// Line total in points.
    #[must_use]
    pub fn subtotal(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.quantity < 1 {
            return Err(format!(
                "line for product {} has quantity {}",
                self.product_id, self.quantity
            ));
        }
        if self.unit_price <= 0 {
            return Err(format!(
                "line for product {} has unit price {}",
                self.product_id, self.unit_price
            ));
        }
        Ok(())
    }
}

/// Validates and serializes an order snapshot for storage.
pub(crate) fn encode_order_items(items: &[OrderItem]) -> Result<String> {
    validate_order_items(items).map_err(Error::invalid_argument)?;
    serde_json::to_string(items)
        .map_err(|e| Error::invalid_argument(format!("unserializable order items: {e}")))
}

/// Parses and validates a stored order snapshot.
pub(crate) fn decode_order_items(order_id: i64, raw: &str) -> Result<Vec<OrderItem>> {
    let corrupt = |message: String| Error::CorruptRecord {
        entity: "order",
        id: order_id,
        message,
    };
    let items: Vec<OrderItem> =
        serde_json::from_str(raw).map_err(|e| corrupt(format!("invalid items JSON: {e}")))?;
    validate_order_items(&items).map_err(corrupt)?;
    Ok(items)
}

fn validate_order_items(items: &[OrderItem]) -> std::result::Result<(), String> {
    if items.is_empty() {
        return Err("order has no items".to_string());
    }
    items.iter().try_for_each(OrderItem::validate)
}

/// Cart line joined with the live product row, for display.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CartItemView {
    /// Cart line id
    pub line_id: i64,
    /// Product id
    pub product_id: i64,
    /// Current product name
    pub name: String,
    /// Current unit price
    pub unit_price: i64,
    /// Quantity staged
    pub quantity: i32,
    /// Current stock, so the UI can warn before checkout
    pub available_stock: i32,
}

impl CartItemView {
    /// Line total at current prices.
    #[must_use]
    pub fn subtotal(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}
