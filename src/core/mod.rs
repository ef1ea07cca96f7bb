//! Core business logic - framework-agnostic store operations.
//!
//! Every operation takes the database connection (or an open transaction) explicitly.
//! Operations that change more than one row open their own transaction, which nests as a
//! savepoint when the caller already holds one.

pub mod account;
pub mod admin;
pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod invite;
pub mod ledger;
pub mod order;
pub mod payment;
pub(crate) mod retry;
