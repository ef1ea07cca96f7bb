//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod account;
pub mod cart_line;
pub mod invite_code;
pub mod ledger_entry;
pub mod order;
pub mod product;
pub mod recharge;

// Re-export specific types to avoid conflicts
pub use account::{Column as AccountColumn, Entity as Account, Model as AccountModel};
pub use cart_line::{Column as CartLineColumn, Entity as CartLine, Model as CartLineModel};
pub use invite_code::{Column as InviteCodeColumn, Entity as InviteCode, Model as InviteCodeModel};
pub use ledger_entry::{
    Column as LedgerEntryColumn, Entity as LedgerEntry, Model as LedgerEntryModel,
};
pub use order::{Column as OrderColumn, Entity as Order, Model as OrderModel};
pub use product::{Column as ProductColumn, Entity as Product, Model as ProductModel};
pub use recharge::{Column as RechargeColumn, Entity as Recharge, Model as RechargeModel};
