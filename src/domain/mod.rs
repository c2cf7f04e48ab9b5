//! Wallet domain types: users, linked banks, ledger transactions,
//! monetary amounts and payment references.

pub mod amount;
pub mod entities;
pub mod reference;

pub use amount::Amount;
pub use entities::{
    AuthenticatedUser, Bank, BankId, Direction, NewBank, NewTransaction, NewUser,
    SettlementStatus, Transaction, TransactionId, User, UserId,
};
pub use reference::{PaymentReference, ReferenceError};
