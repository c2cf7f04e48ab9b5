//! Ledger persistence boundary.
//!
//! Plain CRUD for users, banks and transactions, plus the atomic primitives
//! every balance mutation goes through:
//! - [`LedgerStore::claim_reference`]: reserve a payment reference before
//!   the provider ever sees it
//! - [`LedgerStore::settle_if_pending`]: compare-and-set a transaction out of
//!   PENDING and credit its owner in the same unit of work
//! - [`LedgerStore::record_withdrawal`]: insert an `out` transaction and
//!   debit its owner in the same unit of work, refusing overdrafts

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryLedgerStore;
#[cfg(feature = "database")]
pub use postgres::PgLedgerStore;

use crate::domain::{
    Bank, BankId, NewBank, NewTransaction, NewUser, PaymentReference, SettlementStatus,
    Transaction, TransactionId, User, UserId,
};
use async_trait::async_trait;
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("reference already exists: {0}")]
    DuplicateReference(String),

    #[error("{entity} {key} does not exist")]
    MissingRow { entity: &'static str, key: String },

    #[error("insufficient balance: available={available}, required={required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: SettlementStatus,
        to: SettlementStatus,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            #[cfg(feature = "database")]
            StoreError::Database(e) => !matches!(e, sqlx::Error::RowNotFound),
            StoreError::DuplicateReference(_)
            | StoreError::InsufficientFunds { .. }
            | StoreError::MissingRow { .. }
            | StoreError::InvalidTransition { .. }
            | StoreError::Corrupt(_) => false,
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// One page of users ordered by id, plus the total user count.
    async fn list_users(&self, limit: u32, offset: u64) -> Result<(Vec<User>, u64), StoreError>;

    async fn create_bank(&self, bank: NewBank) -> Result<Bank, StoreError>;

    async fn find_bank(&self, id: BankId) -> Result<Option<Bank>, StoreError>;

    async fn find_banks_by_user(&self, user_id: UserId) -> Result<Vec<Bank>, StoreError>;

    /// Reserves `reference` for one request. Fails with
    /// [`StoreError::DuplicateReference`] if it was claimed before or a
    /// transaction already carries it. Claims are never released.
    async fn claim_reference(&self, reference: &PaymentReference) -> Result<(), StoreError>;

    /// Fails with [`StoreError::DuplicateReference`] if the reference is taken.
    async fn create_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError>;

    async fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    async fn find_transaction_by_reference(
        &self,
        reference: &PaymentReference,
    ) -> Result<Option<Transaction>, StoreError>;

    /// All transactions of a user, newest first.
    async fn find_transactions_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// If the transaction is still PENDING, move it to `terminal` and add
    /// `credit` to its owner's balance atomically, returning the updated row.
    /// Returns `None` when another caller already settled it.
    async fn settle_if_pending(
        &self,
        reference: &PaymentReference,
        terminal: SettlementStatus,
        credit: Decimal,
    ) -> Result<Option<Transaction>, StoreError>;

    /// Inserts the withdrawal and subtracts its amount from the owner's
    /// balance atomically. Fails with [`StoreError::InsufficientFunds`],
    /// writing nothing, when the balance does not cover the amount.
    /// Returns the stored row and the updated user.
    async fn record_withdrawal(
        &self,
        tx: NewTransaction,
    ) -> Result<(Transaction, User), StoreError>;
}
