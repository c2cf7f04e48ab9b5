//! Wallet error taxonomy.
//!
//! Each boundary (gateway, store, queue, config) owns its error enum; they
//! fold into [`WalletError`], which decides retryability for background jobs
//! and the terse message shown to callers.

use crate::database::StoreError;
use crate::domain::{BankId, ReferenceError, UserId};
use crate::gateway::GatewayError;
use crate::queue::QueueError;
use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("bank {bank_id} not found for user {user_id}")]
    BankNotFound { bank_id: BankId, user_id: UserId },

    #[error("insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: Decimal, required: Decimal },

    #[error("settlement amount mismatch for {reference}: stored={stored}, provider={reported}")]
    AmountMismatch {
        reference: String,
        stored: Decimal,
        reported: Decimal,
    },

    #[error("invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("payment provider error: {0}")]
    PaymentProvider(#[from] GatewayError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WalletError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        WalletError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Whether a background job failing with this error should spend one unit
    /// of its retry budget rather than be dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            WalletError::PaymentProvider(e) => e.is_retryable(),
            WalletError::Persistence(e) => e.is_retryable(),
            WalletError::Queue(_) => true,
            WalletError::Validation(_)
            | WalletError::NotFound { .. }
            | WalletError::BankNotFound { .. }
            | WalletError::InsufficientFunds { .. }
            | WalletError::AmountMismatch { .. }
            | WalletError::Reference(_)
            | WalletError::Internal(_) => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::Validation(_) | WalletError::Reference(_) => "VALIDATION_ERROR",
            WalletError::NotFound { .. } => "NOT_FOUND",
            WalletError::BankNotFound { .. } => "BANK_NOT_FOUND",
            WalletError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            WalletError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            WalletError::PaymentProvider(_) => "PAYMENT_PROVIDER_ERROR",
            WalletError::Persistence(_) => "PERSISTENCE_ERROR",
            WalletError::Queue(_) => "QUEUE_ERROR",
            WalletError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Caller-facing reason. Provider and storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            WalletError::Validation(msg) => msg.clone(),
            WalletError::Reference(e) => e.to_string(),
            WalletError::NotFound { entity, .. } => format!("{} not found", entity),
            WalletError::BankNotFound { .. } => "bank account not found".to_string(),
            WalletError::InsufficientFunds { .. } => "insufficient balance".to_string(),
            WalletError::AmountMismatch { .. } => "settlement amount mismatch".to_string(),
            WalletError::PaymentProvider(_) => "payment provider unavailable".to_string(),
            WalletError::Persistence(_) | WalletError::Queue(_) | WalletError::Internal(_) => {
                "internal error, please retry later".to_string()
            }
        }
    }
}
