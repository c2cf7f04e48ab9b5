//! Payment provider boundary.
//!
//! The wallet talks to its provider through [`PaymentGateway`]: mint a
//! virtual account for a deposit, poll or advance its settlement, and send a
//! disbursement for a withdrawal. All three calls may fail with a
//! [`GatewayError`]; callers must not mutate ledger state when they do.

pub mod http;
pub mod simulated;

pub use http::HttpPaymentGateway;
pub use simulated::{GatewayCall, SimulatedGateway};

use crate::domain::{PaymentReference, SettlementStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider timed out after {0}s")]
    Timeout(u64),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("provider declined: {0}")]
    Declined(String),

    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

impl GatewayError {
    /// Transport failures, timeouts and provider-side 5xx/429 are worth
    /// retrying. Declines, malformed answers and other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::Timeout(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 429,
            GatewayError::Declined(_) | GatewayError::UnexpectedResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDepositRequest {
    pub reference: PaymentReference,
    pub expected_amount: Decimal,
    pub account_name: String,
}

/// Virtual account minted for a deposit. `net_amount` is what the payer is
/// asked to transfer: the requested amount plus the provider fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub account_ref: String,
    pub bank_code: String,
    pub reference: PaymentReference,
    pub status: SettlementStatus,
    pub net_amount: Decimal,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementUpdate {
    pub status: SettlementStatus,
    pub net_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisbursementRequest {
    pub reference: PaymentReference,
    pub bank_code: String,
    pub holder_name: String,
    pub account_number: String,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disbursement {
    pub status: SettlementStatus,
    pub disbursed_amount: Decimal,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_deposit(
        &self,
        request: CreateDepositRequest,
    ) -> Result<VirtualAccount, GatewayError>;

    async fn check_or_advance_status(
        &self,
        reference: &PaymentReference,
    ) -> Result<SettlementUpdate, GatewayError>;

    async fn disburse(&self, request: DisbursementRequest) -> Result<Disbursement, GatewayError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
