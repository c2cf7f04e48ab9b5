use super::reference::PaymentReference;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type BankId = i64;
pub type TransactionId = i64;

/// Identity of the caller, resolved by the surrounding API layer and passed
/// explicitly into every wallet operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub username: String,
}

impl AuthenticatedUser {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

// ============================================================================
// Transaction direction and settlement status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Settlement status of a ledger transaction as reported by the payment
/// provider. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Completed,
    Failed,
    Expired,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
            SettlementStatus::Expired => "EXPIRED",
        }
    }

    /// Parses a status string as stored in the ledger.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(SettlementStatus::Pending),
            "COMPLETED" => Some(SettlementStatus::Completed),
            "FAILED" => Some(SettlementStatus::Failed),
            "EXPIRED" => Some(SettlementStatus::Expired),
            _ => None,
        }
    }

    /// Maps a provider status string onto the ledger's status set.
    ///
    /// Virtual accounts report `ACTIVE` while awaiting funds. A closed
    /// single-use account turns `INACTIVE` both once paid and once lapsed,
    /// so `INACTIVE` alone settles nothing and stays pending. Disbursements
    /// report `COMPLETED` or `FAILED`.
    pub fn from_provider(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "ACTIVE" | "INACTIVE" => Some(SettlementStatus::Pending),
            "COMPLETED" | "PAID" | "SETTLED" => Some(SettlementStatus::Completed),
            "FAILED" => Some(SettlementStatus::Failed),
            "EXPIRED" => Some(SettlementStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SettlementStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SettlementStatus::Completed)
    }

    /// Pending may move to any terminal state; terminal states never move.
    pub fn can_transition_to(&self, next: SettlementStatus) -> bool {
        matches!(self, SettlementStatus::Pending) && next.is_terminal()
    }
}

impl std::fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// One money movement in the ledger. Append-only: only `status` and
/// `updated_at` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub bank_id: Option<BankId>,
    pub amount: Decimal,
    pub direction: Direction,
    pub reference: PaymentReference,
    pub status: SettlementStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub bank_id: Option<BankId>,
    pub amount: Decimal,
    pub direction: Direction,
    pub reference: PaymentReference,
    pub status: SettlementStatus,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A user's linked payout destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bank {
    pub id: BankId,
    pub user_id: UserId,
    pub account_name: String,
    pub account_number: String,
    pub bank_code: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewBank {
    pub user_id: UserId,
    pub account_name: String,
    pub account_number: String,
    pub bank_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub name: String,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub name: String,
}
