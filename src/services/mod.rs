//! Services module for wallet business logic

pub mod bank;
pub mod settlement_orchestrator;
pub mod user;

pub use bank::{BankService, SubmitBankRequest};
pub use settlement_orchestrator::{
    AccountSummary, DepositInfo, SettlementDeps, SettlementOrchestrator, SettlementOutcome,
    WithdrawalInfo,
};
pub use user::{Page, PageRequest, Pagination, UserService};
