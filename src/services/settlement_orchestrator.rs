//! Settlement Orchestrator
//!
//! Owns the money-moving flows of the wallet:
//! - deposit generation: mint a virtual account, record a PENDING `in`
//!   transaction, schedule the first status check
//! - the status-check job: poll the provider and settle the deposit exactly
//!   once through the store's compare-and-set
//! - synchronous withdrawal: reserve the funds with an atomic insert and
//!   debit, disburse, then complete the row or refund it
//!
//! Every reference is claimed in the store before the provider sees it, so
//! concurrent requests never share one.
//!
//! All collaborators arrive through [`SettlementDeps`]; there is no global
//! state. The caller's identity is passed into every operation.

use crate::config::SettlementConfig;
use crate::database::{LedgerStore, StoreError};
use crate::domain::{
    Amount, AuthenticatedUser, BankId, Direction, NewTransaction, PaymentReference,
    SettlementStatus, Transaction, TransactionId, UserId,
};
use crate::error::WalletError;
use crate::gateway::{CreateDepositRequest, DisbursementRequest, GatewayError, PaymentGateway};
use crate::log_transaction;
use crate::logging::mask_account_number;
use crate::queue::{SettlementJob, SettlementQueue};
use crate::workers::JobHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const WITHDRAWAL_DESCRIPTION: &str = "disbursement to user";

// ============================================================================
// Wiring
// ============================================================================

#[derive(Clone)]
pub struct SettlementDeps {
    pub store: Arc<dyn LedgerStore>,
    pub queue: Arc<dyn SettlementQueue>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub config: SettlementConfig,
}

pub struct SettlementOrchestrator {
    store: Arc<dyn LedgerStore>,
    queue: Arc<dyn SettlementQueue>,
    gateway: Arc<dyn PaymentGateway>,
    config: SettlementConfig,
}

// ============================================================================
// Results
// ============================================================================

/// Returned to the payer after generating a deposit.
#[derive(Debug, Clone, Serialize)]
pub struct DepositInfo {
    pub transaction_id: TransactionId,
    pub reference: PaymentReference,
    /// Virtual account number to transfer to.
    pub account_ref: String,
    pub bank_code: String,
    pub requested_amount: Decimal,
    /// Amount to transfer: requested amount plus provider fee.
    pub amount: Decimal,
    pub status: SettlementStatus,
    pub expires_at: DateTime<Utc>,
    /// `false` when the first status check could not be queued.
    pub check_scheduled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalInfo {
    pub transaction_id: TransactionId,
    pub reference: PaymentReference,
    pub bank_id: BankId,
    pub account_number: String,
    pub amount: Decimal,
    pub status: SettlementStatus,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub user_id: UserId,
    pub username: String,
    pub balance: Decimal,
}

/// Result of one status-check run.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// This run won the compare-and-set and credited the owner.
    Credited {
        transaction_id: TransactionId,
        credit: Decimal,
    },
    /// This run moved the deposit to FAILED or EXPIRED.
    Closed { status: SettlementStatus },
    /// Another run settled it first. Nothing changed.
    AlreadySettled { status: SettlementStatus },
    /// Still pending at the provider; a follow-up check was scheduled.
    Requeued { next_eta: DateTime<Utc>, poll: u32 },
    /// Still pending after the last allowed check.
    Abandoned { polls: u32 },
}

impl SettlementOrchestrator {
    pub fn new(deps: SettlementDeps) -> Result<Self, WalletError> {
        deps.config
            .validate()
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        info!(
            gateway = deps.gateway.name(),
            provider_fee = %deps.config.provider_fee,
            initial_delay_secs = deps.config.initial_delay_secs,
            max_polls = deps.config.max_polls,
            "Settlement orchestrator initialized"
        );

        Ok(Self {
            store: deps.store,
            queue: deps.queue,
            gateway: deps.gateway,
            config: deps.config,
        })
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Deposit
    // ------------------------------------------------------------------------

    #[instrument(skip(self, user), fields(user_id = user.id, reference))]
    pub async fn generate_deposit(
        &self,
        user: &AuthenticatedUser,
        amount: Decimal,
    ) -> Result<DepositInfo, WalletError> {
        let amount = Amount::new(amount)?;
        let reference = self.unique_reference(user).await?;
        tracing::Span::current().record("reference", reference.as_str());

        let account = self
            .gateway
            .create_deposit(CreateDepositRequest {
                reference: reference.clone(),
                expected_amount: amount.value(),
                account_name: user.username.clone(),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, gateway = self.gateway.name(), "Virtual account creation failed");
                e
            })?;

        if account.status != SettlementStatus::Pending {
            return Err(GatewayError::UnexpectedResponse(format!(
                "new virtual account {} reported status {}",
                reference, account.status
            ))
            .into());
        }

        let tx = self
            .store
            .create_transaction(NewTransaction {
                user_id: user.id,
                bank_id: None,
                amount: account.net_amount,
                direction: Direction::In,
                reference: reference.clone(),
                status: account.status,
                expires_at: Some(account.expires_at),
            })
            .await?;

        log_transaction!(
            event = "deposit_created",
            reference = tx.reference.as_str(),
            user_id = tx.user_id,
            amount = tx.amount.to_string(),
            status = tx.status.as_str(),
        );

        let eta = Utc::now() + self.config.initial_delay();
        let job = SettlementJob::new(
            reference.clone(),
            eta,
            self.config.retry_count,
            self.config.retry_timeout_secs,
        );
        let check_scheduled = match self.queue.enqueue(job).await {
            Ok(()) => {
                debug!(eta = %eta, "First settlement check scheduled");
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to schedule settlement check, deposit needs manual reconciliation"
                );
                false
            }
        };

        Ok(DepositInfo {
            transaction_id: tx.id,
            reference,
            account_ref: account.account_ref,
            bank_code: account.bank_code,
            requested_amount: amount.value(),
            amount: tx.amount,
            status: tx.status,
            expires_at: account.expires_at,
            check_scheduled,
        })
    }

    /// Draws references until the store lets this call claim one.
    async fn unique_reference(
        &self,
        user: &AuthenticatedUser,
    ) -> Result<PaymentReference, WalletError> {
        for attempt in 1..=self.config.reference_attempts {
            let candidate = PaymentReference::generate(&user.username, Utc::now());
            match self.store.claim_reference(&candidate).await {
                Ok(()) => return Ok(candidate),
                Err(StoreError::DuplicateReference(_)) => {
                    warn!(attempt, reference = %candidate, "Reference collision, drawing again");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WalletError::Internal(format!(
            "no unused reference after {} attempts",
            self.config.reference_attempts
        )))
    }

    // ------------------------------------------------------------------------
    // Status check
    // ------------------------------------------------------------------------

    /// Runs one status check for the job's deposit. Safe to run any number of
    /// times for the same reference: only the run that wins the store's
    /// compare-and-set credits the balance.
    #[instrument(skip(self, job), fields(reference = %job.reference, poll = job.poll))]
    pub async fn check_settlement(
        &self,
        job: &SettlementJob,
    ) -> Result<SettlementOutcome, WalletError> {
        let tx = self
            .store
            .find_transaction_by_reference(&job.reference)
            .await?
            .ok_or_else(|| WalletError::not_found("transaction", &job.reference))?;

        if tx.status.is_terminal() {
            debug!(status = %tx.status, "Deposit already settled, skipping provider check");
            return Ok(SettlementOutcome::AlreadySettled { status: tx.status });
        }

        let update = self
            .gateway
            .check_or_advance_status(&job.reference)
            .await?;
        debug!(status = %update.status, net_amount = %update.net_amount, "Provider status received");

        match update.status {
            SettlementStatus::Pending => self.schedule_next_poll(job).await,
            SettlementStatus::Completed => {
                if update.net_amount != tx.amount {
                    error!(
                        stored = %tx.amount,
                        reported = %update.net_amount,
                        "Provider settled a different amount than recorded"
                    );
                    return Err(WalletError::AmountMismatch {
                        reference: tx.reference.to_string(),
                        stored: tx.amount,
                        reported: update.net_amount,
                    });
                }
                self.settle(&tx, SettlementStatus::Completed, tx.amount - self.config.provider_fee)
                    .await
            }
            terminal => self.settle(&tx, terminal, Decimal::ZERO).await,
        }
    }

    async fn schedule_next_poll(
        &self,
        job: &SettlementJob,
    ) -> Result<SettlementOutcome, WalletError> {
        let polls_done = job.poll + 1;
        if polls_done >= self.config.max_polls {
            error!(
                polls = polls_done,
                "Deposit still pending after last status check, left for reconciliation"
            );
            return Ok(SettlementOutcome::Abandoned { polls: polls_done });
        }

        let base = job.eta.max(Utc::now());
        let next_eta = base + self.config.poll_delay(polls_done);
        let next = job.next_poll(next_eta);
        let poll = next.poll;
        self.queue.enqueue(next).await?;

        info!(next_eta = %next_eta, poll, "Deposit still pending, status check rescheduled");
        Ok(SettlementOutcome::Requeued { next_eta, poll })
    }

    async fn settle(
        &self,
        tx: &Transaction,
        terminal: SettlementStatus,
        credit: Decimal,
    ) -> Result<SettlementOutcome, WalletError> {
        match self
            .store
            .settle_if_pending(&tx.reference, terminal, credit)
            .await?
        {
            Some(settled) if terminal.is_success() => {
                log_transaction!(
                    event = "deposit_credited",
                    reference = settled.reference.as_str(),
                    user_id = settled.user_id,
                    amount = settled.amount.to_string(),
                    credit = credit.to_string(),
                );
                Ok(SettlementOutcome::Credited {
                    transaction_id: settled.id,
                    credit,
                })
            }
            Some(settled) => {
                log_transaction!(
                    event = "deposit_closed",
                    reference = settled.reference.as_str(),
                    user_id = settled.user_id,
                    status = settled.status.as_str(),
                );
                Ok(SettlementOutcome::Closed {
                    status: settled.status,
                })
            }
            None => {
                let current = self
                    .store
                    .find_transaction_by_reference(&tx.reference)
                    .await?
                    .map(|t| t.status)
                    .unwrap_or(terminal);
                info!(status = %current, "Deposit settled by a concurrent run");
                Ok(SettlementOutcome::AlreadySettled { status: current })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Withdrawal
    // ------------------------------------------------------------------------

    /// Withdraws `amount` to one of the caller's banks.
    ///
    /// The funds are reserved first: a PENDING `out` row is inserted and the
    /// balance debited in one store call that refuses overdrafts. A provider
    /// that declines gets the reservation refunded. A provider that cannot be
    /// reached leaves it PENDING, since the payout may have gone out.
    #[instrument(skip(self, user), fields(user_id = user.id, reference))]
    pub async fn withdraw(
        &self,
        user: &AuthenticatedUser,
        bank_id: BankId,
        amount: Decimal,
    ) -> Result<WithdrawalInfo, WalletError> {
        let amount = Amount::new(amount)?;

        let bank = self
            .store
            .find_bank(bank_id)
            .await?
            .filter(|bank| bank.user_id == user.id)
            .ok_or(WalletError::BankNotFound {
                bank_id,
                user_id: user.id,
            })?;

        let reference = self.unique_reference(user).await?;
        tracing::Span::current().record("reference", reference.as_str());

        let (reserved, owner) = self
            .store
            .record_withdrawal(NewTransaction {
                user_id: user.id,
                bank_id: Some(bank.id),
                amount: amount.value(),
                direction: Direction::Out,
                reference: reference.clone(),
                status: SettlementStatus::Pending,
                expires_at: None,
            })
            .await
            .map_err(|e| match e {
                StoreError::InsufficientFunds {
                    available,
                    required,
                } => WalletError::InsufficientFunds {
                    available,
                    required,
                },
                other => other.into(),
            })?;

        let account = mask_account_number(&bank.account_number);
        let disbursement = match self
            .gateway
            .disburse(DisbursementRequest {
                reference: reference.clone(),
                bank_code: bank.bank_code.clone(),
                holder_name: bank.account_name.clone(),
                account_number: bank.account_number.clone(),
                amount: amount.value(),
                description: WITHDRAWAL_DESCRIPTION.to_string(),
            })
            .await
        {
            Ok(disbursement) => disbursement,
            Err(e) if e.is_retryable() => {
                error!(
                    error = %e,
                    account = %account,
                    "Disbursement outcome unknown, funds stay reserved for reconciliation"
                );
                return Err(e.into());
            }
            Err(e) => {
                self.refund_withdrawal(&reserved).await?;
                return Err(e.into());
            }
        };

        let status = match disbursement.status {
            SettlementStatus::Pending => SettlementStatus::Pending,
            SettlementStatus::Completed => {
                self.store
                    .settle_if_pending(&reference, SettlementStatus::Completed, Decimal::ZERO)
                    .await?;
                SettlementStatus::Completed
            }
            failed => {
                self.refund_withdrawal(&reserved).await?;
                return Err(GatewayError::Declined(format!(
                    "disbursement {} ended {}",
                    reference, failed
                ))
                .into());
            }
        };

        log_transaction!(
            event = "withdrawal_recorded",
            reference = reserved.reference.as_str(),
            user_id = reserved.user_id,
            amount = reserved.amount.to_string(),
            status = status.as_str(),
            account = account,
        );

        Ok(WithdrawalInfo {
            transaction_id: reserved.id,
            reference,
            bank_id: bank.id,
            account_number: account,
            amount: reserved.amount,
            status,
            balance: owner.balance,
        })
    }

    /// Closes a reserved withdrawal as FAILED and credits its amount back.
    async fn refund_withdrawal(&self, reserved: &Transaction) -> Result<(), WalletError> {
        let refunded = self
            .store
            .settle_if_pending(&reserved.reference, SettlementStatus::Failed, reserved.amount)
            .await
            .map_err(|e| {
                error!(error = %e, "Refund of declined withdrawal failed, needs reconciliation");
                e
            })?;
        match refunded {
            Some(tx) => log_transaction!(
                event = "withdrawal_refunded",
                reference = tx.reference.as_str(),
                user_id = tx.user_id,
                amount = tx.amount.to_string(),
            ),
            None => warn!("Withdrawal already closed, nothing refunded"),
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn account_summary(
        &self,
        user: &AuthenticatedUser,
    ) -> Result<AccountSummary, WalletError> {
        let owner = self
            .store
            .find_user(user.id)
            .await?
            .ok_or_else(|| WalletError::not_found("user", user.id))?;
        Ok(AccountSummary {
            user_id: owner.id,
            username: owner.username,
            balance: owner.balance,
        })
    }

    /// Every transaction of the caller, newest first.
    pub async fn transaction_history(
        &self,
        user: &AuthenticatedUser,
    ) -> Result<Vec<Transaction>, WalletError> {
        Ok(self.store.find_transactions_by_user(user.id).await?)
    }
}

#[async_trait]
impl JobHandler for SettlementOrchestrator {
    async fn handle(&self, job: &SettlementJob) -> Result<(), WalletError> {
        self.check_settlement(job).await.map(|_| ())
    }
}
