//! Deterministic in-process payment provider.
//!
//! Behaves like the sandbox provider by default: deposits come back PENDING
//! with the fee added to the expected amount, the first status check reports
//! COMPLETED, and disbursements complete immediately. Tests can script
//! per-reference status sequences, inject failures, and inspect every call.

use super::{
    CreateDepositRequest, Disbursement, DisbursementRequest, GatewayError, PaymentGateway,
    SettlementUpdate, VirtualAccount,
};
use crate::domain::{PaymentReference, SettlementStatus};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

const SANDBOX_BANK_CODE: &str = "BNI";
const SANDBOX_MERCHANT_PREFIX: &str = "8808";

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    CreateDeposit {
        reference: String,
        expected_amount: Decimal,
    },
    CheckStatus {
        reference: String,
    },
    Disburse {
        reference: String,
        account_number: String,
        amount: Decimal,
    },
}

#[derive(Default)]
struct SimulatedState {
    deposits: HashMap<String, Decimal>,
    status_script: HashMap<String, VecDeque<Result<SettlementStatus, GatewayError>>>,
    net_overrides: HashMap<String, Decimal>,
    create_failures: VecDeque<GatewayError>,
    disburse_failures: VecDeque<GatewayError>,
    disburse_statuses: VecDeque<SettlementStatus>,
    default_status: Option<SettlementStatus>,
    latency: Option<std::time::Duration>,
    calls: Vec<GatewayCall>,
}

pub struct SimulatedGateway {
    provider_fee: Decimal,
    deposit_ttl: Duration,
    state: Mutex<SimulatedState>,
}

impl SimulatedGateway {
    pub fn new(provider_fee: Decimal) -> Self {
        Self {
            provider_fee,
            deposit_ttl: Duration::minutes(60),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    pub fn with_deposit_ttl(mut self, ttl: Duration) -> Self {
        self.deposit_ttl = ttl;
        self
    }

    /// Status reported for references with no script left. COMPLETED unless set.
    pub async fn set_default_status(&self, status: SettlementStatus) {
        self.state.lock().await.default_status = Some(status);
    }

    /// Queues the statuses returned by successive checks of `reference`.
    pub async fn script_statuses(
        &self,
        reference: &PaymentReference,
        statuses: impl IntoIterator<Item = SettlementStatus>,
    ) {
        let mut state = self.state.lock().await;
        let script = state
            .status_script
            .entry(reference.as_str().to_string())
            .or_default();
        script.extend(statuses.into_iter().map(Ok));
    }

    /// Queues a failing status check for `reference`.
    pub async fn script_failure(&self, reference: &PaymentReference, error: GatewayError) {
        let mut state = self.state.lock().await;
        state
            .status_script
            .entry(reference.as_str().to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub async fn override_net_amount(&self, reference: &PaymentReference, amount: Decimal) {
        self.state
            .lock()
            .await
            .net_overrides
            .insert(reference.as_str().to_string(), amount);
    }

    pub async fn fail_next_create(&self, error: GatewayError) {
        self.state.lock().await.create_failures.push_back(error);
    }

    pub async fn fail_next_disburse(&self, error: GatewayError) {
        self.state.lock().await.disburse_failures.push_back(error);
    }

    /// Status reported by the next disbursement. COMPLETED when none is queued.
    pub async fn script_disburse_status(&self, status: SettlementStatus) {
        self.state.lock().await.disburse_statuses.push_back(status);
    }

    /// Delay applied to deposit creation and disbursement, outside the lock,
    /// so concurrent callers overlap inside the provider call.
    pub async fn set_latency(&self, latency: std::time::Duration) {
        self.state.lock().await.latency = Some(latency);
    }

    async fn pause(latency: Option<std::time::Duration>) {
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn status_checks(&self, reference: &PaymentReference) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| {
                matches!(call, GatewayCall::CheckStatus { reference: r } if r == reference.as_str())
            })
            .count()
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_deposit(
        &self,
        request: CreateDepositRequest,
    ) -> Result<VirtualAccount, GatewayError> {
        let latency = self.state.lock().await.latency;
        Self::pause(latency).await;

        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::CreateDeposit {
            reference: request.reference.to_string(),
            expected_amount: request.expected_amount,
        });
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }

        let net_amount = request.expected_amount + self.provider_fee;
        state
            .deposits
            .insert(request.reference.to_string(), net_amount);

        debug!(
            reference = %request.reference,
            net_amount = %net_amount,
            "Simulated virtual account created"
        );

        Ok(VirtualAccount {
            account_ref: format!(
                "{}{}",
                SANDBOX_MERCHANT_PREFIX,
                request.reference.seconds_of_day() as u64 * 1_000 + state.deposits.len() as u64
            ),
            bank_code: SANDBOX_BANK_CODE.to_string(),
            reference: request.reference,
            status: SettlementStatus::Pending,
            net_amount,
            expires_at: Utc::now() + self.deposit_ttl,
        })
    }

    async fn check_or_advance_status(
        &self,
        reference: &PaymentReference,
    ) -> Result<SettlementUpdate, GatewayError> {
        let mut state = self.state.lock().await;
        state.calls.push(GatewayCall::CheckStatus {
            reference: reference.to_string(),
        });

        let Some(stored) = state.deposits.get(reference.as_str()).copied() else {
            return Err(GatewayError::Rejected {
                status: 404,
                message: format!("unknown external_id {}", reference),
            });
        };

        let scripted = state
            .status_script
            .get_mut(reference.as_str())
            .and_then(|script| script.pop_front());
        let status = match scripted {
            Some(result) => result?,
            None => state.default_status.unwrap_or(SettlementStatus::Completed),
        };
        let net_amount = state
            .net_overrides
            .get(reference.as_str())
            .copied()
            .unwrap_or(stored);

        Ok(SettlementUpdate { status, net_amount })
    }

    async fn disburse(&self, request: DisbursementRequest) -> Result<Disbursement, GatewayError> {
        let latency = {
            let mut state = self.state.lock().await;
            state.calls.push(GatewayCall::Disburse {
                reference: request.reference.to_string(),
                account_number: request.account_number.clone(),
                amount: request.amount,
            });
            state.latency
        };
        Self::pause(latency).await;

        let mut state = self.state.lock().await;
        if let Some(error) = state.disburse_failures.pop_front() {
            return Err(error);
        }
        let status = state
            .disburse_statuses
            .pop_front()
            .unwrap_or(SettlementStatus::Completed);

        Ok(Disbursement {
            status,
            disbursed_amount: request.amount,
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reference() -> PaymentReference {
        PaymentReference::parse("TF-A1Bnp03723").unwrap()
    }

    #[tokio::test]
    async fn test_deposit_adds_provider_fee() {
        let gateway = SimulatedGateway::new(dec!(4500));
        let va = gateway
            .create_deposit(CreateDepositRequest {
                reference: reference(),
                expected_amount: dec!(100000),
                account_name: "danielpnjt".into(),
            })
            .await
            .unwrap();

        assert_eq!(va.net_amount, dec!(104500));
        assert_eq!(va.status, SettlementStatus::Pending);
        assert!(va.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_scripted_statuses_then_default() {
        let gateway = SimulatedGateway::new(dec!(4500));
        gateway
            .create_deposit(CreateDepositRequest {
                reference: reference(),
                expected_amount: dec!(100),
                account_name: "x".into(),
            })
            .await
            .unwrap();
        gateway
            .script_statuses(&reference(), [SettlementStatus::Pending])
            .await;
        gateway
            .script_failure(&reference(), GatewayError::Timeout(5))
            .await;

        let first = gateway.check_or_advance_status(&reference()).await.unwrap();
        assert_eq!(first.status, SettlementStatus::Pending);
        assert_eq!(
            gateway.check_or_advance_status(&reference()).await,
            Err(GatewayError::Timeout(5))
        );
        let third = gateway.check_or_advance_status(&reference()).await.unwrap();
        assert_eq!(third.status, SettlementStatus::Completed);
        assert_eq!(third.net_amount, dec!(4600));
        assert_eq!(gateway.status_checks(&reference()).await, 3);
    }

    #[tokio::test]
    async fn test_unknown_reference_rejected() {
        let gateway = SimulatedGateway::new(dec!(4500));
        let err = gateway
            .check_or_advance_status(&reference())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 404, .. }));
    }
}
