//! Shared fixtures: in-memory ledger, in-memory queue and a scriptable
//! simulated provider wired into a settlement orchestrator.

#![allow(dead_code)]

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use speedpay_backend::config::SettlementConfig;
use speedpay_backend::database::{InMemoryLedgerStore, LedgerStore};
use speedpay_backend::domain::{AuthenticatedUser, Bank, NewBank, NewUser};
use speedpay_backend::gateway::SimulatedGateway;
use speedpay_backend::queue::InMemorySettlementQueue;
use speedpay_backend::services::{SettlementDeps, SettlementOrchestrator};
use std::sync::Arc;

pub const PROVIDER_FEE: Decimal = dec!(4500);

pub struct Harness {
    pub store: Arc<InMemoryLedgerStore>,
    pub queue: Arc<InMemorySettlementQueue>,
    pub gateway: Arc<SimulatedGateway>,
    pub orchestrator: Arc<SettlementOrchestrator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SettlementConfig::default())
    }

    pub fn with_config(config: SettlementConfig) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let queue = Arc::new(InMemorySettlementQueue::new());
        let gateway = Arc::new(SimulatedGateway::new(config.provider_fee));
        let orchestrator = Arc::new(
            SettlementOrchestrator::new(SettlementDeps {
                store: store.clone(),
                queue: queue.clone(),
                gateway: gateway.clone(),
                config,
            })
            .expect("valid settlement config"),
        );
        Self {
            store,
            queue,
            gateway,
            orchestrator,
        }
    }

    pub async fn user(&self, username: &str) -> AuthenticatedUser {
        let user = self
            .store
            .create_user(NewUser {
                username: username.to_string(),
                email: format!("{}@example.com", username),
                name: username.to_string(),
            })
            .await
            .expect("create user");
        AuthenticatedUser::new(user.id, user.username)
    }

    pub async fn funded_user(&self, username: &str, balance: Decimal) -> AuthenticatedUser {
        let user = self.user(username).await;
        self.store
            .set_balance(user.id, balance)
            .await
            .expect("seed balance");
        user
    }

    pub async fn bank_for(&self, user: &AuthenticatedUser) -> Bank {
        self.store
            .create_bank(NewBank {
                user_id: user.id,
                account_name: user.username.clone(),
                account_number: "8808999939380502".to_string(),
                bank_code: "BCA".to_string(),
            })
            .await
            .expect("create bank")
    }

    pub async fn balance(&self, user: &AuthenticatedUser) -> Decimal {
        self.store
            .find_user(user.id)
            .await
            .expect("find user")
            .expect("user exists")
            .balance
    }
}
