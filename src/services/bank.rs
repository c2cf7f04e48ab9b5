//! Bank Account Service
//!
//! Registers and lists the payout destinations a user can withdraw to.

use crate::database::LedgerStore;
use crate::domain::{AuthenticatedUser, Bank, NewBank};
use crate::error::WalletError;
use crate::logging::mask_account_number;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

const MAX_ACCOUNT_NUMBER_LEN: usize = 34;

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitBankRequest {
    pub account_name: String,
    pub account_number: String,
    pub bank_code: String,
}

impl SubmitBankRequest {
    fn validate(&self) -> Result<(), WalletError> {
        if self.account_name.trim().is_empty() {
            return Err(WalletError::Validation("account_name is required".into()));
        }
        if self.bank_code.trim().is_empty() {
            return Err(WalletError::Validation("bank_code is required".into()));
        }
        let number = self.account_number.trim();
        if number.is_empty() || number.len() > MAX_ACCOUNT_NUMBER_LEN {
            return Err(WalletError::Validation(format!(
                "account_number must be 1 to {} digits",
                MAX_ACCOUNT_NUMBER_LEN
            )));
        }
        if !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(WalletError::Validation(
                "account_number must contain digits only".into(),
            ));
        }
        Ok(())
    }
}

pub struct BankService {
    store: Arc<dyn LedgerStore>,
}

impl BankService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, user, request), fields(user_id = user.id))]
    pub async fn submit_bank(
        &self,
        user: &AuthenticatedUser,
        request: SubmitBankRequest,
    ) -> Result<Bank, WalletError> {
        request.validate()?;

        let bank = self
            .store
            .create_bank(NewBank {
                user_id: user.id,
                account_name: request.account_name.trim().to_string(),
                account_number: request.account_number.trim().to_string(),
                bank_code: request.bank_code.trim().to_uppercase(),
            })
            .await?;

        info!(
            bank_id = bank.id,
            bank_code = %bank.bank_code,
            account = %mask_account_number(&bank.account_number),
            "Bank account registered"
        );
        Ok(bank)
    }

    pub async fn list_banks(&self, user: &AuthenticatedUser) -> Result<Vec<Bank>, WalletError> {
        Ok(self.store.find_banks_by_user(user.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryLedgerStore;
    use crate::domain::NewUser;

    async fn setup() -> (BankService, AuthenticatedUser) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let user = store
            .create_user(NewUser {
                username: "speedengine".into(),
                email: "ops@example.com".into(),
                name: "Speed Engine".into(),
            })
            .await
            .unwrap();
        (
            BankService::new(store),
            AuthenticatedUser::new(user.id, user.username),
        )
    }

    fn request(account_number: &str) -> SubmitBankRequest {
        SubmitBankRequest {
            account_name: "Speed Engine".into(),
            account_number: account_number.into(),
            bank_code: "bca".into(),
        }
    }

    #[tokio::test]
    async fn test_submit_and_list() {
        let (service, user) = setup().await;
        let bank = service.submit_bank(&user, request("1234567890")).await.unwrap();
        assert_eq!(bank.user_id, user.id);
        assert_eq!(bank.bank_code, "BCA");

        let banks = service.list_banks(&user).await.unwrap();
        assert_eq!(banks, vec![bank]);
    }

    #[tokio::test]
    async fn test_rejects_non_numeric_account_number() {
        let (service, user) = setup().await;
        let err = service
            .submit_bank(&user, request("12-34-56"))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Validation(_)));
        assert!(service.list_banks(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_blank_holder_name() {
        let (service, user) = setup().await;
        let mut req = request("1234567890");
        req.account_name = "   ".into();
        assert!(service.submit_bank(&user, req).await.is_err());
    }
}
