//! JSON-over-HTTPS client for the virtual account / disbursement provider.

use super::{
    CreateDepositRequest, Disbursement, DisbursementRequest, GatewayError, PaymentGateway,
    SettlementUpdate, VirtualAccount,
};
use crate::config::GatewayConfig;
use crate::domain::{PaymentReference, SettlementStatus};
use crate::logging::redact_sensitive_data;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// Wire models
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateVirtualAccountBody<'a> {
    external_id: &'a str,
    bank_code: &'a str,
    name: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    expected_amount: Decimal,
    is_closed: bool,
    is_single_use: bool,
    expiration_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VirtualAccountBody {
    external_id: String,
    bank_code: String,
    account_number: String,
    status: String,
    #[serde(with = "rust_decimal::serde::float")]
    expected_amount: Decimal,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    suggested_amount: Option<Decimal>,
    expiration_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DisbursementBody<'a> {
    external_id: &'a str,
    bank_code: &'a str,
    account_holder_name: &'a str,
    account_number: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct DisbursementResponseBody {
    status: String,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
}

// ============================================================================
// Client
// ============================================================================

pub struct HttpPaymentGateway {
    http_client: HttpClient,
    base_url: String,
    secret_key: String,
    va_bank_code: String,
    deposit_ttl: chrono::Duration,
    timeout_secs: u64,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            va_bank_code: config.va_bank_code.clone(),
            deposit_ttl: chrono::Duration::minutes(config.deposit_ttl_mins),
            timeout_secs: config.timeout_secs,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.timeout_secs)
        } else {
            GatewayError::Transport(e.to_string())
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
                .unwrap_or_else(|| redact_sensitive_data(&body));
            if status.is_server_error() {
                warn!(status = status.as_u16(), message = %message, "Provider server error");
            }
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::UnexpectedResponse(format!("failed to parse body: {}", e)))
    }

    fn parse_status(raw: &str) -> Result<SettlementStatus, GatewayError> {
        SettlementStatus::from_provider(raw)
            .ok_or_else(|| GatewayError::UnexpectedResponse(format!("unknown status {}", raw)))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_deposit(
        &self,
        request: CreateDepositRequest,
    ) -> Result<VirtualAccount, GatewayError> {
        let url = format!("{}/callback_virtual_accounts", self.base_url);
        let body = CreateVirtualAccountBody {
            external_id: request.reference.as_str(),
            bank_code: &self.va_bank_code,
            name: &request.account_name,
            expected_amount: request.expected_amount,
            is_closed: true,
            is_single_use: true,
            expiration_date: Utc::now() + self.deposit_ttl,
        };

        debug!(reference = %request.reference, "Creating virtual account");
        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.secret_key, Some(""))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let va: VirtualAccountBody = self.read_json(response).await?;
        if va.external_id != request.reference.as_str() {
            return Err(GatewayError::UnexpectedResponse(format!(
                "external_id {} does not match {}",
                va.external_id, request.reference
            )));
        }

        Ok(VirtualAccount {
            account_ref: va.account_number,
            bank_code: va.bank_code,
            status: Self::parse_status(&va.status)?,
            net_amount: va.suggested_amount.unwrap_or(va.expected_amount),
            expires_at: va.expiration_date.unwrap_or(body.expiration_date),
            reference: request.reference,
        })
    }

    async fn check_or_advance_status(
        &self,
        reference: &PaymentReference,
    ) -> Result<SettlementUpdate, GatewayError> {
        let url = format!("{}/callback_virtual_accounts/{}", self.base_url, reference);

        let response = self
            .http_client
            .get(&url)
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let va: VirtualAccountBody = self.read_json(response).await?;
        if va.status.trim().eq_ignore_ascii_case("INACTIVE") {
            warn!(
                reference = %reference,
                "Virtual account inactive, payment not confirmed, keeping deposit pending"
            );
        }
        Ok(SettlementUpdate {
            status: Self::parse_status(&va.status)?,
            net_amount: va.suggested_amount.unwrap_or(va.expected_amount),
        })
    }

    async fn disburse(&self, request: DisbursementRequest) -> Result<Disbursement, GatewayError> {
        let url = format!("{}/disbursements", self.base_url);
        let body = DisbursementBody {
            external_id: request.reference.as_str(),
            bank_code: &request.bank_code,
            account_holder_name: &request.holder_name,
            account_number: &request.account_number,
            amount: request.amount,
            description: &request.description,
        };

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.secret_key, Some(""))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let disbursement: DisbursementResponseBody = self.read_json(response).await?;
        Ok(Disbursement {
            status: Self::parse_status(&disbursement.status)?,
            disbursed_amount: disbursement.amount,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
