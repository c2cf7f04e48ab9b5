//! Logging and tracing configuration for the wallet service
//!
//! Structured JSON in production, human-readable output in development.
//! Includes account-number masking, secret redaction for provider payloads,
//! and environment-based log levels.

use regex::Regex;
use std::env;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Deployment environment; picks log level and output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Reads `ENVIRONMENT`, falling back to `ENV`. Unknown values mean development.
    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT")
            .or_else(|_| env::var("ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging => Level::INFO,
            Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `LOG_FORMAT` wins when it names a known format; otherwise production
    /// logs JSON lines and everything else logs pretty output.
    pub fn resolve(environment: Environment) -> Self {
        match env::var("LOG_FORMAT").map(|f| f.trim().to_ascii_lowercase()) {
            Ok(f) if f == "json" => Self::Json,
            Ok(f) if f == "pretty" => Self::Pretty,
            _ if environment.is_production() => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn service_filter(environment: Environment) -> EnvFilter {
    let directives = format!(
        "{}={},sqlx=warn,reqwest=warn,redis=warn",
        env!("CARGO_PKG_NAME").replace('-', "_"),
        environment.default_log_level()
    );
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
/// Fails if a subscriber is already installed.
pub fn init_tracing() -> Result<(), TryInitError> {
    let environment = Environment::from_env();
    let format = LogFormat::resolve(environment);
    let filter = service_filter(environment);
    let registry = tracing_subscriber::registry();

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_filter(filter),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_filter(filter),
            )
            .try_init()?,
    }

    tracing::info!(?environment, ?format, "tracing ready");
    Ok(())
}

/// Mask a bank account number for logging
///
/// Keeps the first and last four characters. Anything of eight characters
/// or fewer is fully masked.
///
/// ```
/// use speedpay_backend::logging::mask_account_number;
/// assert_eq!(mask_account_number("8808999939380502"), "8808...0502");
/// ```
pub fn mask_account_number(account_number: &str) -> String {
    let chars: Vec<char> = account_number.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

const SENSITIVE_KEYS: &[&str] = &[
    "secret",
    "secret_key",
    "secretKey",
    "password",
    "token",
    "api_key",
    "apiKey",
    "authorization",
    "account_number",
    "accountNumber",
    "pin",
];

fn redaction_patterns() -> &'static [(Regex, String)] {
    static PATTERNS: OnceLock<Vec<(Regex, String)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SENSITIVE_KEYS
            .iter()
            .flat_map(|key| {
                [
                    format!(r#""{}":\s*"[^"]*""#, key),
                    format!(r#"'{}': '[^']*'"#, key),
                ]
                .into_iter()
                .filter_map(|pattern| Regex::new(&pattern).ok())
                .map(move |re| (re, format!(r#""{}": "[REDACTED]""#, key)))
            })
            .collect()
    })
}

/// Redact sensitive fields from JSON-like provider payloads before logging
pub fn redact_sensitive_data(text: &str) -> String {
    let mut result = text.to_string();
    for (re, replacement) in redaction_patterns() {
        result = re.replace_all(&result, replacement.as_str()).to_string();
    }
    result
}

/// Log a ledger event with consistent structure.
///
/// ```no_run
/// use speedpay_backend::log_transaction;
/// log_transaction!(
///     event = "deposit_credited",
///     reference = "TF-A1Bnp03723",
///     user_id = 42,
///     amount = "100000",
/// );
/// ```
#[macro_export]
macro_rules! log_transaction {
    ($($key:tt = $value:expr),* $(,)?) => {{
        tracing::info!(
            event_type = "transaction",
            $($key = tracing::field::debug(&$value)),*
        );
    }};
}

/// Debug-level timing event.
///
/// ```no_run
/// use speedpay_backend::log_performance;
/// log_performance!(operation = "status_check", duration_ms = 145);
/// ```
#[macro_export]
macro_rules! log_performance {
    ($($key:tt = $value:expr),* $(,)?) => {{
        tracing::debug!(
            event_type = "performance",
            $($key = tracing::field::debug(&$value)),*
        );
    }};
}

/// Create a tracing span for one settlement job execution
///
/// ```no_run
/// use speedpay_backend::job_span;
/// let span = job_span!("settlement_job", job_id = "7f0c", reference = "TF-A1Bnp03723");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! job_span {
    ($name:expr, $($key:tt = $value:expr),* $(,)?) => {
        tracing::info_span!(
            $name,
            $($key = tracing::field::display(&$value)),*
        )
    };
}
