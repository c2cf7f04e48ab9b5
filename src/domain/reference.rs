//! Payment references.
//!
//! A reference ties a wallet request to its provider-side counterpart and is
//! shaped `TF-XXXYYZZZZZ`:
//! - `XXX`: three uppercase hex characters drawn from random bytes
//! - `YY`: two characters taken from the tail of the requesting username
//! - `ZZZZZ`: UTC seconds since midnight, zero padded

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const PREFIX: &str = "TF-";
const RANDOM_LEN: usize = 3;
const SUFFIX_LEN: usize = 2;
const TIME_LEN: usize = 5;
const USER_TAIL_LEN: usize = 5;
const REFERENCE_LEN: usize = 3 + RANDOM_LEN + SUFFIX_LEN + TIME_LEN;
const SECONDS_PER_DAY: u32 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference must be {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("reference must start with TF-")]
    MissingPrefix,

    #[error("random part must be uppercase hex: {0}")]
    InvalidRandomPart(String),

    #[error("user suffix must be alphanumeric: {0}")]
    InvalidSuffix(String),

    #[error("time part must be seconds of day: {0}")]
    InvalidTime(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentReference {
    value: String,
    seconds_of_day: u32,
}

impl PaymentReference {
    /// Generates a fresh reference for `user_key` using the thread-local RNG.
    pub fn generate(user_key: &str, now: DateTime<Utc>) -> Self {
        Self::generate_with(&mut rand::thread_rng(), user_key, now)
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R, user_key: &str, now: DateTime<Utc>) -> Self {
        let bytes: [u8; 5] = rng.gen();
        let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        let seconds_of_day = now.num_seconds_from_midnight() % SECONDS_PER_DAY;

        let value = format!(
            "{}{}{}{:05}",
            PREFIX,
            &hex[..RANDOM_LEN],
            user_suffix(user_key),
            seconds_of_day
        );

        Self {
            value,
            seconds_of_day,
        }
    }

    pub fn parse(value: &str) -> Result<Self, ReferenceError> {
        if value.len() != REFERENCE_LEN || !value.is_ascii() {
            return Err(ReferenceError::InvalidLength {
                expected: REFERENCE_LEN,
                actual: value.chars().count(),
            });
        }
        if !value.starts_with(PREFIX) {
            return Err(ReferenceError::MissingPrefix);
        }

        let body = &value[PREFIX.len()..];
        let random = &body[..RANDOM_LEN];
        let suffix = &body[RANDOM_LEN..RANDOM_LEN + SUFFIX_LEN];
        let time = &body[RANDOM_LEN + SUFFIX_LEN..];

        if !random
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        {
            return Err(ReferenceError::InvalidRandomPart(random.to_string()));
        }
        if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ReferenceError::InvalidSuffix(suffix.to_string()));
        }
        if time.len() != TIME_LEN || !time.chars().all(|c| c.is_ascii_digit()) {
            return Err(ReferenceError::InvalidTime(time.to_string()));
        }
        let seconds_of_day: u32 = time
            .parse()
            .map_err(|_| ReferenceError::InvalidTime(time.to_string()))?;
        if seconds_of_day >= SECONDS_PER_DAY {
            return Err(ReferenceError::InvalidTime(time.to_string()));
        }

        Ok(Self {
            value: value.to_string(),
            seconds_of_day,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn random_part(&self) -> &str {
        &self.value[PREFIX.len()..PREFIX.len() + RANDOM_LEN]
    }

    pub fn user_suffix(&self) -> &str {
        let start = PREFIX.len() + RANDOM_LEN;
        &self.value[start..start + SUFFIX_LEN]
    }

    pub fn seconds_of_day(&self) -> u32 {
        self.seconds_of_day
    }
}

/// First two characters of the last five of `user_key`, left padded with
/// `0` when the key is short. Characters outside `[A-Za-z0-9]` become `0`.
fn user_suffix(user_key: &str) -> String {
    let mut chars: Vec<char> = user_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '0' })
        .collect();
    while chars.len() < USER_TAIL_LEN {
        chars.insert(0, '0');
    }
    let tail = &chars[chars.len() - USER_TAIL_LEN..];
    tail[..SUFFIX_LEN].iter().collect()
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl FromStr for PaymentReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PaymentReference {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PaymentReference> for String {
    fn from(reference: PaymentReference) -> Self {
        reference.value
    }
}

impl AsRef<str> for PaymentReference {
    fn as_ref(&self) -> &str {
        &self.value
    }
}
