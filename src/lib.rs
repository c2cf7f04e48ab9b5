//! Wallet settlement service: deposit generation, asynchronous settlement of
//! pending deposits through a delayed job queue, and synchronous withdrawal.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod queue;
pub mod services;
pub mod workers;

pub use error::WalletError;
