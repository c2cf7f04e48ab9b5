//! Background workers

pub mod settlement_worker;

pub use settlement_worker::{JobHandler, JobReport, WorkerError, WorkerRuntime};
