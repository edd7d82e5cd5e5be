//! # Execution
//!
//! Background execution primitives shared by the delivery engine.

pub mod worker_pool;

pub use worker_pool::{PanicHandler, StopOutcome, UnitOfWork, WorkerHandle, WorkerPool};
