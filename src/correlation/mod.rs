//! # Correlation
//!
//! Matching of replies to pending two-way publishes.

pub mod correlator;

pub use correlator::{CorrelationWaiter, Correlator};
