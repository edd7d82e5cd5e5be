//! # Messaging Error Types
//!
//! Error handling for delivery queues and the transactions that span them,
//! using thiserror for structured error types instead of `Box<dyn Error>`.

use thiserror::Error;
use uuid::Uuid;

/// Queue and transaction failures
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Claim {receipt} not found in queue {queue_name}")]
    ClaimNotFound { queue_name: String, receipt: u64 },

    #[error("Transaction {transaction_id} already completed")]
    TransactionCompleted { transaction_id: Uuid },

    #[error("Transaction {transaction_id} failed during {phase}: {message}")]
    TransactionFailed {
        transaction_id: Uuid,
        phase: String,
        message: String,
    },
}

impl MessagingError {
    /// Create a claim-not-found error
    pub fn claim_not_found(queue_name: impl Into<String>, receipt: u64) -> Self {
        Self::ClaimNotFound {
            queue_name: queue_name.into(),
            receipt,
        }
    }

    /// Create a transaction failure error
    pub fn transaction_failed(
        transaction_id: Uuid,
        phase: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TransactionFailed {
            transaction_id,
            phase: phase.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let claim_err = MessagingError::claim_not_found("primary", 7);
        assert!(matches!(
            claim_err,
            MessagingError::ClaimNotFound { receipt: 7, .. }
        ));

        let id = Uuid::new_v4();
        let tx_err = MessagingError::transaction_failed(id, "enqueue", "queue full");
        assert!(matches!(
            tx_err,
            MessagingError::TransactionFailed { transaction_id, .. } if transaction_id == id
        ));
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::transaction_failed(Uuid::nil(), "acknowledge", "Claim lost");
        let display_str = format!("{err}");
        assert!(display_str.contains("failed during acknowledge"));
        assert!(display_str.contains("Claim lost"));
    }
}
