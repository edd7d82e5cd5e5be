//! # System Constants
//!
//! Default tunables for the delivery engine and the well-known keys carried in
//! a [`MessageDeliveryContext`](crate::messaging::MessageDeliveryContext).

/// Default values for delivery engine configuration
pub mod defaults {
    /// Retry ceiling for new delivery records
    pub const MAX_RETRIES: u32 = 3;
    /// Base retry delay (fixed delay, or base of the quadratic backoff)
    pub const RETRY_DELAY_MS: u64 = 1_000;
    /// Bounded wait for a single dequeue call
    pub const DEQUEUE_TIMEOUT_MS: u64 = 5_000;
    /// Pause after pushing a not-yet-due record back to its queue
    pub const DEFERRED_RETRY_SLEEP_MS: u64 = 100;
    /// Fixed pause between retry-worker iterations
    pub const RETRY_POLL_INTERVAL_MS: u64 = 100;
    /// Concurrently in-flight deliveries per delivery worker
    pub const PERMITS_PER_WORKER: usize = 5;
    /// Grace period for a worker loop to exit after cancellation
    pub const WORKER_STOP_TIMEOUT_MS: u64 = 10_000;
    /// Timeout handed to each unit-of-work call
    pub const UNIT_OF_WORK_TIMEOUT_MS: u64 = 5_000;
    /// Default wait for a two-way publish reply
    pub const REPLY_TIMEOUT_MS: u64 = 30_000;
    /// Broadcast capacity for bus notifications
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_000;
}

/// Well-known context keys
pub mod context_keys {
    /// Correlation id attached to a two-way publish
    pub const CORRELATION_ID: &str = "correlation_id";
    /// Correlation id a reply relates to; marks a publish as reply-shaped
    pub const RELATES_TO: &str = "relates_to";
    /// Accumulated failure history, one entry per failed attempt
    pub const EXCEPTIONS: &str = "exceptions";
    /// Identity of the publishing caller
    pub const CALLER_IDENTITY: &str = "caller_identity";
    /// Lineage of transformations applied to the message
    pub const TRANSFORMATIONS: &str = "transformations";
}

/// Names used for the built-in delivery cores
pub mod cores {
    pub const DIRECT: &str = "direct";
    pub const QUEUED: &str = "queued";
}

/// Logical CPU count, used as the default worker count
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
