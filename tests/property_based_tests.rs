mod common;

use chrono::Utc;
use common::strategies::*;
use proptest::prelude::*;

proptest! {
    /// Property: a retry successor keeps its identity and is scheduled in the future
    #[test]
    fn retry_successor_keeps_identity_and_is_deferred(
        delivery in delivery_strategy(),
        policy in retry_policy_strategy(),
        reset in any::<bool>(),
        error in error_message_strategy(),
    ) {
        let before = Utc::now();
        let original = delivery.clone();
        let retry = delivery.create_retry(reset, &policy, Some(&error));

        prop_assert_eq!(retry.delivery_id, delivery.delivery_id);
        prop_assert_eq!(retry.subscription_id, delivery.subscription_id);
        prop_assert_eq!(&retry.message, &delivery.message);
        if reset {
            prop_assert_eq!(retry.retry_count, 0);
        } else {
            prop_assert_eq!(retry.retry_count, delivery.retry_count + 1);
        }
        prop_assert!(retry.time_to_process.is_some_and(|at| at > before));
        prop_assert!(retry.is_deferred_at(before));

        let exceptions = retry.context.exceptions();
        prop_assert_eq!(exceptions.last(), Some(&error));

        // Source record is never mutated
        prop_assert_eq!(delivery.retry_count, original.retry_count);
        prop_assert_eq!(delivery.time_to_process, original.time_to_process);
        prop_assert!(delivery.context.exceptions().is_empty());
    }

    /// Property: a failure record counts the final attempt and appends its error
    #[test]
    fn failure_record_counts_final_attempt(
        delivery in delivery_strategy(),
        error in error_message_strategy(),
    ) {
        let failure = delivery.create_failure(&error);
        prop_assert_eq!(failure.delivery_id, delivery.delivery_id);
        prop_assert_eq!(failure.retry_count, delivery.retry_count + 1);
        prop_assert_eq!(failure.time_to_process, None);
        prop_assert_eq!(failure.context.exceptions(), vec![error]);
    }

    /// Property: retries are maxed exactly when the count reaches the ceiling
    #[test]
    fn retries_maxed_matches_ceiling(delivery in delivery_strategy()) {
        prop_assert_eq!(
            delivery.is_retries_maxed(),
            delivery.retry_count >= delivery.max_retries
        );
    }

    /// Property: backoff delays never shrink as the retry count grows
    #[test]
    fn backoff_is_monotonic(policy in retry_policy_strategy(), count in 0u32..1_000) {
        prop_assert!(policy.delay_for(count) <= policy.delay_for(count + 1));
        if !policy.exponential_backoff {
            prop_assert_eq!(policy.delay_for(count), policy.base_delay);
        }
    }
}
