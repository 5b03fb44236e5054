//! Engine counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated across the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    requests: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    remote_queries: AtomicU64,
    jit_syncs: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    health_check_failures: AtomicU64,
    live_updates: AtomicU64,
    offline_queued: AtomicU64,
    offline_replayed: AtomicU64,
    token_refreshes: AtomicU64,
    auth_refreshes: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Returns a point-in-time copy of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }

        /// Serializable copy of [`EngineStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "camelCase")]
        #[allow(missing_docs)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }
    };
}

counters! {
    requests => record_request,
    errors => record_error,
    cache_hits => record_cache_hit,
    cache_misses => record_cache_miss,
    remote_queries => record_remote_query,
    jit_syncs => record_jit_sync,
    reconnect_attempts => record_reconnect_attempt,
    reconnect_successes => record_reconnect_success,
    health_check_failures => record_health_check_failure,
    live_updates => record_live_update,
    offline_queued => record_offline_queued,
    offline_replayed => record_offline_replayed,
    token_refreshes => record_token_refresh,
    auth_refreshes => record_auth_refresh,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_cache_hit();
        stats.record_reconnect_attempt();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let stats = EngineStats::default();
        stats.record_health_check_failure();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["healthCheckFailures"], 1);
    }
}
