//! Prometheus counters, registered in the default registry scraped by `/metrics`

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    static ref RESOLUTIONS: IntCounterVec = register_int_counter_vec!(
        "streamarr_resolutions_total",
        "Stream resolutions by outcome and path",
        &["outcome", "path"]
    )
    .unwrap();
    static ref PROVIDER_CALLS: IntCounterVec = register_int_counter_vec!(
        "streamarr_provider_calls_total",
        "Outgoing provider HTTP calls",
        &["provider", "endpoint"]
    )
    .unwrap();
    static ref STREAM_CACHE_LOOKUPS: IntCounterVec = register_int_counter_vec!(
        "streamarr_stream_cache_lookups_total",
        "Stream cache lookups by result",
        &["result"]
    )
    .unwrap();
    static ref HASHES_ADDED: IntCounter = register_int_counter!(
        "streamarr_hashes_added_total",
        "Hashes committed to the hash index"
    )
    .unwrap();
}

/// `path` is "fast", "fallback" or "none"
pub fn record_resolution(outcome: &str, path: &str) {
    RESOLUTIONS.with_label_values(&[outcome, path]).inc();
}

pub fn record_provider_call(provider: &str, endpoint: &str) {
    PROVIDER_CALLS.with_label_values(&[provider, endpoint]).inc();
}

/// `result` is "fresh", "negative" or "stale"
pub fn record_cache_lookup(result: &str) {
    STREAM_CACHE_LOOKUPS.with_label_values(&[result]).inc();
}

pub fn record_hashes_added(count: usize) {
    HASHES_ADDED.inc_by(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_default_registry() {
        record_resolution("playable", "fast");
        record_hashes_added(3);

        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"streamarr_resolutions_total".to_string()));
        assert!(names.contains(&"streamarr_hashes_added_total".to_string()));
    }
}
