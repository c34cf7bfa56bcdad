//! Engine metrics.
//!
//! Recorded through the `metrics` facade; they are no-ops until the embedding process
//! installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// Metric names as constants for consistency
pub const DEVICE_MUTATIONS_TOTAL: &str = "device_mutations_total";
pub const HOUR_SAMPLES_TOTAL: &str = "hour_samples_total";
pub const RETENTION_RECORDS_PURGED_TOTAL: &str = "retention_records_purged_total";
pub const CACHE_LOOKUPS_TOTAL: &str = "cache_lookups_total";
pub const ENGINE_ERRORS_TOTAL: &str = "engine_errors_total";
pub const SAMPLER_RUN_DURATION_SECONDS: &str = "sampler_run_duration_seconds";

/// Register metric descriptions. Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(
        DEVICE_MUTATIONS_TOTAL,
        "Device mutations by operation (claim/create/update/delete)"
    );
    describe_counter!(HOUR_SAMPLES_TOTAL, "Synthetic hourly samples written");
    describe_counter!(
        RETENTION_RECORDS_PURGED_TOTAL,
        "Daily consumption records deleted by retention"
    );
    describe_counter!(CACHE_LOOKUPS_TOTAL, "Cache lookups by cache kind and result");
    describe_counter!(ENGINE_ERRORS_TOTAL, "Engine errors by operation and kind");
    describe_histogram!(
        SAMPLER_RUN_DURATION_SECONDS,
        "Wall time of one hourly sampler pass in seconds"
    );
}

pub fn record_device_mutation(operation: &'static str) {
    counter!(DEVICE_MUTATIONS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_hour_sample() {
    counter!(HOUR_SAMPLES_TOTAL).increment(1);
}

pub fn record_records_purged(count: u64) {
    counter!(RETENTION_RECORDS_PURGED_TOTAL).increment(count);
}

pub fn record_cache_lookup(kind: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(CACHE_LOOKUPS_TOTAL, "cache" => kind, "result" => result).increment(1);
}

pub fn record_engine_error(operation: &'static str, kind: &'static str) {
    counter!(ENGINE_ERRORS_TOTAL, "operation" => operation, "kind" => kind).increment(1);
}

pub fn record_sampler_duration(seconds: f64) {
    histogram!(SAMPLER_RUN_DURATION_SECONDS).record(seconds);
}
