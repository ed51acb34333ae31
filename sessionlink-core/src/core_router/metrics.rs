/*
    Metrics - Security and protocol counters for monitoring

    Provides counters and gauges for:
    - Inbound traffic by event family
    - Security events (duplicates, integrity and decryption failures)
    - Handshake outcomes
    - Dedup cache occupancy

    No exporter is installed here; the host process picks one.
*/

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    describe_counter!(
        "sessionlink_inbound_events_total",
        "Total number of inbound events accepted by the router, labeled by family"
    );

    describe_counter!(
        "sessionlink_duplicate_events_total",
        "Total number of inbound events dropped as redeliveries"
    );

    describe_counter!(
        "sessionlink_integrity_failures_total",
        "Total number of envelopes discarded because the checksum did not match"
    );

    describe_counter!(
        "sessionlink_decryption_failures_total",
        "Total number of envelopes the cipher rejected"
    );

    describe_counter!(
        "sessionlink_handshakes_total",
        "Total number of finished handshakes, labeled by outcome (established, declined, expired, cancelled, superseded, rejected)"
    );

    describe_gauge!(
        "sessionlink_dedup_cache_size",
        "Current number of fingerprints held by the dedup cache"
    );
}

/// Record an inbound event that passed dedup
pub fn inbound_event(family: &str) {
    counter!("sessionlink_inbound_events_total", "family" => family.to_string()).increment(1);
}

/// Record a redelivered event
pub fn duplicate_event() {
    counter!("sessionlink_duplicate_events_total").increment(1);
}

pub fn integrity_failure() {
    counter!("sessionlink_integrity_failures_total").increment(1);
}

pub fn decryption_failure() {
    counter!("sessionlink_decryption_failures_total").increment(1);
}

/// Record a handshake reaching an outcome
pub fn handshake_outcome(outcome: &'static str) {
    counter!("sessionlink_handshakes_total", "outcome" => outcome).increment(1);
}

/// Update dedup cache size gauge
pub fn set_dedup_cache_size(count: usize) {
    gauge!("sessionlink_dedup_cache_size").set(count as f64);
}
