//! Prometheus counter names and helpers.
//!
//! All instrumentation goes through the `metrics` facade; the binary
//! installs a `metrics-exporter-prometheus` recorder and the HTTP surface
//! renders it on `GET /metrics`. Library code calls these helpers freely —
//! without an installed recorder they are no-ops, which keeps the core
//! usable as plain library code in tests.

use metrics::{counter, gauge};

/// One datagram arrived on a listener socket.
pub fn record_received(listener: &str) {
    counter!("flowline_packets_received_total", "listener" => listener.to_string()).increment(1);
}

/// One datagram was discarded because the worker queue was full.
pub fn record_dropped(listener: &str) {
    counter!("flowline_dropped_packets_total", "listener" => listener.to_string()).increment(1);
}

/// One datagram fully decoded and handed downstream.
pub fn record_decoded(scheme: &'static str) {
    counter!("flowline_packets_decoded_total", "scheme" => scheme).increment(1);
}

/// One datagram failed to decode.
pub fn record_decode_error(scheme: &'static str, kind: &'static str) {
    counter!("flowline_decode_errors_total", "scheme" => scheme, "kind" => kind).increment(1);
}

pub fn record_template_lookup(hit: bool) {
    if hit {
        counter!("flowline_template_cache_hits_total").increment(1);
    } else {
        counter!("flowline_template_cache_misses_total").increment(1);
    }
}

pub fn record_sampling_table_size(size: usize) {
    gauge!("flowline_sampling_table_entries").set(size as f64);
}

pub fn record_flows_produced(scheme: &'static str, count: u64) {
    counter!("flowline_flows_produced_total", "scheme" => scheme).increment(count);
}

pub fn record_transport_send() {
    counter!("flowline_transport_sends_total").increment(1);
}

pub fn record_transport_error() {
    counter!("flowline_transport_errors_total").increment(1);
}
