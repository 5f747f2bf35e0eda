//! Client instrumentation.
//!
//! Uses the `metrics` facade. Nothing is recorded until the embedding
//! application installs a recorder.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const FRAMES_TOTAL: &str = "sockio_frames_total";
    pub const FRAME_BYTES: &str = "sockio_frame_bytes";
    pub const DECODE_ERRORS_TOTAL: &str = "sockio_decode_errors_total";
    pub const RECONNECTS_TOTAL: &str = "sockio_reconnects_total";
    pub const CONNECTED: &str = "sockio_connected";
    pub const ACKS_PENDING: &str = "sockio_acks_pending";
}

/// Describe every metric the client records.
pub fn init_metrics() {
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_histogram!(names::FRAME_BYTES, "Frame size in bytes");
    metrics::describe_counter!(
        names::DECODE_ERRORS_TOTAL,
        "Inbound frames dropped because they could not be decoded"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Reconnection attempts started");
    metrics::describe_gauge!(names::CONNECTED, "1 while the session is open");
    metrics::describe_gauge!(names::ACKS_PENDING, "Emitted events awaiting an ack");
}

/// Record one frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    histogram!(names::FRAME_BYTES, "direction" => direction).record(bytes as f64);
}

pub fn record_decode_error() {
    counter!(names::DECODE_ERRORS_TOTAL).increment(1);
}

pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

pub fn set_connected(connected: bool) {
    gauge!(names::CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub fn set_acks_pending(count: usize) {
    gauge!(names::ACKS_PENDING).set(count as f64);
}
