// Delivery counters and telemetry snapshots for the client.
#[cfg(feature = "telemetry")]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "telemetry")]
#[derive(Default)]
pub(crate) struct DeliveryCounters {
    pub(crate) frames_out: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) error_responses_in: AtomicU64,
    pub(crate) segments: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) open_failures: AtomicU64,
    pub(crate) invalid_payloads: AtomicU64,
    pub(crate) feedback_records_in: AtomicU64,
}

/// Point-in-time copy of the process-wide delivery counters.
///
/// Every field stays zero unless the `telemetry` feature is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryCountersSnapshot {
    pub frames_out: u64,
    pub bytes_out: u64,
    pub error_responses_in: u64,
    pub segments: u64,
    pub reconnects: u64,
    pub open_failures: u64,
    pub invalid_payloads: u64,
    pub feedback_records_in: u64,
}

#[cfg(feature = "telemetry")]
static DELIVERY_COUNTERS: std::sync::OnceLock<DeliveryCounters> = std::sync::OnceLock::new();

#[cfg(feature = "telemetry")]
pub(crate) fn delivery_counters() -> &'static DeliveryCounters {
    DELIVERY_COUNTERS.get_or_init(DeliveryCounters::default)
}

pub fn delivery_counters_snapshot() -> DeliveryCountersSnapshot {
    #[cfg(feature = "telemetry")]
    {
        let counters = delivery_counters();
        DeliveryCountersSnapshot {
            frames_out: counters.frames_out.load(Ordering::Relaxed),
            bytes_out: counters.bytes_out.load(Ordering::Relaxed),
            error_responses_in: counters.error_responses_in.load(Ordering::Relaxed),
            segments: counters.segments.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            open_failures: counters.open_failures.load(Ordering::Relaxed),
            invalid_payloads: counters.invalid_payloads.load(Ordering::Relaxed),
            feedback_records_in: counters.feedback_records_in.load(Ordering::Relaxed),
        }
    }
    #[cfg(not(feature = "telemetry"))]
    {
        DeliveryCountersSnapshot::default()
    }
}

pub fn reset_delivery_counters() {
    #[cfg(feature = "telemetry")]
    {
        let counters = delivery_counters();
        counters.frames_out.store(0, Ordering::Relaxed);
        counters.bytes_out.store(0, Ordering::Relaxed);
        counters.error_responses_in.store(0, Ordering::Relaxed);
        counters.segments.store(0, Ordering::Relaxed);
        counters.reconnects.store(0, Ordering::Relaxed);
        counters.open_failures.store(0, Ordering::Relaxed);
        counters.invalid_payloads.store(0, Ordering::Relaxed);
        counters.feedback_records_in.store(0, Ordering::Relaxed);
    }
}

// Each recorder bumps the in-process snapshot and the metrics facade together.

pub(crate) fn record_frames_out(frames: u64, bytes: u64) {
    #[cfg(feature = "telemetry")]
    {
        let counters = delivery_counters();
        counters.frames_out.fetch_add(frames, Ordering::Relaxed);
        counters.bytes_out.fetch_add(bytes, Ordering::Relaxed);
    }
    t_counter!("courier_frames_out_total").increment(frames);
    t_counter!("courier_bytes_out_total").increment(bytes);
}

#[cfg_attr(not(feature = "telemetry"), allow(unused_variables))]
pub(crate) fn record_error_response(status: &'static str) {
    #[cfg(feature = "telemetry")]
    delivery_counters()
        .error_responses_in
        .fetch_add(1, Ordering::Relaxed);
    t_counter!("courier_error_responses_total", "status" => status).increment(1);
}

pub(crate) fn record_segment(reconnect: bool) {
    #[cfg(feature = "telemetry")]
    {
        let counters = delivery_counters();
        counters.segments.fetch_add(1, Ordering::Relaxed);
        if reconnect {
            counters.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }
    t_counter!("courier_segments_total").increment(1);
    if reconnect {
        t_counter!("courier_reconnects_total").increment(1);
    }
}

pub(crate) fn record_open_failure() {
    #[cfg(feature = "telemetry")]
    delivery_counters()
        .open_failures
        .fetch_add(1, Ordering::Relaxed);
    t_counter!("courier_open_failures_total").increment(1);
}

pub(crate) fn record_invalid_payload() {
    #[cfg(feature = "telemetry")]
    delivery_counters()
        .invalid_payloads
        .fetch_add(1, Ordering::Relaxed);
    t_counter!("courier_invalid_payloads_total").increment(1);
}

pub(crate) fn record_feedback_records(count: u64) {
    #[cfg(feature = "telemetry")]
    delivery_counters()
        .feedback_records_in
        .fetch_add(count, Ordering::Relaxed);
    t_counter!("courier_feedback_records_total").increment(count);
}
