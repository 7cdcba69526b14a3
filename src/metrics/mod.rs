use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    self, opts, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounterVec, IntGauge,
};
use tracing::error;

static DISPATCH_RESULT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slotwise_dispatch_total", "commands dispatched by outcome"),
        &["result"]
    )
    .expect("dispatch counter registration must succeed")
});

static DISPATCH_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "slotwise_dispatch_timer",
        "dispatch latency in microseconds including redirects",
        &["result"],
        vec![1_000.0, 10_000.0, 40_000.0, 100_000.0, 200_000.0]
    )
    .expect("dispatch timer histogram registration must succeed")
});

static REDIRECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slotwise_redirect_total", "redirections and retries seen by dispatch"),
        &["kind"]
    )
    .expect("redirect counter registration must succeed")
});

static REFRESHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slotwise_topology_refresh_total", "slot table refreshes by outcome"),
        &["result"]
    )
    .expect("refresh counter registration must succeed")
});

static NODE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("slotwise_node_event_total", "connection pool membership events"),
        &["event"]
    )
    .expect("node event counter registration must succeed")
});

static POOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!("slotwise_pool_size", "nodes currently held by the pool"))
        .expect("pool size gauge registration must succeed")
});

/// Record a finished dispatch. `result` is `"ok"` or an error kind.
pub fn dispatch(result: &str, elapsed: Duration) {
    DISPATCH_RESULT.with_label_values(&[result]).inc();
    DISPATCH_TIMER
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64() * 1_000_000.0);
}

pub fn dispatch_total(result: &str) -> u64 {
    DISPATCH_RESULT.with_label_values(&[result]).get()
}

/// Record a redirect or retryable reply (`moved`, `ask`, `tryagain`, ...).
pub fn redirect(kind: &str) {
    REDIRECTS.with_label_values(&[kind]).inc();
}

pub fn redirect_total(kind: &str) -> u64 {
    REDIRECTS.with_label_values(&[kind]).get()
}

/// Record a topology refresh outcome (`applied`, `stale`, `failed`).
pub fn refresh(result: &str) {
    REFRESHES.with_label_values(&[result]).inc();
}

pub fn refresh_total(result: &str) -> u64 {
    REFRESHES.with_label_values(&[result]).get()
}

pub fn node_event(event: &str) {
    NODE_EVENTS.with_label_values(&[event]).inc();
}

pub fn pool_size(size: usize) {
    POOL_SIZE.set(size as i64);
}

/// Encode every registered metric in the prometheus text format.
pub fn render() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %err, "failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_render() {
        let before = redirect_total("moved");
        redirect("moved");
        assert_eq!(redirect_total("moved"), before + 1);

        refresh("applied");
        dispatch("ok", Duration::from_millis(2));
        let text = render();
        assert!(text.contains("slotwise_redirect_total"));
        assert!(text.contains("slotwise_topology_refresh_total"));
        assert!(text.contains("slotwise_dispatch_timer"));
    }
}
