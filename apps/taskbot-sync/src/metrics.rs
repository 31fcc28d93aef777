use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|err| panic!("invalid metric {name}: {err}"));
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|err| panic!("invalid metric {name}: {err}"));
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static FRAMES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "taskbot_sync_frames_sent_total",
        "envelopes written to the socket by kind",
        &["kind"],
    )
});

pub static FRAMES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "taskbot_sync_frames_received_total",
        "envelopes read from the socket by kind",
        &["kind"],
    )
});

pub static FRAMES_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "taskbot_sync_frames_malformed_total",
        "inbound frames dropped because they could not be decoded",
    )
});

pub static RECONNECT_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "taskbot_sync_reconnect_attempts_total",
        "reconnect attempts scheduled after an unclean close",
    )
});

pub static INVALIDATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "taskbot_sync_cache_invalidations_total",
        "query cache keys invalidated by key kind",
        &["key"],
    )
});

pub static QUEUED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "taskbot_sync_outbound_queued",
        "envelopes waiting for the connection to come up",
    ))
    .unwrap_or_else(|err| panic!("invalid metric: {err}"));
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(target = "taskbot.sync.metrics", error = %err, "metrics encode error");
    }
    buffer
}
