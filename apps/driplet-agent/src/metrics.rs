use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SESSIONS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "driplet_sessions_started_total",
        "relay sessions started by the supervisor",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "driplet_sessions_active",
        "relay sessions that have not yet closed",
    ))
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static SESSIONS_CLOSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "driplet_sessions_closed_total",
            "relay sessions closed by reason",
        ),
        &["reason"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "driplet_messages_sent_total",
            "frames written to the relay by kind",
        ),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static WRITE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "driplet_write_failures_total",
        "relay writes that failed and closed their session",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LAUNCH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "driplet_process_launch_failures_total",
        "log commands that could not be started",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
