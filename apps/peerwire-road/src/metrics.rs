use once_cell::sync::Lazy;
use peerwire_mailbox::MailboxStore;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SIGNAL_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("signal_requests_total", "Signaling requests by route and outcome"),
        &["route", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNALS_DEPOSITED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("signals_deposited_total", "Signals parked in mailboxes"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ACTIVE_ROOMS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("signal_rooms_active", "Rooms currently held by the relay").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RECORDS_PRUNED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "signal_records_pruned",
        "Records dropped after the retention window since start",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static MAILBOXES_EVICTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "signal_mailboxes_evicted",
        "Mailboxes evicted by the sweep since start",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static ROOMS_EVICTED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("signal_rooms_evicted", "Rooms evicted by the sweep since start")
        .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Copies store counters into the gauges right before a scrape.
pub fn observe_store(store: &MailboxStore) {
    let stats = store.stats();
    ACTIVE_ROOMS.set(store.room_count() as i64);
    RECORDS_PRUNED.set(stats.records_pruned as i64);
    MAILBOXES_EVICTED.set(stats.mailboxes_evicted as i64);
    ROOMS_EVICTED.set(stats.rooms_evicted as i64);
}

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
