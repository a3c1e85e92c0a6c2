use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("relay_sessions_active", "Sessions currently registered").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("relay_messages_total", "Inbound client messages by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static OUTBOUND: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("relay_outbound_total", "Messages written to clients by kind"),
        &["kind"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static STORE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "relay_store_failures_total",
            "Negotiation store calls that failed or timed out",
        ),
        &["op"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "relay_evictions_total",
        "Sessions replaced by a newer connection with the same key",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    // Touch every metric so an idle relay still exports its families.
    Lazy::force(&SESSIONS_ACTIVE);
    Lazy::force(&MESSAGES);
    Lazy::force(&OUTBOUND);
    Lazy::force(&STORE_FAILURES);
    Lazy::force(&EVICTIONS);

    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn export_lists_relay_families() {
        EVICTIONS.inc();
        MESSAGES.with_label_values(&["offer"]).inc();
        let text = export_prometheus();
        assert!(text.contains("relay_evictions_total"));
        assert!(text.contains("relay_messages_total{kind=\"offer\"}"));
        assert!(text.contains("relay_sessions_active"));
    }
}
