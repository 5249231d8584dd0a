use once_cell::sync::Lazy;
use prometheus::{opts, GaugeVec, IntCounter, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Incremented by the gitops worker for every event pulled off the queue.
pub static EVENTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("gitopsd_events_processed_total", "Processed event count").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Latest release per (env, app) at the GitOps repo head; value is the
/// commit time as a unix epoch. Maintained by the release-state worker.
pub static RELEASES: Lazy<GaugeVec> = Lazy::new(|| {
    let g = GaugeVec::new(
        opts!("gitopsd_release_info", "Latest release at the gitops repo head"),
        &["env", "app", "sha"],
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});
