//! `archon route`: run the message router, one sweep or continuously.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use archon_postbox::{ArchiveStore, PostboxStore, Router, RouterConfig, RouterService, SweepReport};

use crate::config::ArchonConfig;

fn build_router(config: &ArchonConfig) -> Result<Router> {
    let store = PostboxStore::open(&config.postbox_root)?;
    let archive = ArchiveStore::open(&config.archive_root)?;
    let router_config = RouterConfig::new(config.log_dir.join("routing_log.jsonl"));
    Ok(Router::new(store, archive, router_config))
}

fn print_report(report: &SweepReport) {
    println!(
        "swept {} messages: delivered={} invalid={} expired={} dead={}",
        report.scanned, report.delivered, report.invalid, report.expired, report.dead
    );
}

/// Run one router sweep. Always exits 0 unless the postbox itself is
/// unusable.
pub fn sweep_once(config: &ArchonConfig) -> Result<u8> {
    let router = build_router(config)?;
    let report = router.sweep()?;
    print_report(&report);
    Ok(0)
}

/// Run the router continuously until Ctrl-C.
pub async fn watch(config: &ArchonConfig, interval: Duration) -> Result<u8> {
    let router = build_router(config)?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, stopping router");
            signal_cancel.cancel();
        }
    });

    let service = RouterService::new(router, interval, cancel);
    let total = service.run().await?;
    print_report(&total);
    Ok(0)
}
