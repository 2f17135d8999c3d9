//! Message router: moves envelopes from agent outboxes to recipient
//! inboxes.
//!
//! For every message found in any outbox the router validates the
//! envelope, checks its TTL and retry count, resolves the recipient, and
//! then archives and delivers it. Delivery is at-least-once: the archive
//! copy and the inbox write both happen before the source file is removed,
//! so a crash between steps leaves the message in the outbox and a later
//! sweep re-delivers it. Consumers are expected to be idempotent per
//! `trace_id`.
//!
//! Messages within one outbox are delivered in the order they were
//! written; no ordering holds across outboxes.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveBucket, ArchiveStore};
use crate::envelope::{AgentId, Envelope};
use crate::store::{MessageFile, PostboxStore};

/// Router behavior knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Messages whose `retry_count` has reached this value are
    /// dead-lettered instead of delivered.
    pub max_retry_count: u32,
    /// Path of the append-only JSONL routing log. The log is owned
    /// exclusively by the router.
    pub log_path: PathBuf,
}

impl RouterConfig {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            max_retry_count: 10,
            log_path: log_path.into(),
        }
    }
}

/// Where a swept message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOutcome {
    Delivered,
    Invalid,
    Expired,
    Dead,
}

impl RouteOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Dead => "dead",
        }
    }
}

/// Counts from a single router sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub delivered: usize,
    pub invalid: usize,
    pub expired: usize,
    pub dead: usize,
}

#[derive(Serialize)]
struct RoutingLogEntry<'a> {
    timestamp: chrono::DateTime<Utc>,
    message_id: &'a str,
    sender_id: &'a str,
    recipient_id: &'a str,
    outcome: &'a str,
    detail: Option<&'a str>,
}

/// The router. Cheap to construct; all state lives on disk.
pub struct Router {
    store: PostboxStore,
    archive: ArchiveStore,
    config: RouterConfig,
    invalid_total: AtomicU64,
}

impl Router {
    pub fn new(store: PostboxStore, archive: ArchiveStore, config: RouterConfig) -> Self {
        Self {
            store,
            archive,
            config,
            invalid_total: AtomicU64::new(0),
        }
    }

    /// Cumulative count of invalid messages seen by this router instance.
    pub fn invalid_message_count(&self) -> u64 {
        self.invalid_total.load(Ordering::Relaxed)
    }

    /// Run one sweep over every known agent's outbox.
    ///
    /// A sweep is idempotent: running it twice on the same filesystem
    /// state leaves the same final state (modulo at-least-once
    /// duplicates after a mid-sweep crash).
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for agent in self.store.list_agents().context("listing postbox agents")? {
            let files = self
                .store
                .outbox_files(&agent)
                .with_context(|| format!("reading outbox of {agent}"))?;
            for file in files {
                report.scanned += 1;
                match self.route_file(&file) {
                    Ok(outcome) => match outcome {
                        RouteOutcome::Delivered => report.delivered += 1,
                        RouteOutcome::Invalid => report.invalid += 1,
                        RouteOutcome::Expired => report.expired += 1,
                        RouteOutcome::Dead => report.dead += 1,
                    },
                    Err(e) => {
                        // Leave the message in the outbox for the next
                        // sweep (at-least-once delivery).
                        tracing::warn!(
                            path = %file.path.display(),
                            error = %e,
                            "failed to route message, leaving in outbox"
                        );
                    }
                }
            }
        }
        tracing::debug!(
            scanned = report.scanned,
            delivered = report.delivered,
            invalid = report.invalid,
            expired = report.expired,
            dead = report.dead,
            "router sweep complete"
        );
        Ok(report)
    }

    fn route_file(&self, file: &MessageFile) -> Result<RouteOutcome> {
        // 1. Decode. A message that does not parse is archived raw so the
        //    payload survives for post-mortem.
        let envelope = match Envelope::decode(&file.contents) {
            Ok(envelope) => envelope,
            Err(e) => {
                let id = file
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unknown".to_owned());
                self.archive
                    .store_raw(ArchiveBucket::Invalid, Utc::now(), &id, &file.contents)?;
                self.store.remove(&file.path)?;
                self.invalid_total.fetch_add(1, Ordering::Relaxed);
                self.log_raw(&id, "invalid", Some(&e.to_string()));
                return Ok(RouteOutcome::Invalid);
            }
        };

        // 2. Schema validation.
        if let Err(e) = envelope.validate() {
            return self.divert(
                &envelope,
                &file.path,
                ArchiveBucket::Invalid,
                RouteOutcome::Invalid,
                Some(&e.to_string()),
            );
        }

        // 3. TTL.
        if envelope.is_expired(Utc::now()) {
            return self.divert(
                &envelope,
                &file.path,
                ArchiveBucket::Expired,
                RouteOutcome::Expired,
                None,
            );
        }

        // 4. Retry-count exhaustion.
        if envelope.retry_count >= self.config.max_retry_count {
            return self.divert(
                &envelope,
                &file.path,
                ArchiveBucket::Dead,
                RouteOutcome::Dead,
                None,
            );
        }

        // 5. Recipient must be a known agent.
        if envelope.recipient_id.parse::<AgentId>().is_err() {
            return self.divert(
                &envelope,
                &file.path,
                ArchiveBucket::Invalid,
                RouteOutcome::Invalid,
                Some("unknown recipient"),
            );
        }

        // 6. Archive, deliver, then remove from the source outbox. If
        //    delivery or removal fails the message stays put and the next
        //    sweep retries; the inbox consumer deduplicates by trace_id.
        self.archive.store(ArchiveBucket::Archive, &envelope)?;
        self.store
            .enqueue_inbox(&envelope.recipient_id, &envelope)
            .with_context(|| format!("delivering to {}", envelope.recipient_id))?;
        self.store.remove(&file.path)?;

        self.log(&envelope, RouteOutcome::Delivered, None);
        Ok(RouteOutcome::Delivered)
    }

    /// Archive a decodable-but-undeliverable message and drop it from the
    /// outbox.
    fn divert(
        &self,
        envelope: &Envelope,
        source: &std::path::Path,
        bucket: ArchiveBucket,
        outcome: RouteOutcome,
        detail: Option<&str>,
    ) -> Result<RouteOutcome> {
        self.archive.store(bucket, envelope)?;
        self.store.remove(source)?;
        if outcome == RouteOutcome::Invalid {
            self.invalid_total.fetch_add(1, Ordering::Relaxed);
        }
        self.log(envelope, outcome, detail);
        Ok(outcome)
    }

    fn log(&self, envelope: &Envelope, outcome: RouteOutcome, detail: Option<&str>) {
        let entry = RoutingLogEntry {
            timestamp: Utc::now(),
            message_id: &envelope.message_id,
            sender_id: &envelope.sender_id,
            recipient_id: &envelope.recipient_id,
            outcome: outcome.as_str(),
            detail,
        };
        self.append_log(&entry);
    }

    fn log_raw(&self, message_id: &str, outcome: &str, detail: Option<&str>) {
        let entry = RoutingLogEntry {
            timestamp: Utc::now(),
            message_id,
            sender_id: "",
            recipient_id: "",
            outcome,
            detail,
        };
        self.append_log(&entry);
    }

    /// Best-effort append; a failing routing log never blocks delivery.
    fn append_log(&self, entry: &RoutingLogEntry<'_>) {
        let Ok(mut line) = serde_json::to_string(entry) else {
            return;
        };
        line.push('\n');
        if let Some(parent) = self.config.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append routing log entry");
        }
    }
}

/// Continuous router: sweeps on an interval until cancelled.
pub struct RouterService {
    router: Router,
    interval: Duration,
    cancel: CancellationToken,
}

impl RouterService {
    pub fn new(router: Router, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            router,
            interval,
            cancel,
        }
    }

    /// Sweep until the cancellation token fires. Returns the total counts
    /// across all sweeps.
    pub async fn run(self) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        loop {
            let report = self.router.sweep()?;
            total.scanned += report.scanned;
            total.delivered += report.delivered;
            total.invalid += report.invalid;
            total.expired += report.expired;
            total.dead += report.dead;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {
                    tracing::info!("router service cancelled");
                    return Ok(total);
                }
            }
        }
    }
}
