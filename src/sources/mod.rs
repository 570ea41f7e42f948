// src/sources/mod.rs
//
// Source lifecycle model. Every source owns a SourceCore (state machine,
// metrics, item sink) and composes one of two drivers: a polling loop
// (polling.rs) or a buffered event pipeline (events.rs). Concrete variants
// only contribute fetch/convert logic.

pub mod chat;
pub mod events;
pub mod factory;
pub mod http_poll;
pub mod polling;
pub mod rss;
pub mod webhook;
pub mod websocket;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tracing::debug;

use crate::config::UpdateMechanism;
use crate::error::Result;
use crate::news_item::NewsItem;

pub use factory::SourceFactory;

/// Callback every source emits items into. Must not block: the orchestrator
/// installs a handler that hands off to its own task immediately.
pub type ItemSink = Arc<dyn Fn(NewsItem) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Lifecycle surface the orchestrator drives. Variants implement this by
/// delegating to their driver.
#[async_trait]
pub trait NewsSource: Send + Sync {
    fn name(&self) -> &str;

    fn source_type(&self) -> &'static str;

    fn mechanism(&self) -> UpdateMechanism;

    /// Idempotent: a second `start()` on a running source logs and returns.
    async fn start(&self) -> Result<()>;

    /// Idempotent; must deregister listeners before stopping the
    /// processing loop.
    async fn stop(&self) -> Result<()>;

    async fn is_healthy(&self) -> bool;

    async fn status(&self) -> SourceStatus;
}

/// Per-source counters. Written only from the source's own tasks; the
/// health monitor reads slightly-stale snapshots without coordination.
#[derive(Default)]
pub struct SourceMetrics {
    pub fetch_attempts: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub items_emitted: AtomicU64,
    pub items_failed: AtomicU64,
    pub last_success_unix: AtomicU64,
    pub total_fetch_ms: AtomicU64,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub consecutive_failures: u64,
    pub items_emitted: u64,
    pub items_failed: u64,
    pub last_success_unix: u64,
    pub avg_fetch_ms: u64,
    pub last_error: Option<String>,
}

impl SourceMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.fetch_attempts.load(Ordering::Relaxed);
        let total_ms = self.total_fetch_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            fetch_attempts: attempts,
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            last_success_unix: self.last_success_unix.load(Ordering::Relaxed),
            avg_fetch_ms: if attempts > 0 { total_ms / attempts } else { 0 },
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }

    /// Failure rate over all fetch attempts, 0.0 when none yet.
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.fetch_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.fetch_failures.load(Ordering::Relaxed) as f64 / attempts as f64
    }
}

/// Shared plumbing each variant wraps in an `Arc`: state machine, metrics,
/// the sink, and a liveness flag its driver task maintains.
pub struct SourceCore {
    name: String,
    source_type: &'static str,
    mechanism: UpdateMechanism,
    state: Mutex<SourceState>,
    pub metrics: SourceMetrics,
    sink: ItemSink,
    started_unix: AtomicU64,
    /// Set while the driver loop is running, cleared when it exits. An
    /// event source whose drain loop died is unhealthy even if "running".
    pub loop_alive: AtomicBool,
}

impl SourceCore {
    pub fn new(
        name: impl Into<String>,
        source_type: &'static str,
        mechanism: UpdateMechanism,
        sink: ItemSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source_type,
            mechanism,
            state: Mutex::new(SourceState::Stopped),
            metrics: SourceMetrics::default(),
            sink,
            started_unix: AtomicU64::new(0),
            loop_alive: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_type(&self) -> &'static str {
        self.source_type
    }

    pub fn mechanism(&self) -> UpdateMechanism {
        self.mechanism
    }

    pub fn state(&self) -> SourceState {
        self.state.lock().map(|g| *g).unwrap_or(SourceState::Error)
    }

    pub fn set_state(&self, next: SourceState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = next;
        }
        if next == SourceState::Running {
            self.started_unix
                .store(Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
        }
    }

    pub fn started_unix(&self) -> u64 {
        self.started_unix.load(Ordering::Relaxed)
    }

    /// Delivers one item to the sink and counts it.
    pub fn emit(&self, item: NewsItem) {
        self.metrics.items_emitted.fetch_add(1, Ordering::Relaxed);
        counter!("feeder_items_emitted_total", "source" => self.name.clone()).increment(1);
        debug!(source = %self.name, fingerprint = %item.content_fingerprint, "item emitted");
        (self.sink)(item);
    }

    pub fn record_item_failure(&self) {
        self.metrics.items_failed.fetch_add(1, Ordering::Relaxed);
        counter!("feeder_item_failures_total", "source" => self.name.clone()).increment(1);
    }

    pub fn record_fetch_success(&self, elapsed_ms: u64) {
        self.metrics.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        self.metrics.consecutive_failures.store(0, Ordering::Relaxed);
        self.metrics
            .total_fetch_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.metrics
            .last_success_unix
            .store(Utc::now().timestamp().max(0) as u64, Ordering::Relaxed);
        counter!("feeder_fetches_total", "source" => self.name.clone()).increment(1);
    }

    pub fn record_fetch_failure(&self, error: &str) {
        self.metrics.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        self.metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.metrics.last_error.lock() {
            *guard = Some(error.to_string());
        }
        counter!("feeder_fetch_failures_total", "source" => self.name.clone()).increment(1);
    }
}

/// Read-only snapshot published through `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub source_type: String,
    pub mechanism: String,
    pub state: SourceState,
    pub healthy: bool,
    pub metrics: MetricsSnapshot,
    /// Buffer occupancy in [0,1] for event-driven sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_fill: Option<f64>,
}

impl SourceStatus {
    pub fn of(core: &SourceCore, healthy: bool, buffer_fill: Option<f64>) -> Self {
        Self {
            name: core.name().to_string(),
            source_type: core.source_type().to_string(),
            mechanism: core.mechanism().as_str().to_string(),
            state: core.state(),
            healthy,
            metrics: core.metrics.snapshot(),
            buffer_fill,
        }
    }
}

/// Health rule for polling sources: running, fetched recently (within
/// twice the interval, grace for the startup window), failure rate at
/// or under one half.
pub(crate) fn polling_healthy(core: &SourceCore, interval_seconds: u64) -> bool {
    if core.state() != SourceState::Running {
        return false;
    }
    let now = Utc::now().timestamp().max(0) as u64;
    let last = core
        .metrics
        .last_success_unix
        .load(Ordering::Relaxed)
        .max(core.started_unix());
    if now.saturating_sub(last) > 2 * interval_seconds {
        return false;
    }
    core.metrics.failure_rate() <= 0.5
}

/// Health rule for event sources: running, drain loop alive, buffer under
/// 90% occupancy.
pub(crate) fn event_healthy(core: &SourceCore, buffer_fill: f64) -> bool {
    core.state() == SourceState::Running
        && core.loop_alive.load(Ordering::Relaxed)
        && buffer_fill < 0.9
}
