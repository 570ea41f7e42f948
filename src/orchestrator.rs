// src/orchestrator.rs
//
// Owns the source registry, funnels every emitted item through the
// dedup gate into workflow dispatch, and runs the periodic health sweep.
// Each inbound item gets its own task in a JoinSet arena so stop() can
// drain or cancel them deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::FeederConfig;
use crate::dedup::{DedupStats, DuplicateDetector};
use crate::dispatch::{DispatchOutcome, WorkflowDispatcher};
use crate::error::Result;
use crate::news_item::NewsItem;
use crate::sources::{ItemSink, NewsSource, SourceFactory, SourceStatus};

#[derive(Default)]
struct PipelineStats {
    items_seen: AtomicU64,
    duplicates_dropped: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    invalid_items: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub service: String,
    pub accepting: bool,
    pub sources: Vec<SourceStatus>,
    pub active_tasks: usize,
    pub dispatcher_connected: bool,
    pub dedup: DedupStats,
    pub items_seen: u64,
    pub duplicates_dropped: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
    pub invalid_items: u64,
}

pub struct Orchestrator {
    config: FeederConfig,
    detector: Arc<DuplicateDetector>,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    sources: RwLock<HashMap<String, Arc<dyn NewsSource>>>,
    tasks: Mutex<JoinSet<()>>,
    accepting: AtomicBool,
    stats: PipelineStats,
    monitor: tokio::sync::Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Orchestrator {
    pub fn new(
        config: FeederConfig,
        detector: Arc<DuplicateDetector>,
        dispatcher: Arc<dyn WorkflowDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            detector,
            dispatcher,
            sources: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            accepting: AtomicBool::new(false),
            stats: PipelineStats::default(),
            monitor: tokio::sync::Mutex::new(None),
        })
    }

    /// Verifies the workflow backend is reachable, then constructs every
    /// enabled source with the ingestion sink wired in. Backend and factory
    /// errors propagate: a half-built orchestrator is never started.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if !self.dispatcher.health_check().await {
            return Err(crate::error::FeederError::Backend(
                "workflow backend unreachable at startup".into(),
            ));
        }
        if !self.detector.is_healthy().await {
            warn!("dedup backend unhealthy at startup, running degraded");
        }

        let factory = SourceFactory::new();
        let mut registry = self.sources.write().await;

        for source_config in self.config.enabled_sources() {
            let weak = Arc::downgrade(self);
            let sink: ItemSink = Arc::new(move |item| {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.on_news_item(item);
                }
            });
            let source = factory.create(source_config, sink)?;
            info!(
                source = %source.name(),
                source_type = source.source_type(),
                mechanism = source.mechanism().as_str(),
                "source constructed"
            );
            registry.insert(source.name().to_string(), source);
        }
        info!(count = registry.len(), "orchestrator initialized");
        Ok(())
    }

    /// Starts every source, continuing past individual failures, then
    /// launches the health monitor.
    pub async fn start(self: &Arc<Self>) {
        self.accepting.store(true, Ordering::SeqCst);

        let registry = self.sources.read().await;
        for (name, source) in registry.iter() {
            if let Err(e) = source.start().await {
                error!(source = %name, error = %e, "source failed to start");
            }
        }
        drop(registry);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.clone().health_monitor(stop_rx));
        *self.monitor.lock().await = Some((stop_tx, handle));
        info!("orchestrator started");
    }

    /// Ingestion entrypoint. Called synchronously from source emit paths,
    /// so it only spawns: dedup and dispatch run on their own task.
    pub fn on_news_item(self: &Arc<Self>, item: NewsItem) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(source = %item.source_name, "item dropped, orchestrator not accepting");
            return;
        }
        let orchestrator = self.clone();
        if let Ok(mut tasks) = self.tasks.lock() {
            // reap finished tasks so the arena does not grow unbounded
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                orchestrator.process_item(item).await;
            });
        }
    }

    async fn process_item(&self, item: NewsItem) {
        if !item.is_valid() {
            self.stats.invalid_items.fetch_add(1, Ordering::Relaxed);
            warn!(source = %item.source_name, "invalid item rejected at ingestion gate");
            return;
        }

        self.stats.items_seen.fetch_add(1, Ordering::Relaxed);
        counter!("feeder_items_seen_total").increment(1);
        let fingerprint = item.content_fingerprint.clone();

        if self.detector.is_duplicate(&fingerprint).await {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            counter!("feeder_duplicates_total").increment(1);
            debug!(fingerprint, "duplicate dropped");
            return;
        }

        // the mark is the atomic gate: only the first task for a
        // fingerprint proceeds to dispatch
        if !self.detector.mark_processed(&fingerprint).await {
            self.stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            counter!("feeder_duplicates_total").increment(1);
            debug!(fingerprint, "lost mark race, sibling task dispatches");
            return;
        }

        match self.dispatcher.submit(&item).await {
            DispatchOutcome::Started { workflow_id } => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                counter!("feeder_workflows_started_total").increment(1);
                debug!(workflow_id, "workflow dispatched");
            }
            DispatchOutcome::Failed { workflow_id, reason } => {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                counter!("feeder_dispatch_failures_total").increment(1);
                warn!(workflow_id, reason, "workflow dispatch failed");
            }
        }
    }

    /// Periodic sweep over backend connectivity and source health. An
    /// error in one iteration is logged, never fatal to the loop.
    async fn health_monitor(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.service.health_interval_seconds);
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatcher_ok = self.dispatcher.health_check().await;
                    let dedup_ok = self.detector.is_healthy().await;
                    gauge!("feeder_dispatcher_up").set(if dispatcher_ok { 1.0 } else { 0.0 });
                    gauge!("feeder_dedup_up").set(if dedup_ok { 1.0 } else { 0.0 });
                    if !dispatcher_ok {
                        warn!("workflow backend unreachable");
                    }
                    if !dedup_ok {
                        warn!("dedup backend unhealthy");
                    }

                    let registry = self.sources.read().await;
                    for (name, source) in registry.iter() {
                        let healthy = source.is_healthy().await;
                        gauge!("feeder_source_up", "source" => name.clone())
                            .set(if healthy { 1.0 } else { 0.0 });
                        if !healthy {
                            warn!(source = %name, "source unhealthy");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
        info!("health monitor stopped");
    }

    /// Stops sources best-effort, then drains in-flight item tasks within
    /// the shutdown grace window before aborting stragglers. Safe to call
    /// after a partial start().
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("orchestrator stopping, no longer accepting items");

        let registry = self.sources.read().await;
        for (name, source) in registry.iter() {
            if let Err(e) = source.stop().await {
                warn!(source = %name, error = %e, "source stop failed");
            }
        }
        drop(registry);

        if let Some((stop_tx, handle)) = self.monitor.lock().await.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }

        let mut pending = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => JoinSet::new(),
        };
        let grace = Duration::from_secs(self.config.service.shutdown_timeout_seconds);
        let drained = tokio::time::timeout(grace, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = pending.len(), "grace period elapsed, aborting item tasks");
            pending.abort_all();
            while pending.join_next().await.is_some() {}
        }
        info!("orchestrator stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Read-only aggregate snapshot; safe to call concurrently with
    /// everything else.
    pub async fn get_status(&self) -> StatusSnapshot {
        let registry = self.sources.read().await;
        let mut sources = Vec::with_capacity(registry.len());
        for source in registry.values() {
            sources.push(source.status().await);
        }
        sources.sort_by(|a, b| a.name.cmp(&b.name));

        let active_tasks = match self.tasks.lock() {
            Ok(mut tasks) => {
                while tasks.try_join_next().is_some() {}
                tasks.len()
            }
            Err(_) => 0,
        };

        StatusSnapshot {
            service: self.config.service.name.clone(),
            accepting: self.accepting.load(Ordering::SeqCst),
            sources,
            active_tasks,
            dispatcher_connected: self.dispatcher.is_connected(),
            dedup: self.detector.stats().await,
            items_seen: self.stats.items_seen.load(Ordering::Relaxed),
            duplicates_dropped: self.stats.duplicates_dropped.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.stats.dispatch_failures.load(Ordering::Relaxed),
            invalid_items: self.stats.invalid_items.load(Ordering::Relaxed),
        }
    }

    pub async fn source_count(&self) -> usize {
        self.sources.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchConfig, ServiceConfig};
    use crate::error::FeederError;
    use async_trait::async_trait;

    struct CountingDispatcher {
        submits: AtomicU64,
    }

    impl CountingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submits: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkflowDispatcher for CountingDispatcher {
        async fn submit(&self, item: &NewsItem) -> DispatchOutcome {
            self.submits.fetch_add(1, Ordering::SeqCst);
            DispatchOutcome::Started {
                workflow_id: item.workflow_id(),
            }
        }

        async fn describe(&self, _workflow_id: &str) -> Result<String> {
            Ok("running".into())
        }

        async fn cancel(&self, _workflow_id: &str) -> Result<()> {
            Err(FeederError::Dispatch("not supported in test".into()))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn test_config() -> FeederConfig {
        FeederConfig {
            service: ServiceConfig {
                shutdown_timeout_seconds: 5,
                ..ServiceConfig::default()
            },
            dispatch: DispatchConfig::default(),
            ..FeederConfig::default()
        }
    }

    fn detector() -> Arc<DuplicateDetector> {
        Arc::new(DuplicateDetector::in_memory(Duration::from_secs(3600)))
    }

    // Fixed date: without one the builder falls back to now(), which is
    // part of the fingerprint and would make every copy unique.
    fn item(link: &str) -> NewsItem {
        let date = chrono::DateTime::from_timestamp(1_756_000_000, 0).unwrap();
        NewsItem::builder("Same story", link, "test", "rss")
            .publication_date(date)
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn hundred_concurrent_items_dispatch_once() {
        let dispatcher = CountingDispatcher::new();
        let orchestrator =
            Orchestrator::new(test_config(), detector(), dispatcher.clone());
        orchestrator.accepting.store(true, Ordering::SeqCst);

        for _ in 0..100 {
            orchestrator.on_news_item(item("https://example.com/story"));
        }
        orchestrator.stop().await;

        assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 1);
        let status = orchestrator.get_status().await;
        assert_eq!(status.items_seen, 100);
        assert_eq!(status.duplicates_dropped, 99);
        assert_eq!(status.dispatched, 1);
    }

    #[tokio::test]
    async fn distinct_items_all_dispatch() {
        let dispatcher = CountingDispatcher::new();
        let orchestrator =
            Orchestrator::new(test_config(), detector(), dispatcher.clone());
        orchestrator.accepting.store(true, Ordering::SeqCst);

        for i in 0..5 {
            orchestrator.on_news_item(item(&format!("https://example.com/{i}")));
        }
        orchestrator.stop().await;

        assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn items_after_stop_are_dropped() {
        let dispatcher = CountingDispatcher::new();
        let orchestrator =
            Orchestrator::new(test_config(), detector(), dispatcher.clone());
        orchestrator.accepting.store(true, Ordering::SeqCst);
        orchestrator.stop().await;

        orchestrator.on_news_item(item("https://example.com/late"));
        tokio::task::yield_now().await;

        assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_item_never_reaches_dispatch() {
        let dispatcher = CountingDispatcher::new();
        let orchestrator =
            Orchestrator::new(test_config(), detector(), dispatcher.clone());
        orchestrator.accepting.store(true, Ordering::SeqCst);

        let mut bad = item("https://example.com/ok");
        bad.title = String::new();
        orchestrator.on_news_item(bad);
        orchestrator.stop().await;

        assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.get_status().await.invalid_items, 1);
    }
}
