// src/sources/events.rs
//
// Buffered event pipeline for push-style sources. Listeners push raw
// payloads into a bounded FIFO buffer; when full the oldest event is
// evicted with a warning so producers never block. A drain loop converts
// buffered events through a source-specific handler and emits the items.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EventConfig;
use crate::error::Result;
use crate::news_item::NewsItem;
use crate::sources::SourceCore;

const DRAIN_TICK: Duration = Duration::from_millis(500);

struct BufferedEvent {
    payload: serde_json::Value,
    received: Instant,
}

/// Bounded FIFO buffer between listeners and the drain loop.
pub struct EventBuffer {
    queue: Mutex<VecDeque<BufferedEvent>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Never blocks the producer: a full buffer drops its oldest entry.
    pub async fn push(&self, source: &str, payload: serde_json::Value) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
            counter!("feeder_events_evicted_total", "source" => source.to_string())
                .increment(1);
            warn!(source, "event buffer full, oldest event evicted");
        }
        queue.push_back(BufferedEvent {
            payload,
            received: Instant::now(),
        });
    }

    async fn drain(&self) -> Vec<BufferedEvent> {
        let mut queue = self.queue.lock().await;
        queue.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Occupancy in [0,1].
    pub async fn fill(&self) -> f64 {
        self.len().await as f64 / self.capacity as f64
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Converts one raw event payload into a NewsItem. A conversion error skips
/// that event only.
pub trait EventHandler: Send + Sync {
    fn convert(&self, payload: serde_json::Value) -> Result<NewsItem>;
}

pub struct EventDriver;

impl EventDriver {
    /// Spawns the drain loop: periodically empties the buffer, drops stale
    /// events, converts and emits the rest.
    pub fn spawn(
        core: Arc<SourceCore>,
        config: EventConfig,
        buffer: Arc<EventBuffer>,
        handler: Arc<dyn EventHandler>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            core.loop_alive.store(true, Ordering::Relaxed);
            let max_age = Duration::from_secs(config.max_event_age_seconds);
            let mut ticker = tokio::time::interval(DRAIN_TICK);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::drain_once(&core, &buffer, handler.as_ref(), max_age).await;
                    }
                    _ = stop.changed() => {
                        // final drain so accepted events are not lost on stop
                        Self::drain_once(&core, &buffer, handler.as_ref(), max_age).await;
                        break;
                    }
                }
            }

            core.loop_alive.store(false, Ordering::Relaxed);
            info!(source = %core.name(), "event drain loop stopped");
        })
    }

    async fn drain_once(
        core: &SourceCore,
        buffer: &EventBuffer,
        handler: &dyn EventHandler,
        max_age: Duration,
    ) {
        let events = buffer.drain().await;
        if events.is_empty() {
            return;
        }
        let batch = events.len();
        let started = Instant::now();

        for event in events {
            if event.received.elapsed() > max_age {
                debug!(source = %core.name(), "dropping stale event");
                continue;
            }
            match handler.convert(event.payload) {
                Ok(item) => core.emit(item),
                Err(e) => {
                    core.record_item_failure();
                    warn!(source = %core.name(), error = %e, "event conversion failed");
                }
            }
        }

        core.record_fetch_success(started.elapsed().as_millis() as u64);
        debug!(source = %core.name(), batch, "event batch drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateMechanism;
    use crate::error::FeederError;
    use crate::sources::{ItemSink, SourceState};
    use serde_json::json;

    struct TitleHandler;

    impl EventHandler for TitleHandler {
        fn convert(&self, payload: serde_json::Value) -> Result<NewsItem> {
            let title = payload
                .get("title")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FeederError::Validation("missing title".into()))?;
            let link = payload
                .get("link")
                .and_then(|v| v.as_str())
                .ok_or_else(|| FeederError::Validation("missing link".into()))?;
            NewsItem::builder(title, link, "test", "webhook").build()
        }
    }

    #[tokio::test]
    async fn full_buffer_evicts_oldest() {
        let buffer = EventBuffer::new(1000);
        for i in 0..1500 {
            buffer.push("test", json!({ "seq": i })).await;
        }
        assert_eq!(buffer.len().await, 1000);
        assert_eq!(buffer.evicted(), 500);

        // the retained events are the most recent 1000
        let events = buffer.drain().await;
        assert_eq!(events[0].payload["seq"], 500);
        assert_eq!(events[999].payload["seq"], 1499);
    }

    #[tokio::test]
    async fn drain_converts_and_skips_malformed() {
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: ItemSink = {
            let emitted = emitted.clone();
            Arc::new(move |item: NewsItem| emitted.lock().unwrap().push(item.title))
        };
        let core = SourceCore::new("test", "webhook", UpdateMechanism::EventDriven, sink);
        core.set_state(SourceState::Running);
        let buffer = Arc::new(EventBuffer::new(10));

        buffer
            .push("test", json!({ "title": "Good", "link": "https://example.com/a" }))
            .await;
        buffer.push("test", json!({ "garbage": true })).await;
        buffer
            .push("test", json!({ "title": "Also good", "link": "https://example.com/b" }))
            .await;

        EventDriver::drain_once(
            &core,
            &buffer,
            &TitleHandler,
            Duration::from_secs(3600),
        )
        .await;

        assert_eq!(*emitted.lock().unwrap(), vec!["Good", "Also good"]);
        assert_eq!(core.metrics.items_failed.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.len().await, 0);
    }

    #[tokio::test]
    async fn drain_drops_events_past_max_age() {
        let emitted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink: ItemSink = {
            let emitted = emitted.clone();
            Arc::new(move |item: NewsItem| emitted.lock().unwrap().push(item.title))
        };
        let core = SourceCore::new("test", "webhook", UpdateMechanism::EventDriven, sink);
        core.set_state(SourceState::Running);
        let buffer = Arc::new(EventBuffer::new(10));

        buffer
            .push("test", json!({ "title": "Stale", "link": "https://example.com/old" }))
            .await;
        // age the first event past the cutoff, then queue a fresh one
        tokio::time::sleep(Duration::from_millis(200)).await;
        buffer
            .push("test", json!({ "title": "Fresh", "link": "https://example.com/new" }))
            .await;

        EventDriver::drain_once(
            &core,
            &buffer,
            &TitleHandler,
            Duration::from_millis(100),
        )
        .await;

        assert_eq!(*emitted.lock().unwrap(), vec!["Fresh"]);
        // a stale drop is not a conversion failure
        assert_eq!(core.metrics.items_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn stop_runs_a_final_drain() {
        let emitted = Arc::new(AtomicU64::new(0));
        let sink: ItemSink = {
            let emitted = emitted.clone();
            Arc::new(move |_| {
                emitted.fetch_add(1, Ordering::Relaxed);
            })
        };
        let core = SourceCore::new("test", "webhook", UpdateMechanism::EventDriven, sink);
        core.set_state(SourceState::Running);
        let buffer = Arc::new(EventBuffer::new(10));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = EventDriver::spawn(
            core.clone(),
            EventConfig::default(),
            buffer.clone(),
            Arc::new(TitleHandler),
            stop_rx,
        );
        // let the loop pass its first (immediate) tick before pushing
        tokio::task::yield_now().await;
        buffer
            .push("test", json!({ "title": "Late", "link": "https://example.com/z" }))
            .await;
        let _ = stop_tx.send(true);
        handle.await.unwrap();

        assert_eq!(emitted.load(Ordering::Relaxed), 1);
        assert!(!core.loop_alive.load(Ordering::Relaxed));
    }
}
