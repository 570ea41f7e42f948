// tests/pipeline.rs
//
// End-to-end pipeline over a real webhook source: HTTP in, dedup gate,
// workflow dispatch out. Uses a counting dispatcher instead of a real
// workflow backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use news_feeder::config::{FeederConfig, ServiceConfig};
use news_feeder::dedup::DuplicateDetector;
use news_feeder::dispatch::{DispatchOutcome, WorkflowDispatcher};
use news_feeder::news_item::NewsItem;
use news_feeder::orchestrator::Orchestrator;

const WEBHOOK_PORT: u16 = 19731;

struct CountingDispatcher {
    submits: AtomicU64,
}

#[async_trait]
impl WorkflowDispatcher for CountingDispatcher {
    async fn submit(&self, item: &NewsItem) -> DispatchOutcome {
        self.submits.fetch_add(1, Ordering::SeqCst);
        DispatchOutcome::Started {
            workflow_id: item.workflow_id(),
        }
    }

    async fn describe(&self, _workflow_id: &str) -> news_feeder::Result<String> {
        Ok("running".into())
    }

    async fn cancel(&self, _workflow_id: &str) -> news_feeder::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

fn pipeline_config() -> FeederConfig {
    let toml = format!(
        r#"
[service]
name = "pipeline-test"
shutdown_timeout_seconds = 5

[[sources]]
type = "webhook"
name = "push"
url = "https://example.com"
update_mechanism = "event_driven"
event_config = {{ webhook_port = {WEBHOOK_PORT} }}
"#
    );
    FeederConfig::from_toml_str(&toml).unwrap()
}

fn service_only_config() -> FeederConfig {
    FeederConfig {
        service: ServiceConfig {
            shutdown_timeout_seconds: 5,
            ..ServiceConfig::default()
        },
        ..FeederConfig::default()
    }
}

async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..50 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn webhook_to_dispatch_with_dedup() {
    let dispatcher = Arc::new(CountingDispatcher {
        submits: AtomicU64::new(0),
    });
    let detector = Arc::new(DuplicateDetector::in_memory(Duration::from_secs(3600)));
    let orchestrator = Orchestrator::new(pipeline_config(), detector, dispatcher.clone());

    orchestrator.initialize().await.unwrap();
    assert_eq!(orchestrator.source_count().await, 1);
    orchestrator.start().await;

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{WEBHOOK_PORT}/webhook");
    // published_at is explicit: the fingerprint covers the date, and a
    // date-less payload would fall back to ingestion time and never collide
    let story = serde_json::json!({
        "title": "Major outage resolved",
        "link": "https://example.com/outage",
        "published_at": "2026-08-25T09:30:00Z",
    });
    let other = serde_json::json!({
        "title": "Unrelated story",
        "link": "https://example.com/other",
        "published_at": "2026-08-25T09:30:00Z",
    });

    // same story twice plus one distinct
    for payload in [&story, &story, &other] {
        let resp = client.post(&url).json(payload).send().await.unwrap();
        assert_eq!(resp.status(), 202);
    }

    wait_for(|| dispatcher.submits.load(Ordering::SeqCst) == 2).await;

    let status = orchestrator.get_status().await;
    assert_eq!(status.items_seen, 3);
    assert_eq!(status.duplicates_dropped, 1);
    assert_eq!(status.dispatched, 2);
    assert_eq!(status.sources.len(), 1);
    assert!(status.sources[0].healthy);

    orchestrator.stop().await;
    // listener is down after stop
    assert!(client.post(&url).json(&story).send().await.is_err());
    assert!(!orchestrator.is_accepting());
}

struct SlowDispatcher {
    submits: AtomicU64,
    delay: Duration,
}

#[async_trait]
impl WorkflowDispatcher for SlowDispatcher {
    async fn submit(&self, item: &NewsItem) -> DispatchOutcome {
        tokio::time::sleep(self.delay).await;
        self.submits.fetch_add(1, Ordering::SeqCst);
        DispatchOutcome::Started {
            workflow_id: item.workflow_id(),
        }
    }

    async fn describe(&self, _workflow_id: &str) -> news_feeder::Result<String> {
        Ok("running".into())
    }

    async fn cancel(&self, _workflow_id: &str) -> news_feeder::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_waits_for_in_flight_dispatches() {
    let dispatcher = Arc::new(SlowDispatcher {
        submits: AtomicU64::new(0),
        delay: Duration::from_millis(300),
    });
    let detector = Arc::new(DuplicateDetector::in_memory(Duration::from_secs(3600)));
    let orchestrator = Orchestrator::new(service_only_config(), detector, dispatcher.clone());
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await;

    for i in 0..3 {
        let item = NewsItem::builder(
            "In flight",
            format!("https://example.com/{i}"),
            "test",
            "rss",
        )
        .build()
        .unwrap();
        orchestrator.on_news_item(item);
    }

    // stop drains the in-flight tasks within the grace window
    orchestrator.stop().await;
    assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 3);

    // nothing is accepted once stopped
    let late = NewsItem::builder("Late", "https://example.com/late", "test", "rss")
        .build()
        .unwrap();
    orchestrator.on_news_item(late);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_fingerprint_dispatches_once() {
    let dispatcher = Arc::new(CountingDispatcher {
        submits: AtomicU64::new(0),
    });
    let detector = Arc::new(DuplicateDetector::in_memory(Duration::from_secs(3600)));
    let orchestrator = Orchestrator::new(service_only_config(), detector, dispatcher.clone());
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await;

    let item = NewsItem::builder(
        "Same story",
        "https://example.com/same",
        "test",
        "rss",
    )
    .build()
    .unwrap();
    for _ in 0..100 {
        orchestrator.on_news_item(item.clone());
    }
    orchestrator.stop().await;

    assert_eq!(dispatcher.submits.load(Ordering::SeqCst), 1);
    let status = orchestrator.get_status().await;
    assert_eq!(status.items_seen, 100);
    assert_eq!(status.duplicates_dropped, 99);
}
