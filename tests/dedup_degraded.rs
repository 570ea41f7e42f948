// tests/dedup_degraded.rs
//
// Degraded-mode dedup semantics: with no reachable backend the detector
// answers from its in-memory set and never raises into the pipeline.

use std::time::Duration;

use news_feeder::config::RedisConfig;
use news_feeder::dedup::DuplicateDetector;

fn unreachable_redis() -> RedisConfig {
    RedisConfig {
        host: "127.0.0.1".into(),
        // nothing listens here
        port: 1,
        connect_timeout_seconds: 1,
        ..RedisConfig::default()
    }
}

#[tokio::test]
async fn unreachable_backend_degrades_instead_of_failing() {
    let detector = DuplicateDetector::connect(&unreachable_redis()).await;
    assert!(detector.is_degraded());

    // unknown fingerprint answers false, not an error
    assert!(!detector.is_duplicate("abc").await);

    // the in-memory fallback still provides the at-most-once gate
    assert!(detector.mark_processed("abc").await);
    assert!(!detector.mark_processed("abc").await);
    assert!(detector.is_duplicate("abc").await);
}

#[tokio::test]
async fn marking_is_idempotent() {
    let detector = DuplicateDetector::in_memory(Duration::from_secs(3600));
    detector.mark_processed("fp-1").await;
    detector.mark_processed("fp-1").await;
    assert!(detector.is_duplicate("fp-1").await);

    let stats = detector.stats().await;
    assert_eq!(stats.memory_entries, 1);
}
