// src/dedup.rs
//
// Content-fingerprint deduplication backed by Redis, with an in-memory
// fallback so ingestion keeps flowing when Redis is down. Dedup checks
// never fail the pipeline: on backend errors the answer is "not a
// duplicate" and the error is absorbed into stats.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::error::{FeederError, Result};

const KEY_PREFIX: &str = "news:hash:";
const MEMORY_CAP: usize = 10_000;
const MEMORY_KEEP: usize = 5_000;

/// Storage backend for seen-fingerprint marks.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Marks a key, returning `true` if this call was the first to set it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| FeederError::Backend(format!("redis client: {e}")))?;
        let conn = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_seconds),
            redis::aio::ConnectionManager::new(client),
        )
        .await
        .map_err(|_| FeederError::Backend("redis connect timed out".into()))?
        .map_err(|e| FeederError::Backend(format!("redis connect: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DedupStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key)
            .await
            .map_err(|e| FeederError::Backend(format!("redis EXISTS: {e}")))
    }

    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX EX is the atomic first-marker gate: exactly one caller
        // per fingerprint gets `true` back.
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| FeederError::Backend(format!("redis SET NX: {e}")))?;
        Ok(outcome.is_some())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| FeederError::Backend(format!("redis PING: {e}")))
    }
}

/// Bounded in-memory fingerprint set used when Redis is unreachable.
/// TTLs are not tracked here; the cap keeps it from growing without bound.
#[derive(Default)]
struct MemoryFallbackInner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

#[derive(Default)]
pub struct MemoryFallback {
    inner: Mutex<MemoryFallbackInner>,
}

impl MemoryFallback {
    pub fn new() -> Self {
        Self::default()
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.seen.len()
    }
}

#[async_trait]
impl DedupStore for MemoryFallback {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().await.seen.contains(key))
    }

    async fn set_if_absent(&self, key: &str, _ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.seen.contains(key) {
            return Ok(false);
        }
        inner.seen.insert(key.to_string());
        inner.order.push_back(key.to_string());
        if inner.seen.len() > MEMORY_CAP {
            // Drop the oldest entries down to the keep level.
            while inner.seen.len() > MEMORY_KEEP {
                if let Some(old) = inner.order.pop_front() {
                    inner.seen.remove(&old);
                } else {
                    break;
                }
            }
            warn!(kept = MEMORY_KEEP, "in-memory dedup set trimmed");
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DedupStats {
    pub checks: u64,
    pub duplicates: u64,
    pub backend_errors: u64,
    pub degraded: bool,
    pub memory_entries: usize,
}

/// Fingerprint gatekeeper in front of workflow dispatch.
pub struct DuplicateDetector {
    redis: Option<RedisStore>,
    fallback: MemoryFallback,
    ttl: Duration,
    checks: AtomicU64,
    duplicates: AtomicU64,
    backend_errors: AtomicU64,
}

impl DuplicateDetector {
    /// Connects to Redis; on failure starts degraded with the in-memory
    /// store only. Never refuses to construct.
    pub async fn connect(config: &RedisConfig) -> Self {
        let redis = match RedisStore::connect(config).await {
            Ok(store) => {
                info!(host = %config.host, port = config.port, "dedup connected to redis");
                Some(store)
            }
            Err(e) => {
                warn!(error = %e, "redis unavailable, dedup degraded to in-memory");
                None
            }
        };
        Self::with_store(redis, Duration::from_secs(config.dedup_ttl_hours * 3600))
    }

    fn with_store(redis: Option<RedisStore>, ttl: Duration) -> Self {
        Self {
            redis,
            fallback: MemoryFallback::new(),
            ttl,
            checks: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Detector with no Redis backend at all. Used in tests and when the
    /// service is deliberately run without Redis.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::with_store(None, ttl)
    }

    fn key(fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }

    /// Read-only duplicate check. Backend errors report "not a duplicate"
    /// so a flaky Redis can only cause re-processing, never data loss.
    pub async fn is_duplicate(&self, fingerprint: &str) -> bool {
        self.checks.fetch_add(1, Ordering::Relaxed);
        let key = Self::key(fingerprint);

        if let Some(redis) = &self.redis {
            match redis.exists(&key).await {
                Ok(found) => {
                    if found {
                        self.duplicates.fetch_add(1, Ordering::Relaxed);
                    }
                    return found;
                }
                Err(e) => {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "dedup check fell back to memory");
                }
            }
        }

        match self.fallback.exists(&key).await {
            Ok(found) => {
                if found {
                    self.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                found
            }
            Err(_) => false,
        }
    }

    /// Atomically marks a fingerprint as processed. Returns `true` only for
    /// the first caller; concurrent callers for the same fingerprint all
    /// but one see `false`.
    pub async fn mark_processed(&self, fingerprint: &str) -> bool {
        let key = Self::key(fingerprint);

        if let Some(redis) = &self.redis {
            match redis.set_if_absent(&key, self.ttl).await {
                Ok(first) => {
                    debug!(fingerprint, first, "fingerprint marked in redis");
                    return first;
                }
                Err(e) => {
                    self.backend_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "dedup mark fell back to memory");
                }
            }
        }

        self.fallback
            .set_if_absent(&key, self.ttl)
            .await
            .unwrap_or(true)
    }

    pub async fn is_healthy(&self) -> bool {
        match &self.redis {
            Some(redis) => redis.ping().await.is_ok(),
            // Memory-only mode is degraded but operational.
            None => true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.redis.is_none()
    }

    pub async fn stats(&self) -> DedupStats {
        DedupStats {
            checks: self.checks.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            degraded: self.redis.is_none(),
            memory_entries: self.fallback.len().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> DuplicateDetector {
        DuplicateDetector::in_memory(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn first_mark_wins_subsequent_marks_lose() {
        let d = detector();
        assert!(d.mark_processed("abc123").await);
        assert!(!d.mark_processed("abc123").await);
        assert!(d.mark_processed("def456").await);
    }

    #[tokio::test]
    async fn marked_fingerprint_reads_as_duplicate() {
        let d = detector();
        assert!(!d.is_duplicate("abc123").await);
        d.mark_processed("abc123").await;
        assert!(d.is_duplicate("abc123").await);
    }

    #[tokio::test]
    async fn stats_count_checks_and_duplicates() {
        let d = detector();
        d.mark_processed("x").await;
        d.is_duplicate("x").await;
        d.is_duplicate("y").await;
        let stats = d.stats().await;
        assert_eq!(stats.checks, 2);
        assert_eq!(stats.duplicates, 1);
        assert!(stats.degraded);
    }

    #[tokio::test]
    async fn memory_store_trims_when_over_cap() {
        let store = MemoryFallback::new();
        for i in 0..(MEMORY_CAP + 1) {
            store
                .set_if_absent(&format!("k{i}"), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let len = store.len().await;
        assert!(len <= MEMORY_KEEP + 1, "expected trim, got {len} entries");
        // the newest entry survives the trim
        assert!(store.exists(&format!("k{MEMORY_CAP}")).await.unwrap());
        // the oldest entries were evicted
        assert!(!store.exists("k0").await.unwrap());
    }

    #[tokio::test]
    async fn memory_only_detector_reports_healthy_but_degraded() {
        let d = detector();
        assert!(d.is_healthy().await);
        assert!(d.is_degraded());
    }
}
