// src/sources/polling.rs
//
// Shared polling loop: tick, fetch with retries and a per-attempt timeout,
// emit, repeat. A failed cycle records metrics and waits for the next tick;
// it never terminates the loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::PollingConfig;
use crate::error::Result;
use crate::news_item::NewsItem;
use crate::sources::SourceCore;

/// One fetch cycle for a polling source. Implementations return the full
/// batch; per-entry parse failures are skipped inside, not surfaced here.
#[async_trait]
pub trait FetchItems: Send + Sync {
    async fn fetch(&self) -> Result<Vec<NewsItem>>;
}

pub struct PollingDriver;

impl PollingDriver {
    /// Spawns the polling loop. The first cycle runs immediately, then on
    /// every interval tick until the stop signal fires.
    pub fn spawn(
        core: Arc<SourceCore>,
        config: PollingConfig,
        fetcher: Arc<dyn FetchItems>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            core.loop_alive.store(true, Ordering::Relaxed);
            let mut ticker =
                tokio::time::interval(Duration::from_secs(config.interval_seconds));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::poll_once(&core, &config, fetcher.as_ref(), &mut stop).await;
                        if *stop.borrow() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }

            core.loop_alive.store(false, Ordering::Relaxed);
            info!(source = %core.name(), "polling loop stopped");
        })
    }

    async fn poll_once(
        core: &SourceCore,
        config: &PollingConfig,
        fetcher: &dyn FetchItems,
        stop: &mut watch::Receiver<bool>,
    ) {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let mut last_error = String::new();

        for attempt in 0..=config.retry_attempts {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, fetcher.fetch()).await;
            match outcome {
                Ok(Ok(items)) => {
                    core.record_fetch_success(started.elapsed().as_millis() as u64);
                    for item in items {
                        core.emit(item);
                    }
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("fetch timed out after {timeout:?}"),
            }

            if attempt < config.retry_attempts {
                warn!(
                    source = %core.name(),
                    attempt = attempt + 1,
                    error = %last_error,
                    "fetch failed, retrying"
                );
                let delay = tokio::time::sleep(Duration::from_secs(config.retry_delay_seconds));
                tokio::select! {
                    _ = delay => {}
                    _ = stop.changed() => return,
                }
            }
        }

        core.record_fetch_failure(&last_error);
        warn!(source = %core.name(), error = %last_error, "fetch cycle failed");
    }
}
