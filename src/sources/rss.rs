// src/sources/rss.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{PollingConfig, SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;
use crate::sources::polling::{FetchItems, PollingDriver};
use crate::sources::{polling_healthy, ItemSink, NewsSource, SourceCore, SourceState, SourceStatus};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    author: Option<String>,
    #[serde(rename = "category", default)]
    category: Vec<String>,
    enclosure: Option<Enclosure>,
}
#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

static TAG_RE: once_cell::sync::Lazy<regex::Regex> =
    once_cell::sync::Lazy::new(|| regex::Regex::new(r"<[^>]+>").unwrap());

// Descriptions often carry inline HTML; keep only the text.
fn strip_tags(s: &str) -> String {
    TAG_RE.replace_all(s, " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

// Feeds routinely embed HTML entities that are not valid XML entities.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

/// Parses an RSS 2.0 document into NewsItems. A malformed entry is skipped
/// with a warning; it never aborts the batch.
pub fn parse_feed(xml: &str, source_name: &str) -> Result<Vec<NewsItem>> {
    let xml_clean = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&xml_clean)
        .map_err(|e| FeederError::Fetch(format!("parsing rss xml: {e}")))?;

    let mut out = Vec::with_capacity(rss.channel.item.len());
    for entry in rss.channel.item {
        let title = entry.title.as_deref().unwrap_or_default();
        let title = html_escape::decode_html_entities(title).into_owned();
        let link = entry.link.as_deref().unwrap_or_default();

        let mut builder = NewsItem::builder(title, link, source_name, "rss")
            .categories(entry.category.clone());
        if let Some(description) = &entry.description {
            let text = strip_tags(&html_escape::decode_html_entities(description));
            builder = builder.description(text);
        }
        if let Some(author) = &entry.author {
            builder = builder.author(author.clone());
        }
        if let Some(date) = entry.pub_date.as_deref().and_then(parse_rfc2822) {
            builder = builder.publication_date(date);
        }
        if let Some(url) = entry.enclosure.and_then(|e| e.url) {
            builder = builder.media_urls(vec![url]);
        }

        match builder.build() {
            Ok(item) => out.push(item),
            Err(e) => {
                warn!(source = source_name, error = %e, "skipping malformed rss entry");
            }
        }
    }
    Ok(out)
}

struct RssFetcher {
    url: String,
    client: reqwest::Client,
    source_name: String,
}

#[async_trait]
impl FetchItems for RssFetcher {
    async fn fetch(&self) -> Result<Vec<NewsItem>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FeederError::Fetch(format!("rss http status: {e}")))?
            .text()
            .await?;
        parse_feed(&body, &self.source_name)
    }
}

pub struct RssSource {
    core: Arc<SourceCore>,
    polling: PollingConfig,
    fetcher: Arc<RssFetcher>,
    runtime: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RssSource {
    pub fn new(config: &SourceConfig, sink: ItemSink) -> Result<Self> {
        let polling = config.polling()?.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(polling.timeout_seconds))
            .build()?;
        let core = SourceCore::new(config.name.clone(), "rss", config.update_mechanism, sink);
        Ok(Self {
            core,
            polling,
            fetcher: Arc::new(RssFetcher {
                url: config.url.clone(),
                client,
                source_name: config.name.clone(),
            }),
            runtime: Mutex::new(None),
        })
    }
}

#[async_trait]
impl NewsSource for RssSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn source_type(&self) -> &'static str {
        "rss"
    }

    fn mechanism(&self) -> UpdateMechanism {
        self.core.mechanism()
    }

    async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            info!(source = %self.core.name(), "already running, start ignored");
            return Ok(());
        }
        self.core.set_state(SourceState::Starting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle =
            PollingDriver::spawn(self.core.clone(), self.polling.clone(), self.fetcher.clone(), stop_rx);
        self.core.set_state(SourceState::Running);
        *runtime = Some((stop_tx, handle));
        info!(source = %self.core.name(), url = %self.fetcher.url, "rss source started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some((stop_tx, handle)) = runtime.take() else {
            info!(source = %self.core.name(), "already stopped, stop ignored");
            return Ok(());
        };
        self.core.set_state(SourceState::Stopping);
        let _ = stop_tx.send(true);
        let _ = handle.await;
        self.core.set_state(SourceState::Stopped);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        polling_healthy(&self.core, self.polling.interval_seconds)
    }

    async fn status(&self) -> SourceStatus {
        SourceStatus::of(&self.core, self.is_healthy().await, None)
    }
}
