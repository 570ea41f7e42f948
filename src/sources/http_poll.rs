// src/sources/http_poll.rs
//
// Generic JSON-over-HTTP poller for APIs without a dedicated integration.
// The response is either a JSON array of entries or an object holding one
// under a configurable key. Field names are remappable through
// specific_config so most list-style endpoints work without code.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{PollingConfig, SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;
use crate::sources::polling::{FetchItems, PollingDriver};
use crate::sources::{polling_healthy, ItemSink, NewsSource, SourceCore, SourceState, SourceStatus};

#[derive(Clone)]
struct FieldMap {
    items_key: String,
    title: String,
    link: String,
    description: String,
    published_at: String,
    author: String,
}

impl FieldMap {
    fn from_config(config: &SourceConfig) -> Self {
        let pick = |key: &str, fallback: &str| {
            config
                .specific_str(key)
                .unwrap_or(fallback)
                .to_string()
        };
        Self {
            items_key: pick("items_key", "items"),
            title: pick("title_field", "title"),
            link: pick("link_field", "link"),
            description: pick("description_field", "description"),
            published_at: pick("published_field", "published_at"),
            author: pick("author_field", "author"),
        }
    }
}

/// Maps one JSON entry to a NewsItem using the configured field names.
fn entry_to_item(
    entry: &Value,
    fields: &FieldMap,
    source_name: &str,
) -> Result<NewsItem> {
    let str_field = |key: &str| entry.get(key).and_then(Value::as_str);

    let title = str_field(&fields.title)
        .ok_or_else(|| FeederError::Validation(format!("entry missing '{}'", fields.title)))?;
    let link = str_field(&fields.link)
        .ok_or_else(|| FeederError::Validation(format!("entry missing '{}'", fields.link)))?;

    let mut builder = NewsItem::builder(title, link, source_name, "http");
    if let Some(description) = str_field(&fields.description) {
        builder = builder.description(description.to_string());
    }
    if let Some(author) = str_field(&fields.author) {
        builder = builder.author(author.to_string());
    }
    if let Some(date) = str_field(&fields.published_at)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
    {
        builder = builder.publication_date(date.into());
    }
    if let Some(map) = entry.as_object() {
        builder = builder.raw_payload(map.clone());
    }
    builder.build()
}

struct HttpFetcher {
    url: String,
    client: reqwest::Client,
    fields: FieldMap,
    source_name: String,
    auth_token: Option<String>,
}

impl HttpFetcher {
    fn entries<'a>(&self, body: &'a Value) -> Result<&'a [Value]> {
        match body {
            Value::Array(entries) => Ok(entries),
            Value::Object(map) => map
                .get(&self.fields.items_key)
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    FeederError::Fetch(format!(
                        "response object has no '{}' array",
                        self.fields.items_key
                    ))
                }),
            _ => Err(FeederError::Fetch("response is neither array nor object".into())),
        }
    }
}

#[async_trait]
impl FetchItems for HttpFetcher {
    async fn fetch(&self) -> Result<Vec<NewsItem>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let body: Value = request
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FeederError::Fetch(format!("http status: {e}")))?
            .json()
            .await?;

        let entries = self.entries(&body)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry_to_item(entry, &self.fields, &self.source_name) {
                Ok(item) => out.push(item),
                Err(e) => {
                    warn!(source = %self.source_name, error = %e, "skipping malformed entry");
                }
            }
        }
        Ok(out)
    }
}

pub struct GenericHttpSource {
    core: Arc<SourceCore>,
    polling: PollingConfig,
    fetcher: Arc<HttpFetcher>,
    runtime: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl GenericHttpSource {
    pub fn new(config: &SourceConfig, sink: ItemSink) -> Result<Self> {
        let polling = config.polling()?.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(polling.timeout_seconds))
            .build()?;
        let core = SourceCore::new(config.name.clone(), "http", config.update_mechanism, sink);
        Ok(Self {
            core,
            polling,
            fetcher: Arc::new(HttpFetcher {
                url: config.url.clone(),
                client,
                fields: FieldMap::from_config(config),
                source_name: config.name.clone(),
                auth_token: config.specific_str("auth_token").map(String::from),
            }),
            runtime: Mutex::new(None),
        })
    }
}

#[async_trait]
impl NewsSource for GenericHttpSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn source_type(&self) -> &'static str {
        "http"
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
        let handle = PollingDriver::spawn(
            self.core.clone(),
            self.polling.clone(),
            self.fetcher.clone(),
            stop_rx,
        );
        self.core.set_state(SourceState::Running);
        *runtime = Some((stop_tx, handle));
        info!(source = %self.core.name(), url = %self.fetcher.url, "http source started");
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
