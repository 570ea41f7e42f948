// src/sources/chat.rs
//
// Chat-platform ingestion via the Telegram-style bot API: a long-poll
// listener walks getUpdates with an advancing offset and buffers channel
// posts; the drain loop turns them into NewsItems. Posts from channels
// outside the configured allow-list are ignored at the listener.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EventConfig, SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;
use crate::sources::events::{EventBuffer, EventDriver, EventHandler};
use crate::sources::{event_healthy, ItemSink, NewsSource, SourceCore, SourceState, SourceStatus};

const LONG_POLL_SECONDS: u64 = 25;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const TITLE_MAX_CHARS: usize = 200;

struct ChatHandler {
    source_name: String,
}

impl ChatHandler {
    fn title_from_text(text: &str) -> String {
        let first_line = text.lines().next().unwrap_or_default().trim();
        first_line.chars().take(TITLE_MAX_CHARS).collect()
    }

    fn post_link(post: &Value) -> Option<String> {
        let username = post
            .pointer("/chat/username")
            .and_then(Value::as_str)?;
        let message_id = post.get("message_id").and_then(Value::as_u64)?;
        Some(format!("https://t.me/{username}/{message_id}"))
    }
}

impl EventHandler for ChatHandler {
    fn convert(&self, payload: Value) -> Result<NewsItem> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| FeederError::Validation("chat post has no text".into()))?;
        let link = Self::post_link(&payload)
            .ok_or_else(|| FeederError::Validation("chat post has no addressable link".into()))?;

        let mut builder = NewsItem::builder(
            Self::title_from_text(text),
            link,
            &self.source_name,
            "chat_event",
        )
        .full_content(text.to_string());
        if let Some(channel) = payload.pointer("/chat/title").and_then(Value::as_str) {
            builder = builder.author(channel.to_string());
        }
        if let Some(date) = payload
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        {
            builder = builder.publication_date(date);
        }
        if let Some(map) = payload.as_object() {
            builder = builder.raw_payload(map.clone());
        }
        builder.build()
    }
}

struct Listener {
    core: Arc<SourceCore>,
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    channels: Vec<String>,
    buffer: Arc<EventBuffer>,
}

impl Listener {
    fn updates_url(&self, offset: u64) -> String {
        format!(
            "{}/bot{}/getUpdates?offset={offset}&timeout={LONG_POLL_SECONDS}",
            self.base_url.trim_end_matches('/'),
            self.api_token
        )
    }

    fn channel_allowed(&self, post: &Value) -> bool {
        if self.channels.is_empty() {
            return true;
        }
        post.pointer("/chat/username")
            .and_then(Value::as_str)
            .map(|name| self.channels.iter().any(|c| c == name))
            .unwrap_or(false)
    }

    async fn poll_once(&self, offset: u64) -> Result<u64> {
        let body: Value = self
            .client
            .get(self.updates_url(offset))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| FeederError::Fetch(format!("chat api status: {e}")))?
            .json()
            .await?;

        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(FeederError::Fetch(format!(
                "chat api rejected request: {body}"
            )));
        }

        let mut next_offset = offset;
        let updates = body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for update in updates {
            if let Some(id) = update.get("update_id").and_then(Value::as_u64) {
                next_offset = next_offset.max(id + 1);
            }
            let post = update
                .get("channel_post")
                .or_else(|| update.get("message"));
            let Some(post) = post else { continue };
            if !self.channel_allowed(post) {
                debug!(source = %self.core.name(), "ignoring post from unlisted channel");
                continue;
            }
            self.buffer.push(self.core.name(), post.clone()).await;
        }
        Ok(next_offset)
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut offset = 0u64;
        loop {
            if *stop.borrow() {
                break;
            }
            let poll = self.poll_once(offset);
            tokio::select! {
                outcome = poll => match outcome {
                    Ok(next) => offset = next,
                    Err(e) => {
                        self.core.record_fetch_failure(&e.to_string());
                        warn!(source = %self.core.name(), error = %e, "chat long-poll failed");
                        let delay = tokio::time::sleep(ERROR_BACKOFF);
                        tokio::select! {
                            _ = delay => {}
                            _ = stop.changed() => break,
                        }
                    }
                },
                _ = stop.changed() => break,
            }
        }
        info!(source = %self.core.name(), "chat listener stopped");
    }
}

struct Runtime {
    listener_stop: watch::Sender<bool>,
    listener_handle: JoinHandle<()>,
    drain_stop: watch::Sender<bool>,
    drain_handle: JoinHandle<()>,
}

pub struct ChatEventSource {
    core: Arc<SourceCore>,
    events: EventConfig,
    base_url: String,
    api_token: String,
    channels: Vec<String>,
    buffer: Arc<EventBuffer>,
    runtime: Mutex<Option<Runtime>>,
}

impl ChatEventSource {
    pub fn new(config: &SourceConfig, sink: ItemSink) -> Result<Self> {
        let events = config.events()?.clone();
        let api_token = config
            .specific_str("api_token")
            .ok_or_else(|| {
                FeederError::ConfigMismatch(format!(
                    "source '{}': chat sources require specific_config.api_token",
                    config.name
                ))
            })?
            .to_string();
        let channels = config
            .specific_config
            .get("channels")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let core = SourceCore::new(
            config.name.clone(),
            "chat_event",
            config.update_mechanism,
            sink,
        );
        Ok(Self {
            buffer: Arc::new(EventBuffer::new(events.event_buffer_size)),
            core,
            events,
            base_url: config.url.clone(),
            api_token,
            channels,
            runtime: Mutex::new(None),
        })
    }
}

#[async_trait]
impl NewsSource for ChatEventSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn source_type(&self) -> &'static str {
        "chat_event"
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

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECONDS + 10))
            .build()?;
        let listener = Listener {
            core: self.core.clone(),
            client,
            base_url: self.base_url.clone(),
            api_token: self.api_token.clone(),
            channels: self.channels.clone(),
            buffer: self.buffer.clone(),
        };
        let (listener_stop, listener_stop_rx) = watch::channel(false);
        let listener_handle = tokio::spawn(listener.run(listener_stop_rx));

        let (drain_stop, drain_stop_rx) = watch::channel(false);
        let drain_handle = EventDriver::spawn(
            self.core.clone(),
            self.events.clone(),
            self.buffer.clone(),
            Arc::new(ChatHandler {
                source_name: self.core.name().to_string(),
            }),
            drain_stop_rx,
        );

        self.core.set_state(SourceState::Running);
        *runtime = Some(Runtime {
            listener_stop,
            listener_handle,
            drain_stop,
            drain_handle,
        });
        info!(source = %self.core.name(), "chat source started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            info!(source = %self.core.name(), "already stopped, stop ignored");
            return Ok(());
        };
        self.core.set_state(SourceState::Stopping);
        let _ = rt.listener_stop.send(true);
        let _ = rt.listener_handle.await;
        let _ = rt.drain_stop.send(true);
        let _ = rt.drain_handle.await;
        self.core.set_state(SourceState::Stopped);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        event_healthy(&self.core, self.buffer.fill().await)
    }

    async fn status(&self) -> SourceStatus {
        SourceStatus::of(
            &self.core,
            self.is_healthy().await,
            Some(self.buffer.fill().await),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> ChatHandler {
        ChatHandler {
            source_name: "newsroom".into(),
        }
    }

    #[test]
    fn converts_channel_post() {
        let item = handler()
            .convert(json!({
                "message_id": 42,
                "date": 1_787_000_000,
                "chat": { "username": "breaking_wire", "title": "Breaking Wire" },
                "text": "Central bank cuts rates\nFull statement follows.",
            }))
            .unwrap();
        assert_eq!(item.title, "Central bank cuts rates");
        assert_eq!(item.link, "https://t.me/breaking_wire/42");
        assert_eq!(item.author.as_deref(), Some("Breaking Wire"));
        assert!(item.full_content.as_deref().unwrap().contains("statement"));
    }

    #[test]
    fn post_without_username_is_rejected() {
        let err = handler()
            .convert(json!({
                "message_id": 1,
                "chat": { "title": "Private" },
                "text": "hello",
            }))
            .unwrap_err();
        assert!(matches!(err, FeederError::Validation(_)));
    }

    #[test]
    fn long_titles_are_truncated() {
        let text = "x".repeat(500);
        let title = ChatHandler::title_from_text(&text);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
    }
}
