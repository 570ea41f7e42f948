// src/sources/websocket.rs
//
// Streaming ingestion over a websocket. The listener task owns the
// connection and reconnects with capped exponential backoff when the peer
// drops it; text frames are parsed as JSON and buffered for the drain loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{EventConfig, SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;
use crate::sources::events::{EventBuffer, EventDriver, EventHandler};
use crate::sources::{event_healthy, ItemSink, NewsSource, SourceCore, SourceState, SourceStatus};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

struct WebSocketHandler {
    source_name: String,
}

impl EventHandler for WebSocketHandler {
    fn convert(&self, payload: Value) -> Result<NewsItem> {
        let field = |key: &str| payload.get(key).and_then(Value::as_str);
        let title = field("title")
            .or_else(|| field("headline"))
            .ok_or_else(|| FeederError::Validation("ws frame missing 'title'".into()))?;
        let link = field("link")
            .or_else(|| field("url"))
            .ok_or_else(|| FeederError::Validation("ws frame missing 'link'".into()))?;

        let mut builder = NewsItem::builder(title, link, &self.source_name, "websocket");
        if let Some(description) = field("description") {
            builder = builder.description(description.to_string());
        }
        if let Some(date) = field("published_at")
            .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        {
            builder = builder.publication_date(date.into());
        }
        if let Some(map) = payload.as_object() {
            builder = builder.raw_payload(map.clone());
        }
        builder.build()
    }
}

async fn listen(
    core: Arc<SourceCore>,
    url: String,
    buffer: Arc<EventBuffer>,
    reconnect: bool,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_BASE;
    loop {
        if *stop.borrow() {
            break;
        }

        let mut ws = match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!(source = %core.name(), url = %url, "websocket connected");
                backoff = RECONNECT_BASE;
                stream
            }
            Err(e) => {
                core.record_fetch_failure(&format!("ws connect: {e}"));
                if !reconnect {
                    warn!(source = %core.name(), error = %e, "connect failed, reconnect disabled");
                    break;
                }
                warn!(source = %core.name(), error = %e, ?backoff, "connect failed, retrying");
                let delay = tokio::time::sleep(backoff);
                tokio::select! {
                    _ = delay => {}
                    _ = stop.changed() => break,
                }
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Value>(&text) {
                                Ok(payload) => buffer.push(core.name(), payload).await,
                                Err(e) => {
                                    core.record_item_failure();
                                    debug!(source = %core.name(), error = %e, "ignoring non-json frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(source = %core.name(), "websocket closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            core.record_fetch_failure(&format!("ws read: {e}"));
                            break;
                        }
                    }
                }
                _ = stop.changed() => return,
            }
        }

        if !reconnect {
            break;
        }
    }
}

struct Runtime {
    listener_stop: watch::Sender<bool>,
    listener_handle: JoinHandle<()>,
    drain_stop: watch::Sender<bool>,
    drain_handle: JoinHandle<()>,
}

pub struct WebSocketSource {
    core: Arc<SourceCore>,
    events: EventConfig,
    url: String,
    buffer: Arc<EventBuffer>,
    runtime: Mutex<Option<Runtime>>,
}

impl WebSocketSource {
    pub fn new(config: &SourceConfig, sink: ItemSink) -> Result<Self> {
        let events = config.events()?.clone();
        let url = url::Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(FeederError::ConfigMismatch(format!(
                "source '{}': websocket url must use ws:// or wss://",
                config.name
            )));
        }
        let core = SourceCore::new(
            config.name.clone(),
            "websocket",
            config.update_mechanism,
            sink,
        );
        Ok(Self {
            buffer: Arc::new(EventBuffer::new(events.event_buffer_size)),
            core,
            events,
            url: config.url.clone(),
            runtime: Mutex::new(None),
        })
    }
}

#[async_trait]
impl NewsSource for WebSocketSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn source_type(&self) -> &'static str {
        "websocket"
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

        let (listener_stop, listener_stop_rx) = watch::channel(false);
        let listener_handle = tokio::spawn(listen(
            self.core.clone(),
            self.url.clone(),
            self.buffer.clone(),
            self.events.websocket_reconnect,
            listener_stop_rx,
        ));

        let (drain_stop, drain_stop_rx) = watch::channel(false);
        let drain_handle = EventDriver::spawn(
            self.core.clone(),
            self.events.clone(),
            self.buffer.clone(),
            Arc::new(WebSocketHandler {
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
        info!(source = %self.core.name(), url = %self.url, "websocket source started");
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
