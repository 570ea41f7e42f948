// src/sources/webhook.rs
//
// Push ingestion over HTTP. Each webhook source binds its own listener
// port; inbound JSON is buffered and converted by the drain loop. stop()
// shuts the listener down before the drain loop so nothing is accepted
// after teardown begins.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EventConfig, SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::news_item::NewsItem;
use crate::sources::events::{EventBuffer, EventDriver, EventHandler};
use crate::sources::{event_healthy, ItemSink, NewsSource, SourceCore, SourceState, SourceStatus};

struct WebhookHandler {
    source_name: String,
}

impl EventHandler for WebhookHandler {
    fn convert(&self, payload: Value) -> Result<NewsItem> {
        let field = |key: &str| payload.get(key).and_then(Value::as_str);
        let title = field("title")
            .ok_or_else(|| FeederError::Validation("webhook payload missing 'title'".into()))?;
        let link = field("link")
            .or_else(|| field("url"))
            .ok_or_else(|| FeederError::Validation("webhook payload missing 'link'".into()))?;

        let mut builder = NewsItem::builder(title, link, &self.source_name, "webhook");
        if let Some(description) = field("description") {
            builder = builder.description(description.to_string());
        }
        if let Some(content) = field("content") {
            builder = builder.full_content(content.to_string());
        }
        if let Some(author) = field("author") {
            builder = builder.author(author.to_string());
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

#[derive(Clone)]
struct ListenerState {
    core: Arc<SourceCore>,
    buffer: Arc<EventBuffer>,
    auth_token: Option<String>,
}

async fn receive(
    State(state): State<ListenerState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> StatusCode {
    if let Some(expected) = &state.auth_token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            warn!(source = %state.core.name(), "webhook rejected: bad auth token");
            return StatusCode::UNAUTHORIZED;
        }
    }
    state.buffer.push(state.core.name(), payload).await;
    StatusCode::ACCEPTED
}

struct Runtime {
    listener_stop: watch::Sender<bool>,
    listener_handle: JoinHandle<()>,
    drain_stop: watch::Sender<bool>,
    drain_handle: JoinHandle<()>,
}

pub struct WebhookSource {
    core: Arc<SourceCore>,
    events: EventConfig,
    buffer: Arc<EventBuffer>,
    auth_token: Option<String>,
    runtime: Mutex<Option<Runtime>>,
}

impl WebhookSource {
    pub fn new(config: &SourceConfig, sink: ItemSink) -> Result<Self> {
        let events = config.events()?.clone();
        if events.webhook_port.is_none() {
            return Err(FeederError::ConfigMismatch(format!(
                "source '{}': webhook sources require event_config.webhook_port",
                config.name
            )));
        }
        let core = SourceCore::new(
            config.name.clone(),
            "webhook",
            config.update_mechanism,
            sink,
        );
        Ok(Self {
            buffer: Arc::new(EventBuffer::new(events.event_buffer_size)),
            auth_token: config.specific_str("auth_token").map(String::from),
            core,
            events,
            runtime: Mutex::new(None),
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&self.events.webhook_path, post(receive))
            .with_state(ListenerState {
                core: self.core.clone(),
                buffer: self.buffer.clone(),
                auth_token: self.auth_token.clone(),
            })
    }
}

#[async_trait]
impl NewsSource for WebhookSource {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn source_type(&self) -> &'static str {
        "webhook"
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

        let port = self.events.webhook_port.unwrap_or_default();
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| FeederError::Backend(format!("binding webhook port {port}: {e}")))?;

        let (listener_stop, mut listener_stop_rx) = watch::channel(false);
        let router = self.router();
        let name = self.core.name().to_string();
        let listener_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = listener_stop_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(source = %name, error = %e, "webhook listener exited with error");
            }
        });

        let (drain_stop, drain_stop_rx) = watch::channel(false);
        let drain_handle = EventDriver::spawn(
            self.core.clone(),
            self.events.clone(),
            self.buffer.clone(),
            Arc::new(WebhookHandler {
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
        info!(
            source = %self.core.name(),
            port,
            path = %self.events.webhook_path,
            "webhook source listening"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            info!(source = %self.core.name(), "already stopped, stop ignored");
            return Ok(());
        };
        self.core.set_state(SourceState::Stopping);
        // listener first: no new events once teardown has begun
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

    #[test]
    fn converts_payload_with_url_alias() {
        let handler = WebhookHandler {
            source_name: "push".into(),
        };
        let item = handler
            .convert(json!({
                "title": "Breaking",
                "url": "https://example.com/breaking",
                "content": "Full text",
            }))
            .unwrap();
        assert_eq!(item.link, "https://example.com/breaking");
        assert_eq!(item.full_content.as_deref(), Some("Full text"));
        assert_eq!(item.source_type, "webhook");
    }

    #[test]
    fn rejects_payload_without_title() {
        let handler = WebhookHandler {
            source_name: "push".into(),
        };
        let err = handler
            .convert(json!({ "url": "https://example.com/x" }))
            .unwrap_err();
        assert!(matches!(err, FeederError::Validation(_)));
    }
}
