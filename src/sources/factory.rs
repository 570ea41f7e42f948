// src/sources/factory.rs
//
// Construction-time validation lives here: unknown types and mechanism
// mismatches fail before anything is started.

use std::sync::Arc;

use crate::config::{SourceConfig, UpdateMechanism};
use crate::error::{FeederError, Result};
use crate::sources::chat::ChatEventSource;
use crate::sources::http_poll::GenericHttpSource;
use crate::sources::rss::RssSource;
use crate::sources::webhook::WebhookSource;
use crate::sources::websocket::WebSocketSource;
use crate::sources::{ItemSink, NewsSource};

/// Mechanisms each built-in source type supports.
const SUPPORTED: &[(&str, &[UpdateMechanism])] = &[
    // Hybrid rss runs its polling half; push updates arrive through a
    // separate webhook/websocket source feeding the same sink.
    ("rss", &[UpdateMechanism::Polling, UpdateMechanism::Hybrid]),
    ("http", &[UpdateMechanism::Polling]),
    ("webhook", &[UpdateMechanism::EventDriven]),
    ("websocket", &[UpdateMechanism::EventDriven]),
    ("chat_event", &[UpdateMechanism::EventDriven]),
];

#[derive(Default)]
pub struct SourceFactory;

impl SourceFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn registered_types(&self) -> Vec<String> {
        SUPPORTED.iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn is_type_registered(&self, source_type: &str) -> bool {
        SUPPORTED.iter().any(|(name, _)| *name == source_type)
    }

    /// Builds a source from its config. Does not start it.
    pub fn create(
        &self,
        config: &SourceConfig,
        sink: ItemSink,
    ) -> Result<Arc<dyn NewsSource>> {
        let Some((_, mechanisms)) = SUPPORTED
            .iter()
            .find(|(name, _)| *name == config.source_type)
        else {
            return Err(FeederError::UnknownSourceType {
                requested: config.source_type.clone(),
                available: self.registered_types(),
            });
        };

        if !mechanisms.contains(&config.update_mechanism) {
            return Err(FeederError::ConfigMismatch(format!(
                "source '{}': type '{}' does not support mechanism '{}'",
                config.name,
                config.source_type,
                config.update_mechanism.as_str()
            )));
        }

        let source: Arc<dyn NewsSource> = match config.source_type.as_str() {
            "rss" => Arc::new(RssSource::new(config, sink)?),
            "http" => Arc::new(GenericHttpSource::new(config, sink)?),
            "webhook" => Arc::new(WebhookSource::new(config, sink)?),
            "websocket" => Arc::new(WebSocketSource::new(config, sink)?),
            "chat_event" => Arc::new(ChatEventSource::new(config, sink)?),
            other => {
                return Err(FeederError::UnknownSourceType {
                    requested: other.to_string(),
                    available: self.registered_types(),
                })
            }
        };
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeederConfig;

    fn sink() -> ItemSink {
        Arc::new(|_| {})
    }

    fn config_with(source_toml: &str) -> SourceConfig {
        let config = FeederConfig::from_toml_str(source_toml).unwrap();
        config.sources[0].clone()
    }

    fn create_err(config: &SourceConfig) -> FeederError {
        match SourceFactory::new().create(config, sink()) {
            Ok(_) => panic!("expected construction to fail"),
            Err(e) => e,
        }
    }

    #[test]
    fn creates_rss_source() {
        let config = config_with(
            r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "polling"
"#,
        );
        let source = SourceFactory::new().create(&config, sink()).unwrap();
        assert_eq!(source.name(), "wire");
        assert_eq!(source.source_type(), "rss");
    }

    #[test]
    fn hybrid_rss_is_accepted() {
        let config = config_with(
            r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "hybrid"
"#,
        );
        let source = SourceFactory::new().create(&config, sink()).unwrap();
        assert_eq!(source.mechanism(), UpdateMechanism::Hybrid);
    }

    #[test]
    fn unknown_type_lists_available() {
        let mut config = config_with(
            r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "polling"
"#,
        );
        config.source_type = "carrier_pigeon".into();
        let err = create_err(&config);
        match err {
            FeederError::UnknownSourceType { requested, available } => {
                assert_eq!(requested, "carrier_pigeon");
                assert!(available.contains(&"rss".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mechanism_mismatch_is_rejected() {
        let mut config = config_with(
            r#"
[[sources]]
type = "rss"
name = "wire"
url = "https://example.com/rss"
update_mechanism = "polling"
"#,
        );
        config.update_mechanism = UpdateMechanism::EventDriven;
        let err = create_err(&config);
        assert!(matches!(err, FeederError::ConfigMismatch(_)));
    }

    #[test]
    fn websocket_requires_ws_scheme() {
        let config = config_with(
            r#"
[[sources]]
type = "websocket"
name = "stream"
url = "https://example.com/feed"
update_mechanism = "event_driven"
"#,
        );
        let err = create_err(&config);
        assert!(matches!(err, FeederError::ConfigMismatch(_)));
    }

    #[test]
    fn chat_source_requires_api_token() {
        let config = config_with(
            r#"
[[sources]]
type = "chat_event"
name = "newsroom"
url = "https://api.telegram.org"
update_mechanism = "event_driven"
"#,
        );
        let err = create_err(&config);
        assert!(matches!(err, FeederError::ConfigMismatch(_)));
    }
}
