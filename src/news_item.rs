// src/news_item.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{FeederError, Result};

/// Unified news record emitted by every source variant.
///
/// Immutable after construction; the content fingerprint is computed once by
/// the builder and identifies "the same news" for the dedup gate. The
/// fingerprint deliberately covers only title + link + publication date, so
/// two items differing only in body or categories collapse to one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewsItem {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub full_content: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub source_name: String,
    pub source_type: String,
    pub publication_date: DateTime<Utc>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    pub extracted_at: DateTime<Utc>,
    pub content_fingerprint: String,
    #[serde(default)]
    pub raw_payload: serde_json::Map<String, serde_json::Value>,
}

impl NewsItem {
    pub fn builder(
        title: impl Into<String>,
        link: impl Into<String>,
        source_name: impl Into<String>,
        source_type: impl Into<String>,
    ) -> NewsItemBuilder {
        NewsItemBuilder {
            title: title.into(),
            link: link.into(),
            source_name: source_name.into(),
            source_type: source_type.into(),
            description: None,
            full_content: None,
            author: None,
            publication_date: None,
            categories: Vec::new(),
            media_urls: Vec::new(),
            raw_payload: serde_json::Map::new(),
        }
    }

    /// Defensive re-check at the orchestrator gate; builder-constructed items
    /// always pass, deserialized ones may not.
    pub fn is_valid(&self) -> bool {
        !self.title.is_empty()
            && !self.link.is_empty()
            && !self.source_name.is_empty()
            && !self.source_type.is_empty()
    }

    /// Deterministic workflow id for the dispatch layer. Resubmitting the
    /// same content maps to the same id, which keeps dispatch idempotent even
    /// if the dedup gate expires an entry.
    pub fn workflow_id(&self) -> String {
        format!("news-{}", self.content_fingerprint)
    }
}

#[derive(Debug)]
pub struct NewsItemBuilder {
    title: String,
    link: String,
    source_name: String,
    source_type: String,
    description: Option<String>,
    full_content: Option<String>,
    author: Option<String>,
    publication_date: Option<DateTime<Utc>>,
    categories: Vec<String>,
    media_urls: Vec<String>,
    raw_payload: serde_json::Map<String, serde_json::Value>,
}

impl NewsItemBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        let d = description.into();
        if !d.is_empty() {
            self.description = Some(d);
        }
        self
    }

    pub fn full_content(mut self, content: impl Into<String>) -> Self {
        self.full_content = Some(content.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        let a = author.into();
        if !a.is_empty() {
            self.author = Some(a);
        }
        self
    }

    pub fn publication_date(mut self, date: DateTime<Utc>) -> Self {
        self.publication_date = Some(date);
        self
    }

    pub fn categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn media_urls(mut self, urls: Vec<String>) -> Self {
        self.media_urls = urls;
        self
    }

    pub fn raw_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.raw_payload.insert(key.into(), value);
        self
    }

    pub fn raw_payload(mut self, payload: serde_json::Map<String, serde_json::Value>) -> Self {
        self.raw_payload = payload;
        self
    }

    /// Validates required fields and computes the content fingerprint.
    ///
    /// Publication date falls back to ingestion time when the source did not
    /// provide one.
    pub fn build(self) -> Result<NewsItem> {
        let title = self.title.trim().to_string();
        let link = self.link.trim().to_string();

        if title.is_empty() {
            return Err(FeederError::Validation("news item title is empty".into()));
        }
        if link.is_empty() {
            return Err(FeederError::Validation("news item link is empty".into()));
        }
        if self.source_name.is_empty() {
            return Err(FeederError::Validation("source_name is empty".into()));
        }
        if self.source_type.is_empty() {
            return Err(FeederError::Validation("source_type is empty".into()));
        }

        let parsed = Url::parse(&link)
            .map_err(|e| FeederError::Validation(format!("invalid link '{link}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(FeederError::Validation(format!(
                "link '{link}' must be an absolute http(s) URL"
            )));
        }

        let publication_date = self.publication_date.unwrap_or_else(Utc::now);
        let content_fingerprint = fingerprint(&title, &link, &publication_date);

        Ok(NewsItem {
            title,
            link,
            description: self.description,
            full_content: self.full_content,
            author: self.author,
            source_name: self.source_name,
            source_type: self.source_type,
            publication_date,
            categories: self.categories,
            media_urls: self.media_urls,
            extracted_at: Utc::now(),
            content_fingerprint,
            raw_payload: self.raw_payload,
        })
    }
}

/// SHA-256 over a canonical JSON object with sorted keys. Field insertion
/// order and locale never influence the digest.
fn fingerprint(title: &str, link: &str, publication_date: &DateTime<Utc>) -> String {
    let canonical = format!(
        "{{\"link\":{},\"publication_date\":{},\"title\":{}}}",
        serde_json::Value::String(link.trim().to_string()),
        serde_json::Value::String(publication_date.to_rfc3339()),
        serde_json::Value::String(title.trim().to_lowercase()),
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
