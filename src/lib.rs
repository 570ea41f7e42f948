// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod news_item;
pub mod orchestrator;
pub mod sources;

// ---- Re-exports for stable public API ----
pub use crate::config::{FeederConfig, SourceConfig, UpdateMechanism};
pub use crate::dedup::DuplicateDetector;
pub use crate::dispatch::{DispatchOutcome, HttpDispatcher, WorkflowDispatcher};
pub use crate::error::{FeederError, Result};
pub use crate::news_item::NewsItem;
pub use crate::orchestrator::{Orchestrator, StatusSnapshot};
pub use crate::sources::{NewsSource, SourceFactory};
