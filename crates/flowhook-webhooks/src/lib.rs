//! Webhook reliability pipeline for AI-agent workflow results.
//!
//! Receives signed result notifications from the agent platform and accepts
//! them exactly once. Calls to the Event Store and the platform run behind
//! circuit breakers; the last good result per key is kept in a fallback cache
//! and served, labelled degraded, while the primary path is down. Significant
//! events are classified into coalesced alerts, and a cached health snapshot
//! condenses counters, breakers and cache freshness into one status.

pub mod alerts;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod error;
pub mod fallback_cache;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod models;
pub mod openapi;
pub mod rate_limiter;
pub mod router;
pub mod services;
pub mod state;
pub mod store;
pub mod upstream;
pub mod validation;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ReliabilityConfig};
pub use error::WebhookError;
pub use fallback_cache::{FileTier, MemoryTier};
pub use openapi::ApiDoc;
pub use router::{webhooks_router, WebhooksState};
pub use services::BackgroundTasks;
pub use state::{ReliabilityState, ReliabilityStateBuilder};
pub use store::{EventStore, InMemoryEventStore, PgEventStore};
