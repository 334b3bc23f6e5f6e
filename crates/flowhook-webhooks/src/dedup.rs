//! Event fingerprinting and duplicate detection.
//!
//! The fingerprint is SHA-256 over the canonical JSON of
//! `{agent_id, offset, payload, workflow_id}` with object keys sorted at every
//! depth, so the sender's key order never changes it. A missing offset
//! fingerprints as 0.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::WebhookError;
use crate::models::InboundEvent;
use crate::store::GuardedStore;

/// Serialize a JSON value with object keys sorted recursively.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Stable 64-hex-character fingerprint of an event's identity.
#[must_use]
pub fn fingerprint(event: &InboundEvent) -> String {
    let identity = serde_json::json!({
        "workflow_id": event.workflow_id,
        "agent_id": event.agent_id,
        "offset": event.offset.unwrap_or(0),
        "payload": event.payload,
    });
    hex::encode(Sha256::digest(canonical_json(&identity).as_bytes()))
}

/// Verdict of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    New,
    Duplicate,
    /// The store could not be consulted and fail-open is enabled.
    AssumedNew,
}

/// Checks fingerprints against the Event Store.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    store: GuardedStore,
    fail_open: bool,
}

impl Deduplicator {
    #[must_use]
    pub fn new(store: GuardedStore, fail_open: bool) -> Self {
        Self { store, fail_open }
    }

    #[must_use]
    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Look up `fingerprint`.
    ///
    /// When the store is unavailable the error is returned unless fail-open
    /// is enabled; the insert's unique constraint still catches duplicates
    /// that slip through.
    pub async fn check(&self, fingerprint: &str) -> Result<DedupDecision, WebhookError> {
        match self.store.find_by_fingerprint(fingerprint).await {
            Ok(Some(_)) => Ok(DedupDecision::Duplicate),
            Ok(None) => Ok(DedupDecision::New),
            Err(err) if self.fail_open => {
                tracing::warn!(
                    target: "webhook_ingest",
                    fingerprint,
                    error = %err,
                    "Dedup lookup failed, treating event as new"
                );
                Ok(DedupDecision::AssumedNew)
            }
            Err(err) => Err(err),
        }
    }
}
