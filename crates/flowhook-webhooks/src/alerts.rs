//! Alert classification, coalescing and resolution.
//!
//! Significant pipeline events are matched against an ordered rule table.
//! The first matching rule assigns the severity and the title; events that
//! produce the same (category, title) as an active alert increment that alert
//! instead of creating a new one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::circuit_breaker::{BreakerObserver, BreakerSnapshot, CircuitState};
use crate::clock::SharedClock;
use crate::error::WebhookError;

/// Default silence period after which an alert with no new occurrences is resolved.
pub const DEFAULT_SILENCE_TIMEOUT_SECS: i64 = 1800;

/// Maximum number of resolved alerts retained.
pub const DEFAULT_MAX_RESOLVED: usize = 500;

/// Maximum number of active alerts held at once.
pub const DEFAULT_MAX_ACTIVE: usize = 1000;

/// Title shared by both error-rate rules so warning escalates to critical.
pub const ERROR_RATE_TITLE: &str = "Elevated 24h error rate";

/// Severity level of an alert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, no action needed.
    Info,
    /// Needs attention.
    Warning,
    /// Immediate attention required.
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A significant event submitted for classification.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64))]
    pub event_type: String,

    #[validate(length(min = 1, max = 64))]
    pub category: String,

    #[validate(length(max = 1000))]
    #[serde(default)]
    pub message: String,

    #[serde(default = "empty_object")]
    #[schema(value_type = Object)]
    pub details: serde_json::Value,

    #[serde(default)]
    pub correlation_id: Option<String>,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl AlertEvent {
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            category: category.into(),
            message: message.into(),
            details: empty_object(),
            correlation_id: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn numeric_value(&self) -> Option<f64> {
        self.details.get("value").and_then(serde_json::Value::as_f64)
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AlertRule {
    pub name: String,
    /// Matches `AlertEvent::event_type` when set.
    pub event_type: Option<String>,
    /// Matches `AlertEvent::category` when set.
    pub category: Option<String>,
    /// Requires `details.value > threshold` when set.
    pub threshold: Option<f64>,
    pub severity: Severity,
    /// Title with `{message}`, `{category}`, `{type}` or `{<details key>}` placeholders.
    pub title_template: String,
}

impl AlertRule {
    #[must_use]
    pub fn new(name: &str, severity: Severity, title_template: &str) -> Self {
        Self {
            name: name.to_string(),
            event_type: None,
            category: None,
            threshold: None,
            severity,
            title_template: title_template.to_string(),
        }
    }

    #[must_use]
    pub fn for_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    #[must_use]
    pub fn in_category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    #[must_use]
    pub fn above(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn matches(&self, event: &AlertEvent) -> bool {
        if self
            .event_type
            .as_deref()
            .is_some_and(|t| t != event.event_type)
        {
            return false;
        }
        if self
            .category
            .as_deref()
            .is_some_and(|c| c != event.category)
        {
            return false;
        }
        match self.threshold {
            Some(threshold) => event.numeric_value().is_some_and(|v| v > threshold),
            None => true,
        }
    }

    #[must_use]
    pub fn render_title(&self, event: &AlertEvent) -> String {
        render_template(&self.title_template, event)
    }
}

fn render_template(template: &str, event: &AlertEvent) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        let value = match name {
            "message" => Some(event.message.clone()),
            "category" => Some(event.category.clone()),
            "type" => Some(event.event_type.clone()),
            key => event.details.get(key).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        };
        match value {
            Some(v) => out.push_str(&v),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Built-in classification table. Order matters: first match wins.
#[must_use]
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "breaker_open",
            Severity::Critical,
            "Circuit breaker {breaker} is open",
        )
        .for_type("breaker_open"),
        AlertRule::new("storage_failure", Severity::Critical, "Event store failure")
            .for_type("storage_failure")
            .in_category("storage"),
        AlertRule::new(
            "signature_invalid",
            Severity::Warning,
            "Webhook signature verification failed",
        )
        .for_type("signature_invalid")
        .in_category("security"),
        AlertRule::new("schema_invalid", Severity::Info, "Malformed webhook payload")
            .for_type("schema_invalid")
            .in_category("ingest"),
        AlertRule::new(
            "upstream_failure",
            Severity::Warning,
            "Upstream platform call failed",
        )
        .for_type("upstream_failure")
        .in_category("upstream"),
        AlertRule::new(
            "workflow_failure",
            Severity::Warning,
            "Workflow {workflow_id} reported failures",
        )
        .for_type("workflow_failure")
        .in_category("workflow"),
        AlertRule::new("error_rate_critical", Severity::Critical, ERROR_RATE_TITLE)
            .for_type("error_rate")
            .in_category("health")
            .above(0.05),
        AlertRule::new("error_rate_warning", Severity::Warning, ERROR_RATE_TITLE)
            .for_type("error_rate")
            .in_category("health")
            .above(0.02),
        AlertRule::new(
            "trigger_limit",
            Severity::Info,
            "Daily trigger limit reached for {workflow_id}",
        )
        .for_type("trigger_limit")
        .in_category("upstream"),
        AlertRule::new("custom", Severity::Warning, "{message}").for_type("custom"),
    ]
}

/// A classified, possibly coalesced alert.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: Uuid,
    pub rule: String,
    pub category: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub correlation_id: Option<String>,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub occurrence_count: u64,
    pub status: AlertStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// Aggregate alert statistics. Breakdowns cover active alerts only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct AlertStats {
    pub active_alerts: usize,
    /// Alerts created since start, coalesced occurrences counted once.
    pub total_alerts: u64,
    pub resolved_alerts: u64,
    pub by_category: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct AlertsInner {
    active: HashMap<Uuid, Alert>,
    resolved: VecDeque<Alert>,
    total_created: u64,
    total_resolved: u64,
}

impl AlertsInner {
    fn find_active(&mut self, category: &str, title: &str) -> Option<&mut Alert> {
        self.active
            .values_mut()
            .find(|a| a.category == category && a.title == title)
    }

    fn resolve(&mut self, id: Uuid, now: DateTime<Utc>, max_resolved: usize) -> Option<Alert> {
        let mut alert = self.active.remove(&id)?;
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        self.total_resolved += 1;
        self.resolved.push_back(alert.clone());
        while self.resolved.len() > max_resolved {
            self.resolved.pop_front();
        }
        Some(alert)
    }

    /// Make room for an alert of `incoming` severity.
    ///
    /// Evicts the least recently seen Info/Warning alert first. Critical
    /// alerts only give way to another critical alert. Returns false when
    /// no slot can be freed.
    fn make_room(
        &mut self,
        incoming: Severity,
        max_active: usize,
        now: DateTime<Utc>,
        max_resolved: usize,
    ) -> bool {
        while self.active.len() >= max_active {
            let victim = match self.oldest_where(|a| a.severity < Severity::Critical) {
                None if incoming == Severity::Critical => self.oldest_where(|_| true),
                other => other,
            };
            let Some(id) = victim else {
                return false;
            };
            if let Some(evicted) = self.resolve(id, now, max_resolved) {
                tracing::info!(
                    target: "alerts",
                    alert_id = %evicted.id,
                    severity = %evicted.severity,
                    title = %evicted.title,
                    "Active alert evicted to stay within capacity"
                );
            }
        }
        true
    }

    fn oldest_where(&self, keep: impl Fn(&Alert) -> bool) -> Option<Uuid> {
        self.active
            .values()
            .filter(|a| keep(a))
            .min_by_key(|a| a.last_occurrence)
            .map(|a| a.id)
    }
}

/// Owns every alert in the process.
pub struct AlertAggregator {
    rules: Vec<AlertRule>,
    silence_timeout: Duration,
    max_resolved: usize,
    max_active: usize,
    clock: SharedClock,
    inner: Mutex<AlertsInner>,
}

impl AlertAggregator {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_rules(default_rules(), clock)
    }

    #[must_use]
    pub fn with_rules(rules: Vec<AlertRule>, clock: SharedClock) -> Self {
        Self {
            rules,
            silence_timeout: Duration::seconds(DEFAULT_SILENCE_TIMEOUT_SECS),
            max_resolved: DEFAULT_MAX_RESOLVED,
            max_active: DEFAULT_MAX_ACTIVE,
            clock,
            inner: Mutex::new(AlertsInner::default()),
        }
    }

    #[must_use]
    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_resolved(mut self, max: usize) -> Self {
        self.max_resolved = max;
        self
    }

    #[must_use]
    pub fn with_max_active(mut self, max: usize) -> Self {
        self.max_active = max.max(1);
        self
    }

    /// The classification table in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// First rule matching `event`.
    #[must_use]
    pub fn classify(&self, event: &AlertEvent) -> Option<&AlertRule> {
        self.rules.iter().find(|rule| rule.matches(event))
    }

    /// Classify an event and create or coalesce an alert.
    ///
    /// Returns `None` when no rule matches.
    pub fn process_event(&self, event: AlertEvent) -> Option<Alert> {
        let now = self.clock.now();
        self.sweep_idle(now);

        let Some(rule) = self.classify(&event) else {
            tracing::debug!(
                target: "alerts",
                event_type = %event.event_type,
                category = %event.category,
                "No alert rule matched event"
            );
            return None;
        };
        let title = rule.render_title(&event);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.find_active(&event.category, &title) {
            existing.occurrence_count += 1;
            existing.last_occurrence = now;
            existing.message.clone_from(&event.message);
            existing.details = event.details;
            if event.correlation_id.is_some() {
                existing.correlation_id = event.correlation_id;
            }
            if rule.severity > existing.severity {
                tracing::warn!(
                    target: "alerts",
                    alert_id = %existing.id,
                    from = %existing.severity,
                    to = %rule.severity,
                    "Alert severity escalated"
                );
                existing.severity = rule.severity;
                existing.rule.clone_from(&rule.name);
            }
            return Some(existing.clone());
        }

        if !inner.make_room(rule.severity, self.max_active, now, self.max_resolved) {
            tracing::warn!(
                target: "alerts",
                category = %event.category,
                title = %title,
                "Active alerts at capacity, dropping new alert"
            );
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            rule: rule.name.clone(),
            category: event.category,
            severity: rule.severity,
            title,
            message: event.message,
            correlation_id: event.correlation_id,
            details: event.details,
            first_occurrence: now,
            last_occurrence: now,
            occurrence_count: 1,
            status: AlertStatus::Active,
            resolved_at: None,
        };
        inner.total_created += 1;
        inner.active.insert(alert.id, alert.clone());
        drop(inner);

        match alert.severity {
            Severity::Critical | Severity::Warning => tracing::warn!(
                target: "alerts",
                alert_id = %alert.id,
                severity = %alert.severity,
                category = %alert.category,
                title = %alert.title,
                "Alert raised"
            ),
            Severity::Info => tracing::info!(
                target: "alerts",
                alert_id = %alert.id,
                category = %alert.category,
                title = %alert.title,
                "Alert raised"
            ),
        }
        Some(alert)
    }

    /// Explicitly resolve an active alert.
    pub fn resolve(&self, id: Uuid) -> Result<Alert, WebhookError> {
        let now = self.clock.now();
        let resolved = self.inner.lock().resolve(id, now, self.max_resolved);
        match resolved {
            Some(alert) => {
                tracing::info!(target: "alerts", alert_id = %id, "Alert resolved");
                Ok(alert)
            }
            None => Err(WebhookError::AlertNotFound(id)),
        }
    }

    /// Resolve the active alert with this (category, title), if any.
    pub fn resolve_matching(&self, category: &str, title: &str) -> Option<Alert> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let id = inner.find_active(category, title).map(|a| a.id)?;
        let alert = inner.resolve(id, now, self.max_resolved);
        drop(inner);
        if alert.is_some() {
            tracing::info!(
                target: "alerts",
                alert_id = %id,
                category,
                title,
                "Alert condition cleared"
            );
        }
        alert
    }

    /// Resolve the alert that `event` would have coalesced into.
    pub fn resolve_condition(&self, event: &AlertEvent) -> Option<Alert> {
        let rule = self.classify(event)?;
        let title = rule.render_title(event);
        self.resolve_matching(&event.category, &title)
    }

    /// Resolve alerts silent for at least the silence timeout.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut inner = self.inner.lock();
        let idle: Vec<Uuid> = inner
            .active
            .values()
            .filter(|a| now - a.last_occurrence >= self.silence_timeout)
            .map(|a| a.id)
            .collect();
        let swept: Vec<Alert> = idle
            .into_iter()
            .filter_map(|id| inner.resolve(id, now, self.max_resolved))
            .collect();
        drop(inner);

        if !swept.is_empty() {
            tracing::info!(
                target: "alerts",
                count = swept.len(),
                "Resolved idle alerts"
            );
        }
        swept
    }

    /// Active alerts, most severe and most recent first.
    #[must_use]
    pub fn get_active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.inner.lock().active.values().cloned().collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.last_occurrence.cmp(&a.last_occurrence))
        });
        alerts
    }

    /// Retained resolved alerts, oldest first.
    #[must_use]
    pub fn get_resolved_alerts(&self) -> Vec<Alert> {
        self.inner.lock().resolved.iter().cloned().collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> AlertStats {
        let inner = self.inner.lock();
        let mut stats = AlertStats {
            active_alerts: inner.active.len(),
            total_alerts: inner.total_created,
            resolved_alerts: inner.total_resolved,
            ..AlertStats::default()
        };
        for alert in inner.active.values() {
            *stats.by_category.entry(alert.category.clone()).or_default() += 1;
            *stats
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_default() += 1;
        }
        stats
    }

    /// Highest severity among active alerts.
    #[must_use]
    pub fn highest_active_severity(&self) -> Option<Severity> {
        self.inner.lock().active.values().map(|a| a.severity).max()
    }
}

impl std::fmt::Debug for AlertAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertAggregator")
            .field("rules", &self.rules.len())
            .field("silence_timeout_secs", &self.silence_timeout.num_seconds())
            .finish_non_exhaustive()
    }
}

/// Raises an alert when a breaker opens and resolves it when it closes.
pub struct AlertingBreakerObserver {
    alerts: Arc<AlertAggregator>,
}

impl AlertingBreakerObserver {
    #[must_use]
    pub fn new(alerts: Arc<AlertAggregator>) -> Self {
        Self { alerts }
    }

    fn event_for(snapshot: &BreakerSnapshot) -> AlertEvent {
        AlertEvent::new(
            "breaker_open",
            "circuit_breaker",
            format!(
                "Circuit breaker {} opened after repeated failures",
                snapshot.name
            ),
        )
        .with_details(serde_json::json!({
            "breaker": snapshot.name,
            "trip_count": snapshot.trip_count,
            "next_attempt_time": snapshot.next_attempt_time,
        }))
    }
}

impl BreakerObserver for AlertingBreakerObserver {
    fn on_transition(&self, from: CircuitState, to: CircuitState, snapshot: &BreakerSnapshot) {
        match to {
            CircuitState::Open => {
                self.alerts.process_event(Self::event_for(snapshot));
            }
            CircuitState::Closed if from != CircuitState::Closed => {
                self.alerts.resolve_condition(&Self::event_for(snapshot));
            }
            _ => {}
        }
    }
}
