//! Business logic behind the HTTP handlers.

pub mod background;
pub mod ingest_service;
pub mod result_service;
pub mod trigger_service;

pub use background::{probe_store_once, spawn_alert_sweeper, spawn_store_probe, BackgroundTasks};
pub use ingest_service::IngestService;
pub use result_service::{ResultSource, WorkflowResult, WorkflowResultService};
pub use trigger_service::TriggerService;
