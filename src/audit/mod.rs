//! Durable audit trail of run lifecycle events.
//!
//! Each run appends JSON lines to `<state_dir>/audit/<run_id>/events.jsonl`
//! and keeps a small manifest next to them.

mod record;
mod store;
mod writer;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use record::{AuditEventType, AuditRecord, AuditRunManifest, AUDIT_SCHEMA_VERSION};
pub use store::{AuditError, AuditResult, AuditStore};
pub use writer::AuditWriter;

/// Writer shared between concurrent units.
pub type SharedAuditWriter = Arc<Mutex<AuditWriter>>;
