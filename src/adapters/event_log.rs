//! Event Log Adapters
//!
//! The production event log is an external wide-column cluster reached
//! through the `EventLog` port. In-process, two adapters cover local and
//! degraded runs: a tracing-backed publisher that turns every record into
//! a structured log line, and a composite that fans records out to several
//! logs at once.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::{HealthSample, ModeTransition, TemplateEvent};
use crate::domain::ports::{EventLog, ResourceRecord};
use crate::error::Result;

// =============================================================================
// Tracing Event Log
// =============================================================================

/// Event log that publishes records to the tracing/logging system.
///
/// Useful for development, debugging and audit trails. Reads always miss:
/// a log line is not a queryable store.
#[derive(Debug, Clone, Default)]
pub struct TracingEventLog {
    /// Log at info level (true) or debug level (false)
    info_level: bool,
}

impl TracingEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    fn emit(&self, record_type: &str, json: String) {
        if self.info_level {
            info!(record_type = %record_type, record = %json, "Storage event");
        } else {
            debug!(record_type = %record_type, record = %json, "Storage event");
        }
    }
}

#[async_trait]
impl EventLog for TracingEventLog {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn log_mode_transition(&self, transition: &ModeTransition) -> Result<()> {
        let json =
            serde_json::to_string(transition).unwrap_or_else(|_| format!("{:?}", transition));
        self.emit("mode_transition", json);
        Ok(())
    }

    async fn log_storage_health(&self, samples: &[HealthSample]) -> Result<()> {
        for sample in samples {
            let json = serde_json::to_string(sample).unwrap_or_else(|_| format!("{:?}", sample));
            self.emit("health_sample", json);
        }
        Ok(())
    }

    async fn log_template_event(&self, event: &TemplateEvent) -> Result<()> {
        let json = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));
        self.emit("template_event", json);
        Ok(())
    }

    async fn save_resource_metadata(&self, record: &ResourceRecord) -> Result<()> {
        let json = serde_json::to_string(record).unwrap_or_else(|_| format!("{:?}", record));
        self.emit("resource_metadata", json);
        Ok(())
    }

    async fn get_resource_by_hash(&self, _hash: &str) -> Result<Option<ResourceRecord>> {
        Ok(None)
    }

    async fn increment_resource_reference(&self, _hash: &str) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Composite Event Log
// =============================================================================

/// Fans every record out to multiple event logs. Reads are answered by the
/// first log that returns a hit.
#[derive(Default)]
pub struct CompositeEventLog {
    logs: Vec<Box<dyn EventLog>>,
}

impl CompositeEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a log to the composite.
    pub fn with_log<L: EventLog + 'static>(mut self, log: L) -> Self {
        self.logs.push(Box::new(log));
        self
    }
}

impl std::fmt::Debug for CompositeEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventLog")
            .field("log_count", &self.logs.len())
            .finish()
    }
}

#[async_trait]
impl EventLog for CompositeEventLog {
    async fn ping(&self) -> Result<()> {
        for log in &self.logs {
            log.ping().await?;
        }
        Ok(())
    }

    async fn log_mode_transition(&self, transition: &ModeTransition) -> Result<()> {
        for log in &self.logs {
            log.log_mode_transition(transition).await?;
        }
        Ok(())
    }

    async fn log_storage_health(&self, samples: &[HealthSample]) -> Result<()> {
        for log in &self.logs {
            log.log_storage_health(samples).await?;
        }
        Ok(())
    }

    async fn log_template_event(&self, event: &TemplateEvent) -> Result<()> {
        for log in &self.logs {
            log.log_template_event(event).await?;
        }
        Ok(())
    }

    async fn save_resource_metadata(&self, record: &ResourceRecord) -> Result<()> {
        for log in &self.logs {
            log.save_resource_metadata(record).await?;
        }
        Ok(())
    }

    async fn get_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>> {
        for log in &self.logs {
            if let Some(record) = log.get_resource_by_hash(hash).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn increment_resource_reference(&self, hash: &str) -> Result<()> {
        for log in &self.logs {
            log.increment_resource_reference(hash).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryEventLog;
    use crate::domain::ports::StorageMode;

    #[tokio::test]
    async fn test_tracing_log_accepts_all_records() {
        let log = TracingEventLog::new();
        log.log_mode_transition(&ModeTransition::auto(
            StorageMode::Full,
            StorageMode::Fallback,
            "obj down",
        ))
        .await
        .unwrap();
        log.log_storage_health(&[HealthSample::available("metadata-store")])
            .await
            .unwrap();
        assert!(log.get_resource_by_hash("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_composite_fans_out() {
        let memory = InMemoryEventLog::new();
        let composite = CompositeEventLog::new()
            .with_log(TracingEventLog::new())
            .with_log(memory);

        composite
            .log_mode_transition(&ModeTransition::auto(
                StorageMode::LocalOnly,
                StorageMode::Full,
                "up",
            ))
            .await
            .unwrap();
        composite.ping().await.unwrap();
    }
}
