//! Storage Orchestrator - "The Brain"
//!
//! The only component external callers invoke directly. Composes the mode
//! detector, the resource deduplicator and the storage backends into
//! template-level operations with degraded-mode policy:
//!
//! ```text
//! save    Full      → object store write; blob failure fails the save
//!         Fallback  → filesystem write; failure degrades to local://
//!         LocalOnly → local:// reference, nothing durable
//! delete  Full/Fallback only; refused when ownership cannot be verified
//! list    empty (not an error) when degraded
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dedup::{ResourceDeduplicator, ResourceUpload};
use crate::detector::ModeDetector;
use crate::domain::events::{TemplateEvent, TemplateEventKind};
use crate::domain::ports::{
    EventLog, FallbackStore, MetadataStore, ObjectStore, ProjectService, Scope, StorageContext,
    StorageMode, StorageUrl, TemplateMetadata,
};
use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the storage orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bucket for template JSON blobs
    pub bucket: String,

    /// Base path of the resource proxy endpoint embedded URLs are
    /// rewritten to on load
    pub proxy_base: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bucket: "cardstor".to_string(),
            proxy_base: "/api/resources/proxy".to_string(),
        }
    }
}

// =============================================================================
// API Types
// =============================================================================

/// Input for a template save.
#[derive(Debug, Clone)]
pub struct TemplateInput {
    /// Template name, unique per (owner, project)
    pub name: String,
    /// Target project; `None` resolves the owner's default project
    pub project_hint: Option<String>,
    /// Canvas document (element tree) stored as the template blob
    pub content: Value,
    /// Binary resources referenced by the document
    pub resources: Vec<ResourceUpload>,
}

/// A loaded template: metadata plus the canvas document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub metadata: TemplateMetadata,
    pub content: Value,
}

fn element_count(content: &Value) -> usize {
    content
        .get("elements")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

/// Rewrite embedded object-store URLs into externally reachable proxy
/// URLs, recursively over the document tree.
fn rewrite_embedded_urls(value: &mut Value, proxy_base: &str) {
    match value {
        Value::String(s) => {
            if s.starts_with("s3://") {
                *s = format!("{}?url={}", proxy_base, urlencoding::encode(s));
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_embedded_urls(item, proxy_base);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                rewrite_embedded_urls(item, proxy_base);
            }
        }
        _ => {}
    }
}

/// Recover the content hash from a resource URL. The blob file name is the
/// hex hash, optionally followed by an extension.
fn hash_from_resource_url(url: &StorageUrl) -> Option<String> {
    let file_name = url.key().rsplit('/').next()?;
    let hash = file_name.split('.').next()?;
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_string())
    } else {
        None
    }
}

// =============================================================================
// Storage Orchestrator
// =============================================================================

/// Top-level storage API with degraded-mode semantics.
pub struct StorageOrchestrator {
    config: OrchestratorConfig,
    detector: Arc<ModeDetector>,
    dedup: Arc<ResourceDeduplicator>,
    metadata: Arc<dyn MetadataStore>,
    object_store: Arc<dyn ObjectStore>,
    fallback: Arc<dyn FallbackStore>,
    event_log: Arc<dyn EventLog>,
    projects: Arc<dyn ProjectService>,
}

impl StorageOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        detector: Arc<ModeDetector>,
        dedup: Arc<ResourceDeduplicator>,
        metadata: Arc<dyn MetadataStore>,
        object_store: Arc<dyn ObjectStore>,
        fallback: Arc<dyn FallbackStore>,
        event_log: Arc<dyn EventLog>,
        projects: Arc<dyn ProjectService>,
    ) -> Self {
        Self {
            config,
            detector,
            dedup,
            metadata,
            object_store,
            fallback,
            event_log,
            projects,
        }
    }

    /// The mode detector, for status endpoints.
    pub fn detector(&self) -> &Arc<ModeDetector> {
        &self.detector
    }

    /// The resource deduplicator, for bulk-upload endpoints that store
    /// resources ahead of template creation.
    pub fn deduplicator(&self) -> &Arc<ResourceDeduplicator> {
        &self.dedup
    }

    // =========================================================================
    // Save
    // =========================================================================

    /// Save a template for `owner_id`, creating it or bumping its version.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn save_template(
        &self,
        owner_id: &str,
        input: &TemplateInput,
    ) -> Result<TemplateMetadata> {
        let result = self.save_template_inner(owner_id, input).await;
        metrics::record_template_op("save", result.is_ok());
        result
    }

    async fn save_template_inner(
        &self,
        owner_id: &str,
        input: &TemplateInput,
    ) -> Result<TemplateMetadata> {
        let project_id = self
            .projects
            .resolve_project(owner_id, input.project_hint.as_deref())
            .await?;

        // Probe fresh rather than trusting a stale mode: a save is exactly
        // the operation that must not route blobs to a dead backend.
        let detection = self.detector.detect_mode().await;
        let mode = detection.mode;

        let existing = if mode.metadata_available() {
            self.metadata
                .find_template(owner_id, &project_id, &input.name)
                .await
                .map_err(|e| Error::DatabaseUnavailable(e.to_string()))?
        } else {
            None
        };

        let (id, version, created_at) = match &existing {
            Some(previous) => (previous.id, previous.version + 1, previous.created_at),
            None => (Uuid::new_v4(), 1, Utc::now()),
        };

        let ctx = StorageContext::new(
            Scope::User(owner_id.to_string()),
            project_id.clone(),
            input.name.clone(),
        );

        let blob = Bytes::from(serde_json::to_vec(&input.content)?);
        let storage_url = self.write_template_blob(&ctx, id, blob, mode).await?;

        let resource_urls = self.store_template_resources(input, &ctx, mode).await?;

        let now = Utc::now();
        let template = TemplateMetadata {
            id,
            owner_id: owner_id.to_string(),
            project_id,
            name: input.name.clone(),
            version,
            storage_url,
            storage_mode: mode,
            element_count: element_count(&input.content),
            resource_urls,
            created_at,
            updated_at: now,
        };

        if mode.metadata_available() {
            self.metadata
                .upsert_template(&template)
                .await
                .map_err(|e| Error::DatabaseUnavailable(e.to_string()))?;
        } else {
            // Returned but not yet persisted; the caller sees local-only
            // mode on the record and must not assume durability.
            debug!(template_id = %template.id, "Save completed in-memory only");
        }

        let kind = if existing.is_some() {
            TemplateEventKind::TemplateUpdated
        } else {
            TemplateEventKind::TemplateCreated
        };
        self.emit_event(TemplateEvent::new(
            kind,
            template.id,
            owner_id,
            &template.name,
            template.version,
            mode,
        ))
        .await;

        info!(
            template_id = %template.id,
            version = template.version,
            mode = %mode,
            url = %template.storage_url,
            "Template saved"
        );
        Ok(template)
    }

    /// Write the template JSON blob to the mode's backend.
    async fn write_template_blob(
        &self,
        ctx: &StorageContext,
        template_id: Uuid,
        blob: Bytes,
        mode: StorageMode,
    ) -> Result<StorageUrl> {
        let key = format!("{}/template.json", ctx.key_prefix());
        match mode {
            StorageMode::Full => {
                // No silent downgrade mid-save: a blob failure under Full
                // fails the whole operation.
                self.object_store
                    .put_object(
                        &self.config.bucket,
                        &key,
                        blob,
                        "application/json",
                        HashMap::new(),
                    )
                    .await
                    .map_err(|e| Error::StorageUnavailable {
                        operation: "save_template".to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(StorageUrl::S3 {
                    bucket: self.config.bucket.clone(),
                    key,
                })
            }
            StorageMode::Fallback => match self.fallback.save_template(&key, blob).await {
                Ok(path) => Ok(StorageUrl::Fallback { path }),
                Err(e) => {
                    // Last resort below the fallback: an in-memory-only
                    // reference. Durability is explicitly not guaranteed.
                    warn!(
                        "Fallback store write failed, degrading to local reference: {}",
                        e
                    );
                    Ok(StorageUrl::Local {
                        id: template_id.to_string(),
                    })
                }
            },
            StorageMode::LocalOnly => Ok(StorageUrl::Local {
                id: template_id.to_string(),
            }),
        }
    }

    /// Route the input's resources through the deduplicator. In local-only
    /// mode the dedup index is unreachable, so resources get non-durable
    /// local references instead.
    async fn store_template_resources(
        &self,
        input: &TemplateInput,
        ctx: &StorageContext,
        mode: StorageMode,
    ) -> Result<Vec<String>> {
        if input.resources.is_empty() {
            return Ok(Vec::new());
        }

        if mode == StorageMode::LocalOnly {
            return Ok(input
                .resources
                .iter()
                .map(|_| StorageUrl::Local {
                    id: Uuid::new_v4().to_string(),
                }
                .to_string())
                .collect());
        }

        let results = self.dedup.process_resource_batch(&input.resources, ctx).await;
        let mut urls = Vec::with_capacity(results.len());
        for result in results {
            // A failed resource write aborts the save: no partial template
            // may reference a blob that does not exist.
            urls.push(result?.to_string());
        }
        Ok(urls)
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load a template, verifying ownership.
    #[instrument(skip(self))]
    pub async fn load_template(&self, template_id: Uuid, owner_id: &str) -> Result<Template> {
        let result = self.load_template_inner(template_id, owner_id).await;
        metrics::record_template_op("load", result.is_ok());
        result
    }

    async fn load_template_inner(&self, template_id: Uuid, owner_id: &str) -> Result<Template> {
        let mode = self.detector.current_mode();
        if !mode.metadata_available() {
            return Err(Error::DatabaseUnavailable(
                "templates cannot be loaded in local-only mode".to_string(),
            ));
        }

        let template = self
            .metadata
            .get_template(template_id)
            .await
            .map_err(|e| Error::DatabaseUnavailable(e.to_string()))?
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        if template.owner_id != owner_id {
            return Err(Error::Unauthorized {
                template_id: template_id.to_string(),
            });
        }

        let blob = match &template.storage_url {
            StorageUrl::S3 { bucket, key } => self
                .object_store
                .get_object(bucket, key)
                .await
                .map_err(|e| Error::StorageUnavailable {
                    operation: "load_template".to_string(),
                    reason: e.to_string(),
                })?,
            StorageUrl::Fallback { path } => self.fallback.load_template(path).await?,
            StorageUrl::Local { .. } => {
                return Err(Error::StorageUnavailable {
                    operation: "load_template".to_string(),
                    reason: "template has a non-durable local reference".to_string(),
                })
            }
        };

        let mut content: Value = serde_json::from_slice(&blob)?;
        rewrite_embedded_urls(&mut content, &self.config.proxy_base);

        self.emit_event(TemplateEvent::new(
            TemplateEventKind::TemplateLoaded,
            template.id,
            owner_id,
            &template.name,
            template.version,
            mode,
        ))
        .await;

        Ok(Template {
            metadata: template,
            content,
        })
    }

    // =========================================================================
    // List
    // =========================================================================

    /// List the owner's templates. Returns an empty list, not an error,
    /// when degraded below metadata reach: partial results would mislead.
    #[instrument(skip(self))]
    pub async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateMetadata>> {
        let mode = self.detector.current_mode();
        if !mode.metadata_available() {
            debug!(mode = %mode, "Listing templates while degraded; returning empty");
            return Ok(Vec::new());
        }
        self.metadata
            .list_templates(owner_id)
            .await
            .map_err(|e| Error::DatabaseUnavailable(e.to_string()))
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete a template, its blob (best-effort) and drop its resource
    /// references. Refused in local-only mode: ownership cannot be
    /// verified there, and skipping the check silently is worse than
    /// failing loudly.
    #[instrument(skip(self))]
    pub async fn delete_template(&self, template_id: Uuid, owner_id: &str) -> Result<()> {
        let result = self.delete_template_inner(template_id, owner_id).await;
        metrics::record_template_op("delete", result.is_ok());
        result
    }

    async fn delete_template_inner(&self, template_id: Uuid, owner_id: &str) -> Result<()> {
        let mode = self.detector.current_mode();
        if !mode.metadata_available() {
            return Err(Error::StorageUnavailable {
                operation: "delete_template".to_string(),
                reason: "ownership cannot be verified in local-only mode".to_string(),
            });
        }

        let template = self
            .metadata
            .get_template(template_id)
            .await
            .map_err(|e| Error::DatabaseUnavailable(e.to_string()))?
            .ok_or_else(|| Error::TemplateNotFound(template_id.to_string()))?;

        if template.owner_id != owner_id {
            return Err(Error::Unauthorized {
                template_id: template_id.to_string(),
            });
        }

        // Blob deletion is best-effort; the metadata row removal is the
        // authoritative delete.
        match &template.storage_url {
            StorageUrl::S3 { bucket, key } => {
                if let Err(e) = self.object_store.delete_object(bucket, key).await {
                    warn!(template_id = %template_id, "Failed to delete template blob: {}", e);
                }
            }
            StorageUrl::Fallback { path } => {
                if let Err(e) = self.fallback.delete_template(path).await {
                    warn!(template_id = %template_id, "Failed to delete template blob: {}", e);
                }
            }
            StorageUrl::Local { .. } => {}
        }

        self.metadata
            .delete_template(template_id)
            .await
            .map_err(|e| Error::DatabaseUnavailable(e.to_string()))?;

        for raw_url in &template.resource_urls {
            let Ok(url) = StorageUrl::parse(raw_url) else {
                warn!(url = %raw_url, "Skipping unparseable resource URL during delete");
                continue;
            };
            let Some(hash) = hash_from_resource_url(&url) else {
                continue;
            };
            if let Err(e) = self.dedup.delete_resource(&hash).await {
                warn!(hash = %hash, "Failed to release resource reference: {}", e);
            }
        }

        self.emit_event(TemplateEvent::new(
            TemplateEventKind::TemplateDeleted,
            template.id,
            owner_id,
            &template.name,
            template.version,
            mode,
        ))
        .await;

        info!(template_id = %template_id, "Template deleted");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn emit_event(&self, event: TemplateEvent) {
        if let Err(e) = self.event_log.log_template_event(&event).await {
            debug!(kind = %event.kind, "Template event not recorded: {}", e);
        }
    }
}

impl std::fmt::Debug for StorageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOrchestrator")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{
        InMemoryEventLog, InMemoryFallbackStore, InMemoryMetadataStore, InMemoryObjectStore,
        InMemoryProjectService,
    };
    use crate::dedup::DedupConfig;
    use crate::detector::DetectorConfig;
    use crate::domain::events::TemplateEventKind;
    use serde_json::json;

    struct Fixture {
        orchestrator: StorageOrchestrator,
        metadata: Arc<InMemoryMetadataStore>,
        object_store: Arc<InMemoryObjectStore>,
        fallback: Arc<InMemoryFallbackStore>,
        event_log: Arc<InMemoryEventLog>,
    }

    fn backends() -> (
        Arc<InMemoryMetadataStore>,
        Arc<InMemoryEventLog>,
        Arc<InMemoryObjectStore>,
        Arc<InMemoryFallbackStore>,
    ) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let event_log = Arc::new(InMemoryEventLog::new());
        let object_store = Arc::new(InMemoryObjectStore::new());
        object_store.put_bucket("cardstor");
        let fallback = Arc::new(InMemoryFallbackStore::new());
        (metadata, event_log, object_store, fallback)
    }

    fn fixture_from(
        metadata: Arc<InMemoryMetadataStore>,
        event_log: Arc<InMemoryEventLog>,
        object_store: Arc<InMemoryObjectStore>,
        fallback: Arc<InMemoryFallbackStore>,
    ) -> Fixture {
        let detector = Arc::new(ModeDetector::new(
            DetectorConfig::default(),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&event_log) as Arc<dyn EventLog>,
            Arc::clone(&object_store) as Arc<dyn ObjectStore>,
            Arc::clone(&fallback) as Arc<dyn FallbackStore>,
        ));

        let dedup = Arc::new(ResourceDeduplicator::new(
            DedupConfig::default(),
            Arc::clone(&detector),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&event_log) as Arc<dyn EventLog>,
            Arc::clone(&object_store) as Arc<dyn ObjectStore>,
            Arc::clone(&fallback) as Arc<dyn FallbackStore>,
        ));

        let orchestrator = StorageOrchestrator::new(
            OrchestratorConfig::default(),
            detector,
            dedup,
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&object_store) as Arc<dyn ObjectStore>,
            Arc::clone(&fallback) as Arc<dyn FallbackStore>,
            Arc::clone(&event_log) as Arc<dyn EventLog>,
            Arc::new(InMemoryProjectService::new()),
        );

        Fixture {
            orchestrator,
            metadata,
            object_store,
            fallback,
            event_log,
        }
    }

    fn fixture() -> Fixture {
        let (metadata, event_log, object_store, fallback) = backends();
        fixture_from(metadata, event_log, object_store, fallback)
    }

    fn card_input(name: &str) -> TemplateInput {
        TemplateInput {
            name: name.to_string(),
            project_hint: Some("p1".to_string()),
            content: json!({
                "elements": [
                    {"type": "text", "value": "Hello"},
                    {"type": "image", "src": "placeholder"}
                ]
            }),
            resources: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let f = fixture();
        let input = card_input("Card A");

        let saved = f.orchestrator.save_template("u1", &input).await.unwrap();
        assert_eq!(saved.version, 1);
        assert_eq!(saved.storage_url.scheme(), "s3");
        assert_eq!(saved.element_count, 2);
        assert_eq!(saved.storage_mode, StorageMode::Full);

        let loaded = f.orchestrator.load_template(saved.id, "u1").await.unwrap();
        assert_eq!(loaded.content, input.content);
        assert_eq!(loaded.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_versioning_is_strictly_monotonic() {
        let f = fixture();
        let input = card_input("Card A");

        for expected_version in 1..=4u32 {
            let saved = f.orchestrator.save_template("u1", &input).await.unwrap();
            assert_eq!(saved.version, expected_version);
        }
    }

    #[tokio::test]
    async fn test_save_with_resources_collects_urls() {
        let f = fixture();
        let mut input = card_input("Card A");
        input.resources = vec![
            ResourceUpload::raw("logo.png", "image/png", Bytes::from_static(b"logo")),
            ResourceUpload::raw("bg.jpg", "image/jpeg", Bytes::from_static(b"background")),
        ];

        let saved = f.orchestrator.save_template("u1", &input).await.unwrap();
        assert_eq!(saved.resource_urls.len(), 2);
        assert!(saved.resource_urls.iter().all(|u| u.starts_with("s3://")));
        // 1 template blob + 2 resource blobs
        assert_eq!(f.object_store.object_count(), 3);
    }

    #[tokio::test]
    async fn test_second_save_dedups_shared_resource() {
        let f = fixture();
        let mut input = card_input("Card A");
        input.resources = vec![ResourceUpload::raw(
            "logo.png",
            "image/png",
            Bytes::from_static(b"shared-logo"),
        )];
        f.orchestrator.save_template("u1", &input).await.unwrap();
        let objects_before = f.object_store.object_count();

        let mut second = card_input("Card B");
        second.resources = vec![ResourceUpload::raw(
            "logo-copy.png",
            "image/png",
            Bytes::from_static(b"shared-logo"),
        )];
        let saved = f.orchestrator.save_template("u1", &second).await.unwrap();
        assert_eq!(saved.version, 1);

        // The shared resource produced no new object-store key
        assert_eq!(f.object_store.object_count(), objects_before + 1);

        let hash = crate::dedup::content_hash(b"shared-logo");
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 2);
    }

    #[tokio::test]
    async fn test_save_fails_loudly_when_blob_write_fails_in_full_mode() {
        let f = fixture();
        f.object_store.set_fail_writes(true);

        let err = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
        // No partial template row was left behind
        assert!(f
            .metadata
            .find_template("u1", "p1", "Card A")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fallback_mode_save_and_immediate_load() {
        let (metadata, event_log, object_store, fallback) = backends();
        object_store.set_available(false);
        let f = fixture_from(metadata, event_log, object_store, fallback);

        let input = card_input("Card A");
        let saved = f.orchestrator.save_template("u1", &input).await.unwrap();
        assert_eq!(saved.storage_mode, StorageMode::Fallback);
        assert_eq!(saved.storage_url.scheme(), "fallback");
        assert_eq!(f.fallback.file_count(), 1);

        let loaded = f.orchestrator.load_template(saved.id, "u1").await.unwrap();
        assert_eq!(loaded.content, input.content);
    }

    #[tokio::test]
    async fn test_fallback_write_failure_degrades_to_local_reference() {
        let (metadata, event_log, object_store, fallback) = backends();
        object_store.set_available(false);
        fallback.set_fail_writes(true);
        let f = fixture_from(metadata, event_log, object_store, fallback);

        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();
        assert_eq!(saved.storage_url.scheme(), "local");
    }

    #[tokio::test]
    async fn test_local_only_save_is_not_persisted() {
        let (metadata, event_log, object_store, fallback) = backends();
        metadata.set_available(false);
        let f = fixture_from(
            Arc::clone(&metadata),
            event_log,
            object_store,
            fallback,
        );

        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();
        assert_eq!(saved.storage_mode, StorageMode::LocalOnly);
        assert_eq!(saved.storage_url.scheme(), "local");
        assert_eq!(saved.version, 1);

        metadata.set_available(true);
        assert!(f
            .metadata
            .find_template("u1", "p1", "Card A")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_load_checks_ownership() {
        let f = fixture();
        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .load_template(saved.id, "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_template() {
        let f = fixture();
        f.orchestrator.detector().detect_mode().await;
        let err = f
            .orchestrator
            .load_template(Uuid::new_v4(), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn test_load_rewrites_embedded_urls_to_proxy() {
        let f = fixture();
        let mut input = card_input("Card A");
        input.content = json!({
            "elements": [
                {"type": "image", "src": "s3://cardstor/templates/u1/p1/Card-A/abc.png"}
            ]
        });

        let saved = f.orchestrator.save_template("u1", &input).await.unwrap();
        let loaded = f.orchestrator.load_template(saved.id, "u1").await.unwrap();

        let src = loaded.content["elements"][0]["src"].as_str().unwrap();
        assert!(src.starts_with("/api/resources/proxy?url="));
        assert!(src.contains("s3%3A%2F%2F"));
    }

    #[tokio::test]
    async fn test_delete_refused_in_local_only_mode() {
        let f = fixture();
        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();

        f.orchestrator
            .detector()
            .force_mode(StorageMode::LocalOnly, "test")
            .await;

        let err = f
            .orchestrator
            .delete_template(saved.id, "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));

        // Nothing was deleted
        f.orchestrator
            .detector()
            .force_mode(StorageMode::Full, "test")
            .await;
        assert!(f
            .metadata
            .get_template(saved.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_delete_sole_referencer_removes_resource() {
        let f = fixture();
        let mut input = card_input("Card A");
        input.resources = vec![ResourceUpload::raw(
            "logo.png",
            "image/png",
            Bytes::from_static(b"sole"),
        )];
        let saved = f.orchestrator.save_template("u1", &input).await.unwrap();

        f.orchestrator.delete_template(saved.id, "u1").await.unwrap();

        let hash = crate::dedup::content_hash(b"sole");
        assert!(f.metadata.find_resource_by_hash(&hash).await.unwrap().is_none());
        assert!(f.metadata.get_template(saved.id).await.unwrap().is_none());
        // Template blob and resource blob are both gone
        assert_eq!(f.object_store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_shared_resource_decrements_only() {
        let f = fixture();
        let shared = Bytes::from_static(b"shared-bg");

        let mut first = card_input("Card A");
        first.resources = vec![ResourceUpload::raw("bg.png", "image/png", shared.clone())];
        let a = f.orchestrator.save_template("u1", &first).await.unwrap();

        let mut second = card_input("Card B");
        second.resources = vec![ResourceUpload::raw("bg.png", "image/png", shared.clone())];
        f.orchestrator.save_template("u1", &second).await.unwrap();

        f.orchestrator.delete_template(a.id, "u1").await.unwrap();

        let hash = crate::dedup::content_hash(b"shared-bg");
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 1);
    }

    #[tokio::test]
    async fn test_delete_checks_ownership() {
        let f = fixture();
        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .delete_template(saved.id, "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_list_returns_empty_when_degraded() {
        let f = fixture();
        f.orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();

        f.orchestrator
            .detector()
            .force_mode(StorageMode::LocalOnly, "test")
            .await;
        let listed = f.orchestrator.list_templates("u1").await.unwrap();
        assert!(listed.is_empty());

        f.orchestrator
            .detector()
            .force_mode(StorageMode::Full, "test")
            .await;
        let listed = f.orchestrator.list_templates("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted() {
        let f = fixture();
        let saved = f
            .orchestrator
            .save_template("u1", &card_input("Card A"))
            .await
            .unwrap();
        f.orchestrator.save_template("u1", &card_input("Card A")).await.unwrap();
        f.orchestrator.load_template(saved.id, "u1").await.unwrap();
        f.orchestrator.delete_template(saved.id, "u1").await.unwrap();

        let kinds: Vec<TemplateEventKind> = f
            .event_log
            .template_events()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TemplateEventKind::TemplateCreated,
                TemplateEventKind::TemplateUpdated,
                TemplateEventKind::TemplateLoaded,
                TemplateEventKind::TemplateDeleted,
            ]
        );
    }

    #[test]
    fn test_element_count_handles_missing_elements() {
        assert_eq!(element_count(&json!({"elements": [1, 2, 3]})), 3);
        assert_eq!(element_count(&json!({"other": true})), 0);
        assert_eq!(element_count(&json!(null)), 0);
    }

    #[test]
    fn test_hash_from_resource_url() {
        let hash = "a".repeat(64);
        let url = StorageUrl::parse(&format!("s3://b/templates/u/p/t/{}.png", hash)).unwrap();
        assert_eq!(hash_from_resource_url(&url), Some(hash.clone()));

        let url = StorageUrl::parse(&format!("fallback://templates/u/p/t/{}", hash)).unwrap();
        assert_eq!(hash_from_resource_url(&url), Some(hash));

        let url = StorageUrl::parse("s3://b/templates/u/p/t/template.json").unwrap();
        assert_eq!(hash_from_resource_url(&url), None);
    }
}
