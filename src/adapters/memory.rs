//! In-Memory Adapters
//!
//! Process-local implementations of the backend ports. They back the test
//! suite and local development runs, and expose failure-injection switches
//! so degraded-mode behavior can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::events::{HealthSample, ModeTransition, TemplateEvent};
use crate::domain::ports::{
    EventLog, MetadataStore, ObjectStore, ProjectService, ResourceRecord, StorageMode, StorageUrl,
    TemplateMetadata,
};
use crate::error::{Error, Result};

fn unavailable(backend: &str) -> Error {
    Error::BackendUnavailable {
        backend: backend.to_string(),
        reason: "injected failure".to_string(),
    }
}

// =============================================================================
// In-Memory Metadata Store
// =============================================================================

/// In-memory relational metadata store double.
#[derive(Debug)]
pub struct InMemoryMetadataStore {
    templates: DashMap<Uuid, TemplateMetadata>,
    resources: DashMap<String, ResourceRecord>,
    available: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
            resources: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; unavailable stores fail every call.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(unavailable("metadata-store"))
        }
    }

    /// Number of stored resource records (test helper).
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<()> {
        self.check()?;
        self.templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, template_id: Uuid) -> Result<Option<TemplateMetadata>> {
        self.check()?;
        Ok(self.templates.get(&template_id).map(|t| t.clone()))
    }

    async fn find_template(
        &self,
        owner_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<TemplateMetadata>> {
        self.check()?;
        Ok(self
            .templates
            .iter()
            .find(|t| t.owner_id == owner_id && t.project_id == project_id && t.name == name)
            .map(|t| t.clone()))
    }

    async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateMetadata>> {
        self.check()?;
        let mut templates: Vec<TemplateMetadata> = self
            .templates
            .iter()
            .filter(|t| t.owner_id == owner_id)
            .map(|t| t.clone())
            .collect();
        templates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(templates)
    }

    async fn delete_template(&self, template_id: Uuid) -> Result<()> {
        self.check()?;
        self.templates.remove(&template_id);
        Ok(())
    }

    async fn find_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>> {
        self.check()?;
        Ok(self.resources.get(hash).map(|r| r.clone()))
    }

    async fn create_resource(&self, record: &ResourceRecord) -> Result<()> {
        self.check()?;
        self.resources.insert(record.hash.clone(), record.clone());
        Ok(())
    }

    async fn update_resource_url(
        &self,
        hash: &str,
        url: &StorageUrl,
        mode: StorageMode,
    ) -> Result<()> {
        self.check()?;
        match self.resources.get_mut(hash) {
            Some(mut record) => {
                record.storage_url = url.clone();
                record.storage_mode = mode;
                Ok(())
            }
            None => Err(Error::ResourceNotFound(hash.to_string())),
        }
    }

    async fn increment_resource_refs(&self, hash: &str) -> Result<u64> {
        self.check()?;
        match self.resources.get_mut(hash) {
            Some(mut record) => {
                record.reference_count += 1;
                record.last_accessed = Utc::now();
                Ok(record.reference_count)
            }
            None => Err(Error::ResourceNotFound(hash.to_string())),
        }
    }

    async fn decrement_resource_refs(&self, hash: &str) -> Result<u64> {
        self.check()?;
        match self.resources.get_mut(hash) {
            Some(mut record) => {
                record.reference_count = record.reference_count.saturating_sub(1);
                Ok(record.reference_count)
            }
            None => Err(Error::ResourceNotFound(hash.to_string())),
        }
    }

    async fn delete_resource(&self, hash: &str) -> Result<()> {
        self.check()?;
        self.resources.remove(hash);
        Ok(())
    }
}

// =============================================================================
// In-Memory Object Store
// =============================================================================

/// In-memory S3 double, keyed by (bucket, key).
#[derive(Debug)]
pub struct InMemoryObjectStore {
    buckets: DashMap<String, ()>,
    objects: DashMap<(String, String), (Bytes, String)>,
    available: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            objects: DashMap::new(),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Fail only writes, while probes keep passing. Simulates a blob-store
    /// failure in the middle of a save.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Pre-create a bucket (test helper).
    pub fn put_bucket(&self, bucket: &str) {
        self.buckets.insert(bucket.to_string(), ());
    }

    /// Number of stored objects (test helper).
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(unavailable("object-store"))
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.check()?;
        Ok(self.buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.check()?;
        self.buckets.insert(bucket.to_string(), ());
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.check()?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(unavailable("object-store"));
        }
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            (data, content_type.to_string()),
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.check()?;
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.0.clone())
            .ok_or_else(|| Error::ResourceNotFound(format!("s3://{}/{}", bucket, key)))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.check()?;
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket && entry.key().1.starts_with(prefix))
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// =============================================================================
// In-Memory Fallback Store
// =============================================================================

use crate::domain::ports::FallbackStore;

/// In-memory fallback store double, keyed by relative path.
#[derive(Debug)]
pub struct InMemoryFallbackStore {
    files: DashMap<String, Bytes>,
    available: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryFallbackStore {
    pub fn new() -> Self {
        Self {
            files: DashMap::new(),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Fail only writes, while the writability probe keeps passing.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of stored blobs (test helper).
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(unavailable("fallback-store"))
        }
    }

    fn write(&self, key: &str, data: Bytes) -> Result<String> {
        self.check()?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(unavailable("fallback-store"));
        }
        self.files.insert(key.to_string(), data);
        Ok(key.to_string())
    }

    fn read(&self, path: &str) -> Result<Bytes> {
        self.check()?;
        self.files
            .get(path)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ResourceNotFound(format!("fallback://{}", path)))
    }
}

#[async_trait]
impl FallbackStore for InMemoryFallbackStore {
    async fn save_template(&self, key: &str, data: Bytes) -> Result<String> {
        self.write(key, data)
    }

    async fn load_template(&self, path: &str) -> Result<Bytes> {
        match self.read(path) {
            Err(Error::ResourceNotFound(_)) => {
                Err(Error::TemplateNotFound(format!("fallback://{}", path)))
            }
            other => other,
        }
    }

    async fn delete_template(&self, path: &str) -> Result<()> {
        self.check()?;
        self.files.remove(path);
        Ok(())
    }

    async fn save_resource(&self, key: &str, data: Bytes) -> Result<String> {
        self.write(key, data)
    }

    async fn load_resource(&self, path: &str) -> Result<Bytes> {
        self.read(path)
    }

    async fn delete_resource(&self, path: &str) -> Result<()> {
        self.check()?;
        self.files.remove(path);
        Ok(())
    }

    async fn check_writable(&self) -> Result<()> {
        self.check()
    }

    async fn free_space_bytes(&self) -> Option<u64> {
        None
    }
}

// =============================================================================
// In-Memory Event Log
// =============================================================================

/// In-memory append-only event log double with inspection accessors.
#[derive(Debug)]
pub struct InMemoryEventLog {
    transitions: RwLock<Vec<ModeTransition>>,
    samples: RwLock<Vec<HealthSample>>,
    template_events: RwLock<Vec<TemplateEvent>>,
    resources: DashMap<String, ResourceRecord>,
    available: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self {
            transitions: RwLock::new(Vec::new()),
            samples: RwLock::new(Vec::new()),
            template_events: RwLock::new(Vec::new()),
            resources: DashMap::new(),
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Fail only appends, while the liveness probe keeps passing.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_write(&self) -> Result<()> {
        self.check()?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(unavailable("event-log"));
        }
        Ok(())
    }

    /// All recorded mode transitions, in append order.
    pub fn mode_transitions(&self) -> Vec<ModeTransition> {
        self.transitions.read().clone()
    }

    /// All recorded health samples, in append order.
    pub fn health_samples(&self) -> Vec<HealthSample> {
        self.samples.read().clone()
    }

    /// All recorded template lifecycle events, in append order.
    pub fn template_events(&self) -> Vec<TemplateEvent> {
        self.template_events.read().clone()
    }

    /// Seed an audit-only resource record (test helper for the
    /// inconsistency path).
    pub fn seed_resource(&self, record: ResourceRecord) {
        self.resources.insert(record.hash.clone(), record);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(unavailable("event-log"))
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn log_mode_transition(&self, transition: &ModeTransition) -> Result<()> {
        self.check_write()?;
        self.transitions.write().push(transition.clone());
        Ok(())
    }

    async fn log_storage_health(&self, samples: &[HealthSample]) -> Result<()> {
        self.check_write()?;
        self.samples.write().extend_from_slice(samples);
        Ok(())
    }

    async fn log_template_event(&self, event: &TemplateEvent) -> Result<()> {
        self.check_write()?;
        self.template_events.write().push(event.clone());
        Ok(())
    }

    async fn save_resource_metadata(&self, record: &ResourceRecord) -> Result<()> {
        self.check_write()?;
        self.resources.insert(record.hash.clone(), record.clone());
        Ok(())
    }

    async fn get_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>> {
        self.check()?;
        Ok(self.resources.get(hash).map(|r| r.clone()))
    }

    async fn increment_resource_reference(&self, hash: &str) -> Result<()> {
        self.check()?;
        if let Some(mut record) = self.resources.get_mut(hash) {
            record.reference_count += 1;
            record.last_accessed = Utc::now();
        }
        Ok(())
    }
}

// =============================================================================
// In-Memory Project Service
// =============================================================================

/// Project service double: resolves the hint verbatim, or a per-owner
/// default project created on first use.
#[derive(Debug, Default)]
pub struct InMemoryProjectService {
    defaults: DashMap<String, String>,
}

impl InMemoryProjectService {
    pub fn new() -> Self {
        Self {
            defaults: DashMap::new(),
        }
    }
}

#[async_trait]
impl ProjectService for InMemoryProjectService {
    async fn resolve_project(&self, owner_id: &str, hint: Option<&str>) -> Result<String> {
        if let Some(project_id) = hint {
            return Ok(project_id.to_string());
        }
        let project_id = self
            .defaults
            .entry(owner_id.to_string())
            .or_insert_with(|| format!("default-{}", Uuid::new_v4()))
            .clone();
        Ok(project_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str) -> ResourceRecord {
        ResourceRecord {
            hash: hash.to_string(),
            resource_id: Uuid::new_v4(),
            original_name: "logo.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 4,
            storage_url: StorageUrl::parse("s3://cards/templates/u/p/t/logo.png").unwrap(),
            storage_mode: StorageMode::Full,
            reference_count: 1,
            first_seen: Utc::now(),
            last_accessed: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_metadata_store_refcount_primitives_are_distinct() {
        let store = InMemoryMetadataStore::new();
        store.create_resource(&record("abc")).await.unwrap();

        assert_eq!(store.increment_resource_refs("abc").await.unwrap(), 2);
        assert_eq!(store.decrement_resource_refs("abc").await.unwrap(), 1);
        assert_eq!(store.decrement_resource_refs("abc").await.unwrap(), 0);
        // Saturates, never wraps
        assert_eq!(store.decrement_resource_refs("abc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_metadata_store_unavailable_fails_calls() {
        let store = InMemoryMetadataStore::new();
        store.set_available(false);
        assert!(store.ping().await.is_err());
        assert!(store.find_resource_by_hash("x").await.is_err());
    }

    #[tokio::test]
    async fn test_object_store_prefix_listing() {
        let store = InMemoryObjectStore::new();
        store.put_bucket("cards");
        for key in ["templates/a/1", "templates/a/2", "templates/b/1"] {
            store
                .put_object("cards", key, Bytes::from_static(b"x"), "text/plain", HashMap::new())
                .await
                .unwrap();
        }
        let keys = store.list_objects("cards", "templates/a/").await.unwrap();
        assert_eq!(keys, vec!["templates/a/1", "templates/a/2"]);
    }

    #[tokio::test]
    async fn test_object_store_write_failure_injection() {
        let store = InMemoryObjectStore::new();
        store.put_bucket("cards");
        store.set_fail_writes(true);
        // Probe still passes while writes fail
        assert!(store.bucket_exists("cards").await.unwrap());
        let result = store
            .put_object("cards", "k", Bytes::from_static(b"x"), "text/plain", HashMap::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_event_log_accumulates_in_order() {
        let log = InMemoryEventLog::new();
        log.log_mode_transition(&ModeTransition::auto(
            StorageMode::LocalOnly,
            StorageMode::Full,
            "up",
        ))
        .await
        .unwrap();
        log.log_mode_transition(&ModeTransition::auto(
            StorageMode::Full,
            StorageMode::Fallback,
            "obj down",
        ))
        .await
        .unwrap();

        let transitions = log.mode_transitions();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].to_mode, StorageMode::Full);
        assert_eq!(transitions[1].to_mode, StorageMode::Fallback);
    }

    #[tokio::test]
    async fn test_project_service_default_is_stable() {
        let service = InMemoryProjectService::new();
        let first = service.resolve_project("u1", None).await.unwrap();
        let second = service.resolve_project("u1", None).await.unwrap();
        assert_eq!(first, second);

        let hinted = service.resolve_project("u1", Some("p-9")).await.unwrap();
        assert_eq!(hinted, "p-9");
    }
}
