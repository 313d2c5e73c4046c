//! Resource Deduplicator
//!
//! Stores binary resources exactly once per distinct content hash, across
//! whichever backend the current mode designates, and returns a stable
//! `StorageUrl` usable by templates.
//!
//! Resources are content-addressed: the SHA-256 of the decoded bytes is the
//! identity, regardless of caller-supplied names. A second upload of the
//! same bytes writes nothing and only bumps the reference count. Two
//! orchestrator processes racing on the same content both write the same
//! key, so the blob result is idempotent; the reference count may briefly
//! over- or under-count, which is accepted as an eventual-consistency
//! tradeoff rather than fixed with cross-process locking.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::detector::ModeDetector;
use crate::domain::ports::{
    EventLog, FallbackStore, MetadataStore, ObjectStore, ResourceRecord, StorageContext,
    StorageMode, StorageUrl,
};
use crate::error::{Error, Result};
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the resource deduplicator
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Maximum decoded resource size
    pub max_resource_bytes: usize,

    /// In-flight operations during batch processing
    pub batch_concurrency: usize,

    /// Bucket used for object-store writes
    pub bucket: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_resource_bytes: 50 * 1024 * 1024,
            batch_concurrency: 5,
            bucket: "cardstor".to_string(),
        }
    }
}

// =============================================================================
// Upload Payloads
// =============================================================================

/// Resource bytes as supplied by the caller.
#[derive(Debug, Clone)]
pub enum ResourcePayload {
    /// Raw bytes, already decoded
    Raw(Bytes),
    /// An embedded `data:` URI (base64 payload)
    DataUri(String),
}

/// One resource upload: payload plus caller-supplied descriptors.
#[derive(Debug, Clone)]
pub struct ResourceUpload {
    pub original_name: String,
    pub mime_type: String,
    pub payload: ResourcePayload,
}

impl ResourceUpload {
    pub fn raw(
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Bytes,
    ) -> Self {
        Self {
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            payload: ResourcePayload::Raw(data),
        }
    }

    pub fn data_uri(original_name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            mime_type: "application/octet-stream".to_string(),
            payload: ResourcePayload::DataUri(uri.into()),
        }
    }
}

/// Decode a payload to bytes, resolving the effective MIME type.
///
/// `data:` URIs carry their own MIME type, which wins over the
/// caller-supplied one.
fn decode_payload(upload: &ResourceUpload) -> Result<(Bytes, String)> {
    match &upload.payload {
        ResourcePayload::Raw(data) => Ok((data.clone(), upload.mime_type.clone())),
        ResourcePayload::DataUri(uri) => {
            let rest = uri
                .strip_prefix("data:")
                .ok_or_else(|| Error::InvalidPayload("not a data URI".to_string()))?;
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| Error::InvalidPayload("data URI missing payload".to_string()))?;
            if !header.ends_with(";base64") {
                return Err(Error::InvalidPayload(
                    "only base64 data URIs are supported".to_string(),
                ));
            }
            let mime = header.trim_end_matches(";base64");
            let mime = if mime.is_empty() {
                upload.mime_type.clone()
            } else {
                mime.to_string()
            };
            let data = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| Error::InvalidPayload(format!("invalid base64 payload: {}", e)))?;
            Ok((Bytes::from(data), mime))
        }
    }
}

/// Hex-encoded SHA-256 of the content.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Blob file name under the scoped directory: the content hash, keeping
/// the original extension for content-type inference on read.
fn resource_file_name(hash: &str, original_name: &str) -> String {
    match original_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("{}.{}", hash, ext.to_ascii_lowercase())
        }
        _ => hash.to_string(),
    }
}

/// A storage URL written before the scoped layout existed.
///
/// The historical convention placed blobs under a flat `resources/`
/// directory; the current one scopes everything under `templates/...`.
fn is_legacy_layout(url: &StorageUrl) -> bool {
    match url {
        StorageUrl::S3 { key, .. } => !key.starts_with("templates/"),
        StorageUrl::Fallback { path } => !path.starts_with("templates/"),
        StorageUrl::Local { .. } => false,
    }
}

// =============================================================================
// Resource Deduplicator
// =============================================================================

/// Content-addressed resource store with cross-backend deduplication.
pub struct ResourceDeduplicator {
    config: DedupConfig,
    detector: Arc<ModeDetector>,
    metadata: Arc<dyn MetadataStore>,
    event_log: Arc<dyn EventLog>,
    object_store: Arc<dyn ObjectStore>,
    fallback: Arc<dyn FallbackStore>,
}

impl ResourceDeduplicator {
    pub fn new(
        config: DedupConfig,
        detector: Arc<ModeDetector>,
        metadata: Arc<dyn MetadataStore>,
        event_log: Arc<dyn EventLog>,
        object_store: Arc<dyn ObjectStore>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Self {
        Self {
            config,
            detector,
            metadata,
            event_log,
            object_store,
            fallback,
        }
    }

    /// Store one resource, deduplicating by content hash.
    ///
    /// Hashing and metadata lookup failures propagate: they indicate a
    /// systemic store outage the caller should translate into a
    /// degraded-mode response. Audit-log writes never block the returned
    /// URL.
    #[instrument(skip(self, upload), fields(name = %upload.original_name))]
    pub async fn store_resource(
        &self,
        upload: &ResourceUpload,
        ctx: &StorageContext,
    ) -> Result<StorageUrl> {
        ctx.validate()?;

        let (data, mime_type) = decode_payload(upload)?;
        if data.len() > self.config.max_resource_bytes {
            return Err(Error::ResourceTooLarge {
                size: data.len(),
                limit: self.config.max_resource_bytes,
            });
        }

        let hash = content_hash(&data);

        if let Some(record) = self.metadata.find_resource_by_hash(&hash).await? {
            return self.handle_dedup_hit(record, &data, &mime_type, ctx).await;
        }

        // Not in the canonical store; an audit-only copy means a prior save
        // half-completed. Surface it, then proceed as a miss.
        match self.event_log.get_resource_by_hash(&hash).await {
            Ok(Some(orphan)) => {
                warn!(
                    hash = %hash,
                    audit_url = %orphan.storage_url,
                    "Resource record inconsistency: present in event log but not in metadata store"
                );
            }
            Ok(None) => {}
            Err(e) => debug!("Event log resource lookup failed: {}", e),
        }

        metrics::record_dedup("miss");
        self.store_new_resource(upload, data, mime_type, hash, ctx)
            .await
    }

    /// Dedup hit: no bytes are re-written unless the record still uses the
    /// legacy path layout, in which case the content is re-stored under the
    /// scoped layout once, opportunistically.
    async fn handle_dedup_hit(
        &self,
        record: ResourceRecord,
        data: &Bytes,
        mime_type: &str,
        ctx: &StorageContext,
    ) -> Result<StorageUrl> {
        let url = if is_legacy_layout(&record.storage_url) {
            debug!(
                hash = %record.hash,
                legacy_url = %record.storage_url,
                "Migrating resource from legacy path layout"
            );
            let key = format!(
                "{}/{}",
                ctx.key_prefix(),
                resource_file_name(&record.hash, &record.original_name)
            );
            let mode = self.detector.current_mode();
            let url = self
                .write_blob(&key, data.clone(), mime_type, &record.hash, mode)
                .await?;
            self.metadata
                .update_resource_url(&record.hash, &url, mode)
                .await?;
            metrics::record_dedup("migrated");
            url
        } else {
            metrics::record_dedup("hit");
            record.storage_url.clone()
        };

        let count = self.metadata.increment_resource_refs(&record.hash).await?;
        debug!(hash = %record.hash, reference_count = count, "Resource deduplicated");

        // Keep the audit copy's counter roughly in step, best-effort.
        if let Err(e) = self
            .event_log
            .increment_resource_reference(&record.hash)
            .await
        {
            debug!("Event log reference increment failed: {}", e);
        }

        Ok(url)
    }

    async fn store_new_resource(
        &self,
        upload: &ResourceUpload,
        data: Bytes,
        mime_type: String,
        hash: String,
        ctx: &StorageContext,
    ) -> Result<StorageUrl> {
        let mode = self.detector.current_mode();
        let key = format!(
            "{}/{}",
            ctx.key_prefix(),
            resource_file_name(&hash, &upload.original_name)
        );

        let url = self
            .write_blob(&key, data.clone(), &mime_type, &hash, mode)
            .await?;

        let now = Utc::now();
        let record = ResourceRecord {
            hash: hash.clone(),
            resource_id: Uuid::new_v4(),
            original_name: upload.original_name.clone(),
            mime_type,
            size: data.len() as u64,
            storage_url: url.clone(),
            storage_mode: mode,
            reference_count: 1,
            first_seen: now,
            last_accessed: now,
        };
        self.metadata.create_resource(&record).await?;

        if let Err(e) = self.event_log.save_resource_metadata(&record).await {
            debug!("Event log resource audit write failed: {}", e);
        }

        debug!(hash = %hash, url = %url, "Stored new resource");
        Ok(url)
    }

    /// Route a blob write to the backend the mode designates: object store
    /// under `Full`, fallback store otherwise.
    async fn write_blob(
        &self,
        key: &str,
        data: Bytes,
        mime_type: &str,
        hash: &str,
        mode: StorageMode,
    ) -> Result<StorageUrl> {
        match mode {
            StorageMode::Full => {
                let mut object_metadata = HashMap::new();
                object_metadata.insert("content-hash".to_string(), hash.to_string());
                self.object_store
                    .put_object(&self.config.bucket, key, data, mime_type, object_metadata)
                    .await
                    .map_err(|e| Error::StorageUnavailable {
                        operation: "store_resource".to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(StorageUrl::S3 {
                    bucket: self.config.bucket.clone(),
                    key: key.to_string(),
                })
            }
            StorageMode::Fallback | StorageMode::LocalOnly => {
                let path = self
                    .fallback
                    .save_resource(key, data)
                    .await
                    .map_err(|e| Error::StorageUnavailable {
                        operation: "store_resource".to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(StorageUrl::Fallback { path })
            }
        }
    }

    /// Process a list of uploads with bounded concurrency. One item's
    /// failure does not abort the batch; results keep input order.
    pub async fn process_resource_batch(
        &self,
        uploads: &[ResourceUpload],
        ctx: &StorageContext,
    ) -> Vec<Result<StorageUrl>> {
        stream::iter(uploads)
            .map(|upload| self.store_resource(upload, ctx))
            .buffered(self.config.batch_concurrency.max(1))
            .collect()
            .await
    }

    /// Drop one reference to a resource. At zero the blob is physically
    /// deleted and the record removed.
    ///
    /// Decrement is its own primitive; it never routes through the
    /// increment path.
    #[instrument(skip(self))]
    pub async fn delete_resource(&self, hash: &str) -> Result<()> {
        let record = self
            .metadata
            .find_resource_by_hash(hash)
            .await?
            .ok_or_else(|| Error::ResourceNotFound(hash.to_string()))?;

        let remaining = self.metadata.decrement_resource_refs(hash).await?;
        if remaining > 0 {
            debug!(hash, reference_count = remaining, "Resource still referenced");
            return Ok(());
        }

        // Orphaned blobs from a failed delete are reclaimed by a later GC
        // sweep; the record removal is what matters here.
        if let Err(e) = self.delete_blob(&record.storage_url).await {
            warn!(hash, url = %record.storage_url, "Failed to delete resource blob: {}", e);
        }

        self.metadata.delete_resource(hash).await?;
        debug!(hash, "Resource record removed");
        Ok(())
    }

    async fn delete_blob(&self, url: &StorageUrl) -> Result<()> {
        match url {
            StorageUrl::S3 { bucket, key } => self.object_store.delete_object(bucket, key).await,
            StorageUrl::Fallback { path } => self.fallback.delete_resource(path).await,
            // Nothing durable behind a local reference
            StorageUrl::Local { .. } => Ok(()),
        }
    }
}

impl std::fmt::Debug for ResourceDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDeduplicator")
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
    use crate::adapters::fallback::FsFallbackStore;
    use crate::adapters::memory::{
        InMemoryEventLog, InMemoryMetadataStore, InMemoryObjectStore,
    };
    use crate::detector::DetectorConfig;
    use crate::domain::ports::Scope;

    struct Fixture {
        dedup: ResourceDeduplicator,
        detector: Arc<ModeDetector>,
        metadata: Arc<InMemoryMetadataStore>,
        object_store: Arc<InMemoryObjectStore>,
        event_log: Arc<InMemoryEventLog>,
    }

    async fn fixture(mode: StorageMode) -> Fixture {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let event_log = Arc::new(InMemoryEventLog::new());
        let object_store = Arc::new(InMemoryObjectStore::new());
        object_store.put_bucket("cardstor");
        let fallback = Arc::new(FsFallbackStore::new_temp());

        let detector = Arc::new(ModeDetector::new(
            DetectorConfig::default(),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&event_log) as Arc<dyn EventLog>,
            Arc::clone(&object_store) as Arc<dyn ObjectStore>,
            Arc::clone(&fallback) as Arc<dyn FallbackStore>,
        ));
        detector.force_mode(mode, "test setup").await;

        let dedup = ResourceDeduplicator::new(
            DedupConfig::default(),
            Arc::clone(&detector),
            Arc::clone(&metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&event_log) as Arc<dyn EventLog>,
            Arc::clone(&object_store) as Arc<dyn ObjectStore>,
            fallback,
        );

        Fixture {
            dedup,
            detector,
            metadata,
            object_store,
            event_log,
        }
    }

    fn ctx() -> StorageContext {
        StorageContext::new(Scope::User("u1".to_string()), "p1", "Card A")
    }

    #[test]
    fn test_content_hash_is_stable_hex_sha256() {
        let hash = content_hash(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(content_hash(b"hello world"), hash);
        assert_ne!(content_hash(b"hello worlD"), hash);
    }

    #[test]
    fn test_decode_data_uri() {
        let upload = ResourceUpload::data_uri("logo.png", "data:image/png;base64,aGVsbG8=");
        let (data, mime) = decode_payload(&upload).unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn test_decode_rejects_malformed_data_uri() {
        for uri in [
            "image/png;base64,aGVsbG8=",
            "data:image/png;base64",
            "data:image/png,plaintext",
            "data:image/png;base64,!!!not-base64!!!",
        ] {
            let upload = ResourceUpload::data_uri("x", uri);
            assert!(decode_payload(&upload).is_err(), "{}", uri);
        }
    }

    #[test]
    fn test_resource_file_name_keeps_extension() {
        assert_eq!(resource_file_name("abc123", "logo.PNG"), "abc123.png");
        assert_eq!(resource_file_name("abc123", "noext"), "abc123");
        assert_eq!(resource_file_name("abc123", "weird.!@#"), "abc123");
    }

    #[test]
    fn test_legacy_layout_detection() {
        let legacy = StorageUrl::parse("s3://cards/resources/abc.png").unwrap();
        assert!(is_legacy_layout(&legacy));

        let scoped = StorageUrl::parse("s3://cards/templates/u1/p1/a/abc.png").unwrap();
        assert!(!is_legacy_layout(&scoped));

        let local = StorageUrl::parse("local://mem-1").unwrap();
        assert!(!is_legacy_layout(&local));
    }

    #[tokio::test]
    async fn test_store_new_resource_full_mode() {
        let f = fixture(StorageMode::Full).await;
        let upload = ResourceUpload::raw("logo.png", "image/png", Bytes::from_static(b"png-bytes"));

        let url = f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        assert_eq!(url.scheme(), "s3");
        assert!(url.key().starts_with("templates/u1/p1/Card-A/"));

        let hash = content_hash(b"png-bytes");
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 1);
        assert_eq!(record.storage_mode, StorageMode::Full);
        assert_eq!(f.object_store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_dedup_hit_writes_no_bytes_and_increments() {
        let f = fixture(StorageMode::Full).await;
        let upload = ResourceUpload::raw("logo.png", "image/png", Bytes::from_static(b"same"));

        let first = f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        let second = f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.object_store.object_count(), 1);

        let hash = content_hash(b"same");
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 2);
    }

    #[tokio::test]
    async fn test_store_routes_to_fallback_when_degraded() {
        let f = fixture(StorageMode::Fallback).await;
        let upload = ResourceUpload::raw("logo.png", "image/png", Bytes::from_static(b"bytes"));

        let url = f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        assert_eq!(url.scheme(), "fallback");
        assert_eq!(f.object_store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_context_fails_fast() {
        let f = fixture(StorageMode::Full).await;
        let upload = ResourceUpload::raw("x", "image/png", Bytes::from_static(b"b"));
        let bad_ctx = StorageContext::new(Scope::Global, "", "Card A");

        let err = f.dedup.store_resource(&upload, &bad_ctx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidContext(_)));
        assert_eq!(f.object_store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_resource_rejected() {
        let mut config = DedupConfig::default();
        config.max_resource_bytes = 8;
        let f = fixture(StorageMode::Full).await;
        let dedup = ResourceDeduplicator::new(
            config,
            Arc::clone(&f.detector),
            Arc::clone(&f.metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&f.event_log) as Arc<dyn EventLog>,
            Arc::clone(&f.object_store) as Arc<dyn ObjectStore>,
            Arc::new(FsFallbackStore::new_temp()),
        );

        let upload = ResourceUpload::raw("big.bin", "application/octet-stream", Bytes::from(vec![0u8; 9]));
        let err = dedup.store_resource(&upload, &ctx()).await.unwrap_err();
        assert!(matches!(err, Error::ResourceTooLarge { size: 9, limit: 8 }));
    }

    #[tokio::test]
    async fn test_legacy_record_migrated_on_hit() {
        let f = fixture(StorageMode::Full).await;
        let data = Bytes::from_static(b"legacy-bytes");
        let hash = content_hash(&data);

        let now = Utc::now();
        f.metadata
            .create_resource(&ResourceRecord {
                hash: hash.clone(),
                resource_id: Uuid::new_v4(),
                original_name: "old.png".to_string(),
                mime_type: "image/png".to_string(),
                size: data.len() as u64,
                storage_url: StorageUrl::parse(&format!("s3://cardstor/resources/{}.png", hash))
                    .unwrap(),
                storage_mode: StorageMode::Full,
                reference_count: 1,
                first_seen: now,
                last_accessed: now,
            })
            .await
            .unwrap();

        let upload = ResourceUpload::raw("old.png", "image/png", data);
        let url = f.dedup.store_resource(&upload, &ctx()).await.unwrap();

        assert!(url.key().starts_with("templates/u1/p1/Card-A/"));
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.storage_url, url);
        assert_eq!(record.reference_count, 2);
        // Content now lives under the scoped key
        assert_eq!(f.object_store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_event_log_only_record_is_not_healed() {
        let f = fixture(StorageMode::Full).await;
        let data = Bytes::from_static(b"orphan");
        let hash = content_hash(&data);

        let now = Utc::now();
        f.event_log.seed_resource(ResourceRecord {
            hash: hash.clone(),
            resource_id: Uuid::new_v4(),
            original_name: "orphan.png".to_string(),
            mime_type: "image/png".to_string(),
            size: data.len() as u64,
            storage_url: StorageUrl::parse("s3://cardstor/templates/u9/p9/t/orphan.png").unwrap(),
            storage_mode: StorageMode::Full,
            reference_count: 1,
            first_seen: now,
            last_accessed: now,
        });

        let upload = ResourceUpload::raw("orphan.png", "image/png", data);
        let url = f.dedup.store_resource(&upload, &ctx()).await.unwrap();

        // Treated as a miss: a fresh canonical record is created under the
        // caller's scope, the audit orphan is left as-is
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 1);
        assert_eq!(record.storage_url, url);
    }

    #[tokio::test]
    async fn test_delete_resource_with_shared_refs_decrements_only() {
        let f = fixture(StorageMode::Full).await;
        let upload = ResourceUpload::raw("shared.png", "image/png", Bytes::from_static(b"shared"));
        let hash = content_hash(b"shared");

        f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        f.dedup.store_resource(&upload, &ctx()).await.unwrap();

        f.dedup.delete_resource(&hash).await.unwrap();

        // Regression guard: decrement must not route through increment
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 1);
        assert_eq!(f.object_store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_last_reference_removes_blob_and_record() {
        let f = fixture(StorageMode::Full).await;
        let upload = ResourceUpload::raw("once.png", "image/png", Bytes::from_static(b"once"));
        let hash = content_hash(b"once");

        f.dedup.store_resource(&upload, &ctx()).await.unwrap();
        f.dedup.delete_resource(&hash).await.unwrap();

        assert!(f.metadata.find_resource_by_hash(&hash).await.unwrap().is_none());
        assert_eq!(f.object_store.object_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_resource_is_not_found() {
        let f = fixture(StorageMode::Full).await;
        let err = f.dedup.delete_resource("deadbeef").await.unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_batch_preserves_per_item_independence() {
        let f = fixture(StorageMode::Full).await;
        let mut config = DedupConfig::default();
        config.max_resource_bytes = 16;
        let dedup = ResourceDeduplicator::new(
            config,
            Arc::clone(&f.detector),
            Arc::clone(&f.metadata) as Arc<dyn MetadataStore>,
            Arc::clone(&f.event_log) as Arc<dyn EventLog>,
            Arc::clone(&f.object_store) as Arc<dyn ObjectStore>,
            Arc::new(FsFallbackStore::new_temp()),
        );

        let uploads = vec![
            ResourceUpload::raw("a.bin", "application/octet-stream", Bytes::from_static(b"a")),
            ResourceUpload::raw(
                "too-big.bin",
                "application/octet-stream",
                Bytes::from(vec![0u8; 32]),
            ),
            ResourceUpload::raw("c.bin", "application/octet-stream", Bytes::from_static(b"c")),
        ];

        let results = dedup.process_resource_batch(&uploads, &ctx()).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::ResourceTooLarge { .. })));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_identical_bytes_in_batch_share_one_blob() {
        let f = fixture(StorageMode::Full).await;
        let uploads: Vec<ResourceUpload> = (0..4)
            .map(|i| {
                ResourceUpload::raw(
                    format!("copy-{}.png", i),
                    "image/png",
                    Bytes::from_static(b"identical-bytes"),
                )
            })
            .collect();

        let results = f.dedup.process_resource_batch(&uploads, &ctx()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let hash = content_hash(b"identical-bytes");
        let record = f.metadata.find_resource_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(record.reference_count, 4);
        assert_eq!(f.object_store.object_count(), 1);
    }
}
