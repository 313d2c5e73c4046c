//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the core abstractions (ports) that the storage
//! engine depends on. Infrastructure adapters implement these traits to
//! provide concrete backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Orchestration Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  MetadataStore │ ObjectStore │ FallbackStore │ ...  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  S3ObjectStore │ FsFallbackStore │ PostgresStore    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::events::{HealthSample, ModeTransition, TemplateEvent};
use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// The combination of healthy backends the system can currently sustain.
///
/// Priority order matters: `Full` requires metadata + event log + object
/// store; `Fallback` substitutes the local filesystem for the object store;
/// `LocalOnly` means essential stores are gone and only non-durable,
/// unverifiable operation remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Metadata store, event log and object store all healthy
    Full,
    /// Object store down; local filesystem substitutes for blob writes
    Fallback,
    /// Essential stores unavailable; no durability or ownership guarantees
    LocalOnly,
}

impl StorageMode {
    /// Numeric encoding for the atomic state holder.
    pub const fn as_u8(self) -> u8 {
        match self {
            StorageMode::Full => 0,
            StorageMode::Fallback => 1,
            StorageMode::LocalOnly => 2,
        }
    }

    /// Decode from the atomic state holder. Unknown values degrade to
    /// `LocalOnly` rather than panic.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => StorageMode::Full,
            1 => StorageMode::Fallback,
            _ => StorageMode::LocalOnly,
        }
    }

    /// True when the metadata store is reachable in this mode.
    pub const fn metadata_available(self) -> bool {
        matches!(self, StorageMode::Full | StorageMode::Fallback)
    }

    /// True when operating degraded (fallback or local-only).
    pub const fn is_degraded(self) -> bool {
        !matches!(self, StorageMode::Full)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Full => write!(f, "full"),
            StorageMode::Fallback => write!(f, "fallback"),
            StorageMode::LocalOnly => write!(f, "local_only"),
        }
    }
}

impl std::str::FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(StorageMode::Full),
            "fallback" => Ok(StorageMode::Fallback),
            "local_only" => Ok(StorageMode::LocalOnly),
            other => Err(Error::Internal(format!("unknown storage mode: {}", other))),
        }
    }
}

/// Ownership scope for stored objects.
///
/// Replaces the magic `"GLOBAL"` partition sentinel: a missing owner is a
/// first-class variant, never a literal that leaks into storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Shared/global assets with no owning user
    Global,
    /// Assets owned by a specific user
    User(String),
}

impl Scope {
    /// Path segment used when building storage keys.
    pub fn storage_segment(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::User(id) => sanitize_segment(id),
        }
    }

    /// The owner id, if any.
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::User(id) => Some(id),
        }
    }
}

impl From<Option<String>> for Scope {
    fn from(owner: Option<String>) -> Self {
        match owner {
            Some(id) if !id.is_empty() => Scope::User(id),
            _ => Scope::Global,
        }
    }
}

/// Sanitize an identifier for use as a storage path segment.
///
/// Owner ids are frequently email addresses; anything outside
/// `[A-Za-z0-9._-]` becomes `-` so keys stay portable across the object
/// store and the filesystem fallback.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    // Dot-only segments would alias `.`/`..` in path-based backends
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// A backend-tagged storage location, encoded as a URI-like string.
///
/// The scheme determines which adapter handles subsequent load/delete:
/// `s3://bucket/key`, `fallback://<path>`, `local://<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageUrl {
    /// Object-store blob, bucket/key addressed
    S3 { bucket: String, key: String },
    /// Filesystem fallback path, relative to the fallback root
    Fallback { path: String },
    /// In-memory / non-durable reference
    Local { id: String },
}

impl StorageUrl {
    /// Parse a URL string into its typed form.
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| Error::InvalidUrl(raw.to_string()))?;
            if bucket.is_empty() || key.is_empty() {
                return Err(Error::InvalidUrl(raw.to_string()));
            }
            Ok(StorageUrl::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        } else if let Some(path) = raw.strip_prefix("fallback://") {
            if path.is_empty() {
                return Err(Error::InvalidUrl(raw.to_string()));
            }
            Ok(StorageUrl::Fallback {
                path: path.to_string(),
            })
        } else if let Some(id) = raw.strip_prefix("local://") {
            if id.is_empty() {
                return Err(Error::InvalidUrl(raw.to_string()));
            }
            Ok(StorageUrl::Local { id: id.to_string() })
        } else {
            Err(Error::InvalidUrl(raw.to_string()))
        }
    }

    /// The URL scheme (`s3`, `fallback`, `local`).
    pub fn scheme(&self) -> &'static str {
        match self {
            StorageUrl::S3 { .. } => "s3",
            StorageUrl::Fallback { .. } => "fallback",
            StorageUrl::Local { .. } => "local",
        }
    }

    /// The object key or path component, without the scheme.
    pub fn key(&self) -> &str {
        match self {
            StorageUrl::S3 { key, .. } => key,
            StorageUrl::Fallback { path } => path,
            StorageUrl::Local { id } => id,
        }
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUrl::S3 { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
            StorageUrl::Fallback { path } => write!(f, "fallback://{}", path),
            StorageUrl::Local { id } => write!(f, "local://{}", id),
        }
    }
}

impl Serialize for StorageUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorageUrl {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        StorageUrl::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Required scoping for resource writes.
///
/// Unscoped storage cannot be organised or garbage-collected later, so
/// every resource write names its owner, project and template up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageContext {
    pub scope: Scope,
    pub project_id: String,
    pub template_name: String,
}

impl StorageContext {
    pub fn new(scope: Scope, project_id: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self {
            scope,
            project_id: project_id.into(),
            template_name: template_name.into(),
        }
    }

    /// Validate that all scoping fields are present and non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::InvalidContext(
                "project id is required for resource storage".to_string(),
            ));
        }
        if self.template_name.trim().is_empty() {
            return Err(Error::InvalidContext(
                "template name is required for resource storage".to_string(),
            ));
        }
        Ok(())
    }

    /// Scoped key prefix shared by the object store and the fallback store:
    /// `templates/<owner>/<project>/<template>`.
    pub fn key_prefix(&self) -> String {
        format!(
            "templates/{}/{}/{}",
            self.scope.storage_segment(),
            sanitize_segment(&self.project_id),
            sanitize_segment(&self.template_name)
        )
    }
}

// =============================================================================
// Records
// =============================================================================

/// Canonical metadata row for a stored template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub id: Uuid,
    pub owner_id: String,
    pub project_id: String,
    pub name: String,
    /// Strictly increasing, starts at 1 on first save
    pub version: u32,
    pub storage_url: StorageUrl,
    pub storage_mode: StorageMode,
    pub element_count: usize,
    pub resource_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Content-addressed record for a deduplicated binary resource.
///
/// `reference_count` tracks the number of live templates referencing this
/// hash; a record at zero is eligible for physical deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// SHA-256 of the content, hex encoded; primary key
    pub hash: String,
    pub resource_id: Uuid,
    pub original_name: String,
    pub mime_type: String,
    pub size: u64,
    pub storage_url: StorageUrl,
    pub storage_mode: StorageMode,
    pub reference_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

// =============================================================================
// Metadata Store Port
// =============================================================================

/// Port for the relational metadata store.
///
/// Owns template/project/resource records, versioning and reference-count
/// fields. Queried on every hot-path operation, so implementations should
/// be pooled.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Trivial liveness query.
    async fn ping(&self) -> Result<()>;

    /// Insert or update a template row.
    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<()>;

    /// Fetch a template by id.
    async fn get_template(&self, template_id: Uuid) -> Result<Option<TemplateMetadata>>;

    /// Fetch a template by its (owner, project, name) triple.
    async fn find_template(
        &self,
        owner_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<TemplateMetadata>>;

    /// List all templates owned by the given user.
    async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateMetadata>>;

    /// Delete a template row.
    async fn delete_template(&self, template_id: Uuid) -> Result<()>;

    /// Look up a resource record by content hash.
    async fn find_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>>;

    /// Create a new resource record.
    async fn create_resource(&self, record: &ResourceRecord) -> Result<()>;

    /// Rewrite a resource's storage URL and mode (legacy-path migration).
    async fn update_resource_url(
        &self,
        hash: &str,
        url: &StorageUrl,
        mode: StorageMode,
    ) -> Result<()>;

    /// Atomically increment a resource's reference count, returning the new
    /// count. Also refreshes `last_accessed`.
    async fn increment_resource_refs(&self, hash: &str) -> Result<u64>;

    /// Atomically decrement a resource's reference count, returning the new
    /// count. Saturates at zero. Distinct from the increment primitive.
    async fn decrement_resource_refs(&self, hash: &str) -> Result<u64>;

    /// Remove a resource record entirely.
    async fn delete_resource(&self, hash: &str) -> Result<()>;
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for the S3-compatible object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether a bucket exists; also the health probe, so latency is
    /// measured around this call.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create a bucket (idempotent).
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Write an object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    /// Read an object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Delete an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// List object keys under a prefix.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

// =============================================================================
// Fallback Store Port
// =============================================================================

/// Port for the local filesystem fallback store.
///
/// Substitutes for the object store when it is unreachable. Keys follow the
/// same scoped layout; returned paths are relative to the fallback root and
/// round-trip through `fallback://` URLs.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    /// Write template JSON under the scoped key, returning the stored path.
    async fn save_template(&self, key: &str, data: Bytes) -> Result<String>;

    /// Read template JSON from a stored path.
    async fn load_template(&self, path: &str) -> Result<Bytes>;

    /// Delete a stored template blob.
    async fn delete_template(&self, path: &str) -> Result<()>;

    /// Write a resource blob under the scoped key, returning the stored path.
    async fn save_resource(&self, key: &str, data: Bytes) -> Result<String>;

    /// Read a resource blob from a stored path.
    async fn load_resource(&self, path: &str) -> Result<Bytes>;

    /// Delete a stored resource blob.
    async fn delete_resource(&self, path: &str) -> Result<()>;

    /// Probe that the fallback root is writable.
    async fn check_writable(&self) -> Result<()>;

    /// Best-effort free space measurement; `None` when unsupported.
    async fn free_space_bytes(&self) -> Option<u64>;
}

// =============================================================================
// Event Log Port
// =============================================================================

/// Port for the append-only wide-column event/audit store.
///
/// Every write through this port is best-effort from the caller's point of
/// view: failures are logged and swallowed, never propagated into the
/// primary operation.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Lightweight liveness read.
    async fn ping(&self) -> Result<()>;

    /// Append a mode transition record.
    async fn log_mode_transition(&self, transition: &ModeTransition) -> Result<()>;

    /// Append one health sample per probed backend.
    async fn log_storage_health(&self, samples: &[HealthSample]) -> Result<()>;

    /// Append a template lifecycle event.
    async fn log_template_event(&self, event: &TemplateEvent) -> Result<()>;

    /// Append an audit copy of a resource record.
    async fn save_resource_metadata(&self, record: &ResourceRecord) -> Result<()>;

    /// Look up the audit copy of a resource record by hash.
    async fn get_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>>;

    /// Bump the audit-side reference counter for a resource.
    async fn increment_resource_reference(&self, hash: &str) -> Result<()>;
}

// =============================================================================
// Project Service Port
// =============================================================================

/// Port for the external project service collaborator.
///
/// Resolves (or lazily creates) the project a template belongs to. The
/// project service itself is outside this crate.
#[async_trait]
pub trait ProjectService: Send + Sync {
    /// Resolve the target project for an owner, creating a default project
    /// when no hint is given and none exists.
    async fn resolve_project(&self, owner_id: &str, hint: Option<&str>) -> Result<String>;
}

// =============================================================================
// Tests
// =============================================================================
