//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the port/adapter (hexagonal) architecture pattern:
//!
//! - [`s3`] - S3-compatible object store (SeaweedFS, MinIO, AWS)
//! - [`fallback`] - Local filesystem fallback store
//! - [`postgres`] - PostgreSQL metadata store (feature `postgres`)
//! - [`event_log`] - Tracing-backed and composite event logs
//! - [`memory`] - In-memory doubles with failure injection

pub mod event_log;
pub mod fallback;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod s3;

pub use event_log::{CompositeEventLog, TracingEventLog};
pub use fallback::FsFallbackStore;
pub use memory::{
    InMemoryEventLog, InMemoryFallbackStore, InMemoryMetadataStore, InMemoryObjectStore,
    InMemoryProjectService,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresMetadataStore;
pub use s3::{S3Config, S3ObjectStore};
