//! CardStor - Mode-Aware Storage Orchestration Engine
//!
//! Storage backbone for card/template generation platforms. Persists
//! templates and content-addressed binary resources across four
//! heterogeneous, independently-failing backends, decides at runtime which
//! combination is usable, and keeps metadata consistent despite partial
//! failures.
//!
//! # Architecture
//!
//! The engine follows a three-component "Eyes, Brain, Hands" pattern:
//!
//! ```text
//! Mode Detector (Eyes) → Storage Orchestrator (Brain) → Backend Adapters (Hands)
//!                              │
//!                        Resource Deduplicator
//! ```
//!
//! Backends: a relational metadata store, an append-only event/audit log,
//! an S3-compatible object store, and a local filesystem fallback. The
//! detector probes all four concurrently and selects one of three
//! operating modes (`Full`, `Fallback`, `LocalOnly`); the orchestrator
//! branches its save/load/delete semantics on that mode, favouring
//! availability over strict cross-store atomicity.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`dedup`] - Content-addressed resource deduplication
//! - [`detector`] - Backend health probing and mode selection
//! - [`domain`] - Domain layer with ports and event records (DDD)
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics integration
//! - [`orchestrator`] - Template-level storage API

pub mod adapters;
pub mod dedup;
pub mod detector;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod orchestrator;

// Re-export commonly used types
pub use dedup::{DedupConfig, ResourceDeduplicator, ResourcePayload, ResourceUpload};
pub use detector::{DetectorConfig, ModeDetectionResult, ModeDetector, ModeSubscriber};
pub use domain::ports::{StorageContext, StorageMode, StorageUrl};
pub use error::{Error, Result};
pub use orchestrator::{OrchestratorConfig, StorageOrchestrator, Template, TemplateInput};
