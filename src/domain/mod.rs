//! Domain Layer
//!
//! Core abstractions of the storage engine: backend ports (traits the
//! infrastructure adapters implement), value objects shared across
//! components, and the append-only event records written to the audit log.

pub mod events;
pub mod ports;

pub use events::{HealthSample, ModeTransition, TemplateEvent, TemplateEventKind, TransitionTrigger};
pub use ports::{
    EventLog, FallbackStore, MetadataStore, ObjectStore, ProjectService, ResourceRecord, Scope,
    StorageContext, StorageMode, StorageUrl, TemplateMetadata,
};
