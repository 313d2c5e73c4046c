//! Mode Detector - "The Eyes"
//!
//! Continuously probes the four storage backends and computes the
//! `StorageMode` the system can currently sustain. Request processing never
//! blocks on a probe for longer than the configured timeout: every probe is
//! raced against a deadline and a backend that never answers is simply
//! counted as unavailable.
//!
//! # Decision Rule
//!
//! Evaluated in priority order once all four probes settle:
//!
//! ```text
//! metadata ∧ event-log ∧ object-store   → Full
//! metadata ∧ event-log ∧ fallback-store → Fallback
//! otherwise                             → LocalOnly
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::domain::events::{HealthSample, ModeTransition};
use crate::domain::ports::{EventLog, FallbackStore, MetadataStore, ObjectStore, StorageMode};
use crate::error::Result;
use crate::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the mode detector
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Deadline applied to each individual backend probe
    pub probe_timeout: Duration,

    /// Interval between periodic probe cycles
    pub probe_interval: Duration,

    /// Bucket whose existence the object-store probe checks
    pub bucket: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            bucket: "cardstor".to_string(),
        }
    }
}

// =============================================================================
// Detection Result
// =============================================================================

/// Outcome of a single `detect_mode` cycle.
#[derive(Debug, Clone)]
pub struct ModeDetectionResult {
    /// The mode now in effect
    pub mode: StorageMode,
    /// Whether this cycle changed the held mode
    pub changed: bool,
    /// One sample per probed backend
    pub samples: Vec<HealthSample>,
    /// The transition record, when the mode changed
    pub transition: Option<ModeTransition>,
}

// =============================================================================
// Subscribers
// =============================================================================

/// Observer notified after every mode transition.
///
/// Notification happens synchronously, in registration order, after the
/// transition has been logged. A subscriber error is caught and logged,
/// never propagated into the detection cycle.
#[async_trait]
pub trait ModeSubscriber: Send + Sync {
    /// Human-readable name used when logging subscriber failures.
    fn name(&self) -> &str;

    /// Called once per transition.
    async fn on_mode_change(&self, transition: &ModeTransition) -> Result<()>;
}

// =============================================================================
// Mode Detector
// =============================================================================

/// Probes backend health and holds the process-wide current mode.
///
/// `current_mode()` is a lock-free last-known-value read; staleness of up
/// to one probe interval is acceptable by design. The only writers are
/// `detect_mode` and `force_mode`.
pub struct ModeDetector {
    config: DetectorConfig,
    metadata: Arc<dyn MetadataStore>,
    event_log: Arc<dyn EventLog>,
    object_store: Arc<dyn ObjectStore>,
    fallback: Arc<dyn FallbackStore>,
    /// Encoded `StorageMode`; starts conservatively at `LocalOnly` until the
    /// first probe cycle settles
    current: AtomicU8,
    subscribers: RwLock<Vec<Arc<dyn ModeSubscriber>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stop_signal: Arc<Notify>,
}

impl ModeDetector {
    pub fn new(
        config: DetectorConfig,
        metadata: Arc<dyn MetadataStore>,
        event_log: Arc<dyn EventLog>,
        object_store: Arc<dyn ObjectStore>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Self {
        Self {
            config,
            metadata,
            event_log,
            object_store,
            fallback,
            current: AtomicU8::new(StorageMode::LocalOnly.as_u8()),
            subscribers: RwLock::new(Vec::new()),
            monitor: Mutex::new(None),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    /// Last computed mode, without re-probing. Cheap; for hot-path checks.
    pub fn current_mode(&self) -> StorageMode {
        StorageMode::from_u8(self.current.load(Ordering::Relaxed))
    }

    /// Register a mode-change subscriber. Subscribers are notified in
    /// registration order.
    pub fn subscribe(&self, subscriber: Arc<dyn ModeSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    // =========================================================================
    // Probes
    // =========================================================================

    async fn probe_metadata(&self) -> HealthSample {
        let started = Instant::now();
        match timeout(self.config.probe_timeout, self.metadata.ping()).await {
            Ok(Ok(())) => HealthSample::available("metadata-store")
                .with_latency(started.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                debug!("Metadata store probe failed: {}", e);
                HealthSample::unavailable("metadata-store")
            }
            Err(_) => {
                debug!("Metadata store probe timed out");
                HealthSample::unavailable("metadata-store")
            }
        }
    }

    async fn probe_event_log(&self) -> HealthSample {
        let started = Instant::now();
        match timeout(self.config.probe_timeout, self.event_log.ping()).await {
            Ok(Ok(())) => HealthSample::available("event-log")
                .with_latency(started.elapsed().as_millis() as u64),
            Ok(Err(e)) => {
                debug!("Event log probe failed: {}", e);
                HealthSample::unavailable("event-log")
            }
            Err(_) => {
                debug!("Event log probe timed out");
                HealthSample::unavailable("event-log")
            }
        }
    }

    async fn probe_object_store(&self) -> HealthSample {
        let started = Instant::now();
        match timeout(
            self.config.probe_timeout,
            self.object_store.bucket_exists(&self.config.bucket),
        )
        .await
        {
            Ok(Ok(true)) => HealthSample::available("object-store")
                .with_latency(started.elapsed().as_millis() as u64),
            Ok(Ok(false)) => {
                // A reachable endpoint without the bucket still serves reads
                // of nothing; treat it as down until the bucket exists.
                debug!("Object store bucket '{}' missing", self.config.bucket);
                HealthSample::unavailable("object-store")
            }
            Ok(Err(e)) => {
                debug!("Object store probe failed: {}", e);
                HealthSample::unavailable("object-store")
            }
            Err(_) => {
                debug!("Object store probe timed out");
                HealthSample::unavailable("object-store")
            }
        }
    }

    async fn probe_fallback(&self) -> HealthSample {
        match timeout(self.config.probe_timeout, self.fallback.check_writable()).await {
            Ok(Ok(())) => {
                let free = self.fallback.free_space_bytes().await;
                HealthSample::available("fallback-store").with_free_space(free)
            }
            Ok(Err(e)) => {
                debug!("Fallback store probe failed: {}", e);
                HealthSample::unavailable("fallback-store")
            }
            Err(_) => {
                debug!("Fallback store probe timed out");
                HealthSample::unavailable("fallback-store")
            }
        }
    }

    // =========================================================================
    // Detection
    // =========================================================================

    /// Run one full probe cycle and recompute the mode.
    ///
    /// Probe failures never raise; they degrade the decision. Event-log
    /// writes are best-effort.
    #[instrument(skip(self))]
    pub async fn detect_mode(&self) -> ModeDetectionResult {
        let (metadata, event_log, object_store, fallback) = tokio::join!(
            self.probe_metadata(),
            self.probe_event_log(),
            self.probe_object_store(),
            self.probe_fallback()
        );

        let mode = Self::decide(
            metadata.available,
            event_log.available,
            object_store.available,
            fallback.available,
        );

        let samples = vec![metadata, event_log, object_store, fallback];
        for sample in &samples {
            metrics::record_probe(&sample.backend, sample.available);
        }

        // Health samples are observability data; a dead event log must not
        // fail the cycle that is reporting the event log dead.
        if let Err(e) = self.event_log.log_storage_health(&samples).await {
            debug!("Failed to record health samples: {}", e);
        }

        let previous = self.current_mode();
        let changed = mode != previous;
        let transition = if changed {
            let reason = Self::describe_probes(&samples);
            let transition = ModeTransition::auto(previous, mode, reason);
            self.apply_transition(&transition).await;
            Some(transition)
        } else {
            None
        };

        metrics::set_mode(mode);

        ModeDetectionResult {
            mode,
            changed,
            samples,
            transition,
        }
    }

    /// Operator escape hatch: set the mode directly, bypassing probes.
    /// Used for testing and ops, never by normal request flow.
    pub async fn force_mode(&self, mode: StorageMode, reason: impl Into<String>) {
        let previous = self.current_mode();
        if previous == mode {
            return;
        }
        let transition = ModeTransition::manual(previous, mode, reason);
        warn!(
            from = %previous,
            to = %mode,
            "Storage mode forced manually"
        );
        self.apply_transition(&transition).await;
        metrics::set_mode(mode);
    }

    /// The priority decision rule.
    fn decide(metadata: bool, event_log: bool, object_store: bool, fallback: bool) -> StorageMode {
        if metadata && event_log && object_store {
            StorageMode::Full
        } else if metadata && event_log && fallback {
            StorageMode::Fallback
        } else {
            StorageMode::LocalOnly
        }
    }

    fn describe_probes(samples: &[HealthSample]) -> String {
        let parts: Vec<String> = samples
            .iter()
            .map(|s| {
                format!(
                    "{}={}",
                    s.backend,
                    if s.available { "up" } else { "down" }
                )
            })
            .collect();
        format!("probes: {}", parts.join(" "))
    }

    /// Store the new mode, log the transition, notify subscribers in order.
    async fn apply_transition(&self, transition: &ModeTransition) {
        self.current
            .store(transition.to_mode.as_u8(), Ordering::Relaxed);

        info!(
            from = %transition.from_mode,
            to = %transition.to_mode,
            trigger = %transition.trigger,
            reason = %transition.reason,
            "Storage mode transition"
        );
        metrics::record_transition(transition.trigger);

        // Transition logging failures are swallowed, not retried.
        if let Err(e) = self.event_log.log_mode_transition(transition).await {
            warn!("Failed to log mode transition: {}", e);
        }

        let subscribers: Vec<Arc<dyn ModeSubscriber>> = self.subscribers.read().clone();
        for subscriber in subscribers {
            if let Err(e) = subscriber.on_mode_change(transition).await {
                warn!(
                    subscriber = subscriber.name(),
                    "Mode-change subscriber failed: {}", e
                );
            }
        }
    }

    // =========================================================================
    // Periodic Monitoring
    // =========================================================================

    /// Start the background probe loop: one eager cycle at startup, then
    /// one per `probe_interval`. A second start is a no-op.
    pub fn start_monitoring(self: Arc<Self>) {
        let mut guard = self.monitor.lock();
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                debug!("Mode monitoring already running");
                return;
            }
        }

        let detector = Arc::clone(&self);
        let stop = Arc::clone(&self.stop_signal);
        let probe_interval = self.config.probe_interval;

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = probe_interval.as_secs(),
                "Starting mode monitoring"
            );
            let mut tick = interval(probe_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    // First tick fires immediately: the eager startup probe.
                    _ = tick.tick() => {
                        let result = detector.detect_mode().await;
                        debug!(mode = %result.mode, changed = result.changed, "Probe cycle complete");
                    }
                    _ = stop.notified() => {
                        info!("Mode monitoring stopped");
                        break;
                    }
                }
            }
        });

        *guard = Some(handle);
    }

    /// Stop the background loop. In-flight probes are not forcibly
    /// cancelled; only the scheduling of future cycles stops. Idempotent.
    pub fn stop_monitoring(&self) {
        let mut guard = self.monitor.lock();
        if let Some(handle) = guard.take() {
            if !handle.is_finished() {
                self.stop_signal.notify_one();
            }
        }
    }
}

impl std::fmt::Debug for ModeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeDetector")
            .field("config", &self.config)
            .field("current_mode", &self.current_mode())
            .field("subscriber_count", &self.subscribers.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
