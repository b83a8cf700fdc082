//! Per-worker state: status, current model, busy flag, statistics.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
// Inactivity tracking follows the runtime clock, not the OS clock.
use tokio::time::Instant;

/// Stable opaque worker identifier, unique within this process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        WorkerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Disabled,
    Waiting,
    Loading,
    Idle,
    Running,
    Errored,
}

impl WorkerStatus {
    /// The permitted transition table. Anything not listed here is a bug in
    /// the caller and is rejected.
    fn can_transition(self, to: WorkerStatus) -> bool {
        use WorkerStatus::*;
        if self == to || to == Disabled {
            return true;
        }
        matches!(
            (self, to),
            (Disabled, Waiting)
                | (Waiting, Loading)
                | (Loading, Running)
                | (Loading, Idle)
                | (Loading, Errored)
                | (Running, Idle)
                | (Idle, Running)
                | (Running, Errored)
                | (Errored, Waiting)
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Disabled => "disabled",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Loading => "loading",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Running => "running",
            WorkerStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid worker status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

#[derive(Debug)]
struct RecordState {
    status: WorkerStatus,
    current_model: Option<String>,
    features: BTreeSet<String>,
}

/// Per-worker record. Mutated by the dispatcher and the owning driver
/// (status), and by acquire/release (busy flag).
pub struct WorkerRecord {
    id: WorkerId,
    driver_type: &'static str,
    is_real: bool,
    settings: serde_json::Value,
    state: Mutex<RecordState>,
    busy: AtomicBool,
    claims_served: AtomicU64,
    images_produced: AtomicU64,
    last_activity: Mutex<Instant>,
    changed: Arc<Notify>,
}

impl WorkerRecord {
    pub(crate) fn new(
        driver_type: &'static str,
        settings: serde_json::Value,
        is_real: bool,
        changed: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: WorkerId::next(),
            driver_type,
            is_real,
            settings,
            state: Mutex::new(RecordState {
                status: WorkerStatus::Disabled,
                current_model: None,
                features: BTreeSet::new(),
            }),
            busy: AtomicBool::new(false),
            claims_served: AtomicU64::new(0),
            images_produced: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            changed,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn driver_type(&self) -> &'static str {
        self.driver_type
    }

    /// False for shadow records synthesized by a federation driver.
    pub fn is_real(&self) -> bool {
        self.is_real
    }

    pub fn settings(&self) -> &serde_json::Value {
        &self.settings
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().expect("record state poisoned").status
    }

    /// Transition the status, waking every blocked acquire so it re-scans.
    pub fn set_status(&self, to: WorkerStatus) -> Result<WorkerStatus, InvalidTransition> {
        let prev = {
            let mut state = self.state.lock().expect("record state poisoned");
            if !state.status.can_transition(to) {
                return Err(InvalidTransition {
                    from: state.status,
                    to,
                });
            }
            std::mem::replace(&mut state.status, to)
        };
        self.changed.notify_waiters();
        Ok(prev)
    }

    /// Status write that skips the broadcast. Used by grouped shadow flips
    /// where the pool lock is held and a single broadcast follows.
    pub(crate) fn set_status_quiet(&self, to: WorkerStatus) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock().expect("record state poisoned");
        if !state.status.can_transition(to) {
            return Err(InvalidTransition {
                from: state.status,
                to,
            });
        }
        state.status = to;
        Ok(())
    }

    pub fn current_model(&self) -> Option<String> {
        self.state
            .lock()
            .expect("record state poisoned")
            .current_model
            .clone()
    }

    pub fn set_current_model(&self, model: Option<String>) {
        self.state.lock().expect("record state poisoned").current_model = model;
    }

    pub fn features(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("record state poisoned")
            .features
            .clone()
    }

    pub fn set_features(&self, features: BTreeSet<String>) {
        self.state.lock().expect("record state poisoned").features = features;
    }

    pub fn has_feature(&self, tag: &str) -> bool {
        self.state
            .lock()
            .expect("record state poisoned")
            .features
            .contains(tag)
    }

    /// Single compare-and-swap on the busy flag. The caller must have seen
    /// `Running` in the same snapshot and re-verifies it after a win.
    pub(crate) fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_busy(&self) {
        self.busy.store(false, Ordering::Release);
        self.changed.notify_waiters();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("record state poisoned") = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("record state poisoned")
    }

    pub(crate) fn note_claim_served(&self) {
        self.claims_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_image_produced(&self) {
        self.images_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claims_served(&self) -> u64 {
        self.claims_served.load(Ordering::Relaxed)
    }

    pub fn images_produced(&self) -> u64 {
        self.images_produced.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("driver_type", &self.driver_type)
            .field("is_real", &self.is_real)
            .field("status", &self.status())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::{WorkerRecord, WorkerStatus};

    fn record() -> Arc<WorkerRecord> {
        WorkerRecord::new("test", serde_json::Value::Null, true, Arc::new(Notify::new()))
    }

    #[test]
    fn lifecycle_transitions_follow_the_table() {
        let r = record();
        assert_eq!(r.status(), WorkerStatus::Disabled);
        r.set_status(WorkerStatus::Waiting).unwrap();
        r.set_status(WorkerStatus::Loading).unwrap();
        r.set_status(WorkerStatus::Running).unwrap();
        r.set_status(WorkerStatus::Idle).unwrap();
        r.set_status(WorkerStatus::Running).unwrap();
        r.set_status(WorkerStatus::Errored).unwrap();
        r.set_status(WorkerStatus::Waiting).unwrap();
        // Shutdown is reachable from any state.
        r.set_status(WorkerStatus::Disabled).unwrap();
    }

    #[test]
    fn forbidden_transitions_are_rejected() {
        let r = record();
        assert!(r.set_status(WorkerStatus::Running).is_err());
        r.set_status(WorkerStatus::Waiting).unwrap();
        assert!(r.set_status(WorkerStatus::Idle).is_err());
        r.set_status(WorkerStatus::Loading).unwrap();
        r.set_status(WorkerStatus::Errored).unwrap();
        assert!(r.set_status(WorkerStatus::Running).is_err());
    }

    #[test]
    fn busy_flag_is_single_winner() {
        let r = record();
        assert!(r.try_acquire());
        assert!(!r.try_acquire());
        r.release_busy();
        assert!(r.try_acquire());
    }

    #[test]
    fn features_snapshot_round_trips() {
        let r = record();
        let mut tags = BTreeSet::new();
        tags.insert("sdxl".to_string());
        tags.insert("controlnet".to_string());
        r.set_features(tags.clone());
        assert!(r.has_feature("sdxl"));
        assert!(!r.has_feature("video"));
        assert_eq!(r.features(), tags);
    }
}
