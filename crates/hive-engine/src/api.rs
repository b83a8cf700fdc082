//! Public API types for the in-process `imagehive` dispatch engine.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use imagehive_core::settings::DispatchSettings;

use crate::claim::SessionLedger;
use crate::dispatcher::Dispatcher;
use crate::driver::ImagePayload;
use crate::error::GenError;
use crate::hooks::HookRegistry;
use crate::record::{WorkerId, WorkerStatus};

/// Configuration for the in-process engine.
pub struct EngineConfig {
    /// Dispatch settings, usually loaded from the settings file.
    pub settings: DispatchSettings,

    /// Listener registry, wired before the engine starts.
    pub hooks: HookRegistry,

    /// Maximum number of completed outcomes retained in the snapshot.
    pub recent_outcomes_max: usize,

    /// How often the engine refreshes its status snapshot.
    pub snapshot_tick: Duration,
}

impl EngineConfig {
    /// Default size of the recent-outcomes ring buffer.
    pub const DEFAULT_RECENT_OUTCOMES_MAX: usize = 100;

    /// Default snapshot refresh tick.
    pub const DEFAULT_SNAPSHOT_TICK: Duration = Duration::from_millis(500);

    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            settings,
            hooks: HookRegistry::new(),
            recent_outcomes_max: Self::DEFAULT_RECENT_OUTCOMES_MAX,
            snapshot_tick: Self::DEFAULT_SNAPSHOT_TICK,
        }
    }
}

/// One image-generation request as received from a caller.
///
/// The dispatcher never interprets `params`; they ride along to the worker
/// untouched. `required_features` is the capability filter and
/// `preferred_model` only breaks ties between matching workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Opaque caller identity; authentication happens elsewhere.
    pub user_id: String,

    /// Model to prefer when several workers match. A worker already holding
    /// it wins; otherwise one is asked to load it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,

    /// Capability tags the serving worker must carry.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_features: BTreeSet<String>,

    /// Requested image count for this batch.
    #[serde(default = "default_images")]
    pub images: u32,

    /// Everything else, forwarded verbatim.
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_images() -> u32 {
    1
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            preferred_model: None,
            required_features: BTreeSet::new(),
            images: 1,
            params: serde_json::Map::new(),
        }
    }
}

/// Mid-request update streamed back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressUpdate {
    /// The request is queued behind other claims.
    WaitingForWorker,
    /// A matching worker was found but has to load the preferred model first.
    WillLoadModel { model: String },
    /// Opaque progress object from the worker.
    GenProgress { gen_progress: serde_json::Value },
    /// An image was accepted and saved.
    ImageSaved { index: u32 },
    /// Timing report, emitted once per finished request.
    Timing { message: String },
}

/// Per-request callbacks supplied by the caller's session.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Stream a progress update to the caller.
    async fn emit(&self, update: ProgressUpdate);

    /// Apply caller metadata to an accepted image. Returns the (possibly
    /// re-encoded) image and its metadata string.
    async fn apply_metadata(
        &self,
        image: ImagePayload,
        request: &GenerateRequest,
        index: u32,
    ) -> (ImagePayload, String);

    /// Durably store an accepted image.
    async fn save_image(&self, image: ImagePayload, metadata: String) -> Result<(), GenError>;

    /// Report a user-visible failure message.
    async fn set_error(&self, message: String);
}

/// Result of a completed request (saved images or failure).
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub batch_id: String,
    pub user_id: String,
    /// Images accepted and saved; refused images do not count.
    pub images_saved: u32,
    /// User-visible failure message, when the request failed.
    pub error: Option<String>,
    /// Time spent before the worker started generating (milliseconds).
    pub prep_ms: u64,
    /// Time spent generating (milliseconds).
    pub gen_ms: u64,
    /// Total request time (milliseconds).
    pub total_ms: u64,
    /// Unix timestamp of completion.
    pub finished_at: i64,
}

/// Engine event stream payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Engine started.
    Started,
    /// Graceful shutdown requested.
    StopRequested,
    /// A worker's status changed.
    WorkerStatusChanged {
        worker: WorkerId,
        status: WorkerStatus,
    },
    /// A request entered the pipeline.
    RequestStarted { batch_id: String, user_id: String },
    /// A request finished (success or failure).
    RequestFinished { outcome: GenerationOutcome },
    /// A warning from the engine.
    Warning { message: String },
    /// A non-fatal error from the engine.
    Error { message: String },
    /// Engine stopped.
    Stopped,
}

/// Snapshot of one worker for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub driver_type: String,
    pub status: WorkerStatus,
    pub is_real: bool,
    pub busy: bool,
    pub current_model: Option<String>,
    pub features: BTreeSet<String>,
    pub claims_served: u64,
    pub images_produced: u64,
}

/// Current engine state snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub stop_requested: bool,
    pub workers: Vec<WorkerView>,
    /// Recently completed requests (newest last).
    pub recent: Vec<GenerationOutcome>,
}

/// Handle to a running in-process engine instance.
pub struct EngineHandle {
    pub(crate) inner: std::sync::Arc<crate::engine::EngineInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a new in-process engine instance. Must be called from within a
/// tokio runtime.
pub fn start_engine(config: EngineConfig) -> anyhow::Result<EngineHandle> {
    crate::engine::start_engine(config)
}

impl EngineHandle {
    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest engine snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// The dispatcher, for pool mutation beyond the configured workers.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Run one generation request to completion, streaming through `sink`.
    pub async fn generate(
        &self,
        request: GenerateRequest,
        sink: std::sync::Arc<dyn OutputSink>,
    ) -> GenerationOutcome {
        self.inner.generate(request, sink).await
    }

    /// The claim ledger for one caller, created on first use.
    pub fn session(&self, user_id: &str) -> std::sync::Arc<SessionLedger> {
        self.inner.session(user_id)
    }

    /// Tear down one caller's session, cancelling its outstanding claims.
    pub fn close_session(&self, user_id: &str) {
        self.inner.close_session(user_id);
    }

    /// Request a graceful shutdown (cancel outstanding claims, stop drivers).
    /// Returns true when this call initiated the stop; false when a stop was
    /// already underway.
    pub fn request_stop(&self) -> bool {
        self.inner.request_stop()
    }

    /// A cheap clonable handle for requesting shutdown from other tasks,
    /// e.g. a signal watcher.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Wait for the engine to stop, returning the engine task result.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("engine task join error: {err}")),
        }
    }
}

/// Detached shutdown handle for a running engine.
///
/// The first `request_stop` asks for a graceful stop (outstanding claims are
/// cancelled, drivers shut down); repeat calls return false so the caller can
/// escalate, e.g. exit on a second interrupt instead of waiting out the drain.
#[derive(Clone)]
pub struct StopHandle {
    inner: std::sync::Arc<crate::engine::EngineInner>,
}

impl StopHandle {
    pub fn request_stop(&self) -> bool {
        self.inner.request_stop()
    }
}
