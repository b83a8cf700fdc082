//! Scripted driver and small fixtures shared across the engine's tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{GenerateRequest, OutputSink, ProgressUpdate};
use crate::driver::{GenerateItem, ImagePayload, StreamEnd, WorkerDriver};
use crate::error::GenError;
use crate::record::{WorkerRecord, WorkerStatus};

/// Collects everything the pipeline reports for later assertions.
#[derive(Default)]
pub(crate) struct TestSink {
    updates: Mutex<Vec<ProgressUpdate>>,
    saved: Mutex<Vec<(ImagePayload, String)>>,
    errors: Mutex<Vec<String>>,
}

impl TestSink {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().expect("updates poisoned").clone()
    }

    pub(crate) fn saved_images(&self) -> Vec<(ImagePayload, String)> {
        self.saved.lock().expect("saved poisoned").clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("errors poisoned").clone()
    }
}

#[async_trait]
impl OutputSink for TestSink {
    async fn emit(&self, update: ProgressUpdate) {
        self.updates.lock().expect("updates poisoned").push(update);
    }

    async fn apply_metadata(
        &self,
        image: ImagePayload,
        _request: &GenerateRequest,
        index: u32,
    ) -> (ImagePayload, String) {
        (image, format!("meta:{index}"))
    }

    async fn save_image(&self, image: ImagePayload, metadata: String) -> Result<(), GenError> {
        self.saved
            .lock()
            .expect("saved poisoned")
            .push((image, metadata));
        Ok(())
    }

    async fn set_error(&self, message: String) {
        self.errors.lock().expect("errors poisoned").push(message);
    }
}

pub(crate) fn png_image() -> ImagePayload {
    ImagePayload {
        data: vec![0x89, 0x50, 0x4e, 0x47],
        mime: "image/png".to_string(),
    }
}

/// How one scripted generation run ends.
pub(crate) enum ScriptEnd {
    Complete,
    Redirect,
    /// Never emit the terminal end; only the cancel token gets out.
    Hang,
    Error(String),
}

pub(crate) struct ScriptedRun {
    pub(crate) items: Vec<GenerateItem>,
    pub(crate) end: ScriptEnd,
    pub(crate) delay: Option<Duration>,
}

impl ScriptedRun {
    pub(crate) fn one_image() -> Self {
        Self {
            items: vec![
                GenerateItem::Progress(serde_json::json!({"percent": 50})),
                GenerateItem::Image(png_image()),
            ],
            end: ScriptEnd::Complete,
            delay: None,
        }
    }

    pub(crate) fn redirect() -> Self {
        Self {
            items: Vec::new(),
            end: ScriptEnd::Redirect,
            delay: None,
        }
    }
}

/// In-process driver whose init/load/generate behavior is scripted per test.
pub(crate) struct ScriptedDriver {
    features: BTreeSet<String>,
    init_failures: AtomicU32,
    init_calls: AtomicU32,
    load_calls: Mutex<Vec<String>>,
    load_result: bool,
    runs: Mutex<VecDeque<ScriptedRun>>,
    generate_calls: AtomicU32,
}

impl ScriptedDriver {
    pub(crate) fn with_features<I, S>(features: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            features: features.into_iter().map(Into::into).collect(),
            init_failures: AtomicU32::new(0),
            init_calls: AtomicU32::new(0),
            load_calls: Mutex::new(Vec::new()),
            load_result: true,
            runs: Mutex::new(VecDeque::new()),
            generate_calls: AtomicU32::new(0),
        })
    }

    /// Fail the next `n` init attempts with a connection error.
    pub(crate) fn fail_inits(&self, n: u32) {
        self.init_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn script(&self, run: ScriptedRun) {
        self.runs.lock().expect("runs poisoned").push_back(run);
    }

    pub(crate) fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn generate_calls(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn load_calls(&self) -> Vec<String> {
        self.load_calls.lock().expect("load calls poisoned").clone()
    }
}

#[async_trait]
impl WorkerDriver for ScriptedDriver {
    fn driver_type(&self) -> &'static str {
        "scripted"
    }

    async fn init(&self, record: &Arc<WorkerRecord>) -> Result<(), GenError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let _ = record.set_status(WorkerStatus::Loading);
        let remaining = self.init_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.init_failures.store(remaining - 1, Ordering::SeqCst);
            let _ = record.set_status(WorkerStatus::Errored);
            return Err(GenError::Connection("scripted init failure".to_string()));
        }
        record.set_features(self.features.clone());
        let _ = record.set_status(WorkerStatus::Running);
        Ok(())
    }

    async fn shutdown(&self, record: &Arc<WorkerRecord>) {
        let _ = record.set_status(WorkerStatus::Disabled);
    }

    async fn load_model(
        &self,
        _record: &Arc<WorkerRecord>,
        model: &str,
    ) -> Result<bool, GenError> {
        self.load_calls
            .lock()
            .expect("load calls poisoned")
            .push(model.to_string());
        Ok(self.load_result)
    }

    async fn generate_stream(
        &self,
        _record: &Arc<WorkerRecord>,
        _request: &GenerateRequest,
        _batch_id: &str,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, GenError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let run = self
            .runs
            .lock()
            .expect("runs poisoned")
            .pop_front()
            .unwrap_or_else(ScriptedRun::one_image);

        if let Some(delay) = run.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(GenError::Cancelled),
            }
        }
        for item in run.items {
            if sink.send(item).await.is_err() {
                return Err(GenError::Cancelled);
            }
        }
        match run.end {
            ScriptEnd::Complete => Ok(StreamEnd::Complete),
            ScriptEnd::Redirect => Ok(StreamEnd::Redirect),
            ScriptEnd::Hang => {
                cancel.cancelled().await;
                Err(GenError::Cancelled)
            }
            ScriptEnd::Error(msg) => Err(GenError::Internal(anyhow::anyhow!(msg))),
        }
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.features.clone()
    }
}
