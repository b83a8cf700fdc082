//! Engine assembly: builds the dispatcher, registers configured workers,
//! and runs the status/event loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use imagehive_core::settings::DispatchSettings;

use crate::api::{
    EngineConfig, EngineEvent, EngineHandle, GenerateRequest, GenerationOutcome, OutputSink,
    StatusSnapshot, WorkerView,
};
use crate::api_worker::{ApiWorkerDriver, ApiWorkerSettings};
use crate::claim::SessionLedger;
use crate::dispatcher::Dispatcher;
use crate::error::GenError;
use crate::federation::{FederationDriver, FederationSettings};
use crate::pipeline;
use crate::record::{WorkerId, WorkerStatus};

pub(crate) struct EngineInner {
    pub(crate) event_tx: broadcast::Sender<EngineEvent>,
    pub(crate) snapshot_rx: watch::Receiver<StatusSnapshot>,
    pub(crate) dispatcher: Dispatcher,
    shutdown: CancellationToken,
    stop_requested: AtomicBool,
    sessions: Mutex<HashMap<String, Arc<SessionLedger>>>,
    settings: DispatchSettings,
    recent: Mutex<VecDeque<GenerationOutcome>>,
    recent_max: usize,
}

impl EngineInner {
    /// Returns true when this call initiated the stop; false when a stop was
    /// already underway, so callers can escalate.
    pub(crate) fn request_stop(&self) -> bool {
        let first = !self.stop_requested.swap(true, Ordering::SeqCst);
        if first {
            let _ = self.event_tx.send(EngineEvent::StopRequested);
            self.shutdown.cancel();
        }
        first
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn session(&self, user_id: &str) -> Arc<SessionLedger> {
        let mut sessions = self.sessions.lock().expect("sessions poisoned");
        let ledger = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(SessionLedger::new()));
        if ledger.is_closed() {
            *ledger = Arc::new(SessionLedger::new());
        }
        ledger.clone()
    }

    pub(crate) fn close_session(&self, user_id: &str) {
        let ledger = self
            .sessions
            .lock()
            .expect("sessions poisoned")
            .remove(user_id);
        if let Some(ledger) = ledger {
            ledger.close();
        }
    }

    pub(crate) async fn generate(
        &self,
        request: GenerateRequest,
        sink: Arc<dyn OutputSink>,
    ) -> GenerationOutcome {
        let batch_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let ledger = self.session(&request.user_id);
        let claim = ledger.new_claim(&self.shutdown);

        let _ = self.event_tx.send(EngineEvent::RequestStarted {
            batch_id: batch_id.clone(),
            user_id: request.user_id.clone(),
        });

        let result = pipeline::run_generation(
            &self.dispatcher,
            &request,
            &batch_id,
            &claim,
            &sink,
            self.settings.acquire_timeout(),
        )
        .await;

        let outcome = match result {
            Ok(run) => GenerationOutcome {
                batch_id,
                user_id: request.user_id,
                images_saved: run.images_saved,
                error: None,
                prep_ms: run.prep.as_millis() as u64,
                gen_ms: run.r#gen.as_millis() as u64,
                total_ms: started.elapsed().as_millis() as u64,
                finished_at: Utc::now().timestamp(),
            },
            Err(err) => {
                let error = if err.is_cancellation() {
                    // Cancellations are the caller's own doing; nothing to report.
                    None
                } else {
                    let message = err.user_message();
                    if let GenError::Internal(inner) = &err {
                        tracing::error!(batch = %batch_id, "generation failed: {inner:#}");
                    } else {
                        tracing::warn!(batch = %batch_id, "generation failed: {err}");
                    }
                    sink.set_error(message.clone()).await;
                    Some(message)
                };
                GenerationOutcome {
                    batch_id,
                    user_id: request.user_id,
                    images_saved: 0,
                    error,
                    prep_ms: 0,
                    gen_ms: 0,
                    total_ms: started.elapsed().as_millis() as u64,
                    finished_at: Utc::now().timestamp(),
                }
            }
        };

        {
            let mut recent = self.recent.lock().expect("recent poisoned");
            recent.push_back(outcome.clone());
            while recent.len() > self.recent_max {
                recent.pop_front();
            }
        }
        let _ = self.event_tx.send(EngineEvent::RequestFinished {
            outcome: outcome.clone(),
        });
        outcome
    }

    fn build_snapshot(&self) -> StatusSnapshot {
        let workers = self
            .dispatcher
            .entries()
            .into_iter()
            .map(|entry| WorkerView {
                id: entry.record.id(),
                driver_type: entry.record.driver_type().to_string(),
                status: entry.record.status(),
                is_real: entry.record.is_real(),
                busy: entry.record.is_busy(),
                current_model: entry.record.current_model(),
                features: entry.record.features(),
                claims_served: entry.record.claims_served(),
                images_produced: entry.record.images_produced(),
            })
            .collect();

        StatusSnapshot {
            stop_requested: self.should_stop(),
            workers,
            recent: self.recent.lock().expect("recent poisoned").iter().cloned().collect(),
        }
    }
}

pub(crate) fn start_engine(config: EngineConfig) -> anyhow::Result<EngineHandle> {
    let EngineConfig {
        settings,
        hooks,
        recent_outcomes_max,
        snapshot_tick,
    } = config;

    let shutdown = CancellationToken::new();
    let (dispatcher, init_rx) = Dispatcher::new(
        settings.max_init_attempts,
        settings.inactivity_timeout(),
        hooks,
        shutdown.clone(),
    );
    tokio::spawn(dispatcher.clone().run_init_loop(init_rx));
    tokio::spawn(dispatcher.clone().run_watchdog());

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| anyhow::anyhow!("build http client: {err:#}"))?;
    let server_id = Uuid::new_v4().to_string();

    for entry in &settings.workers {
        match entry.driver_type.as_str() {
            "api" => match serde_json::from_value::<ApiWorkerSettings>(entry.settings.clone()) {
                Ok(worker_settings) => {
                    dispatcher.add_worker(
                        Arc::new(ApiWorkerDriver::new(http.clone(), worker_settings)),
                        entry.settings.clone(),
                    );
                }
                Err(err) => {
                    tracing::warn!("skipping api worker with bad settings: {err}");
                }
            },
            other => {
                tracing::warn!(driver = other, "unknown worker driver type; skipping");
            }
        }
    }
    for entry in &settings.federation {
        match FederationSettings::from_entry(entry) {
            Ok(federation_settings) => {
                let value = serde_json::to_value(entry).unwrap_or(serde_json::Value::Null);
                let driver = FederationDriver::new(
                    http.clone(),
                    federation_settings,
                    server_id.clone(),
                    &dispatcher,
                );
                dispatcher.add_worker(driver, value);
            }
            Err(err) => {
                tracing::warn!("skipping federation entry: {err:#}");
            }
        }
    }

    let (snapshot_tx, snapshot_rx) = watch::channel(StatusSnapshot {
        stop_requested: false,
        workers: Vec::new(),
        recent: Vec::new(),
    });
    let (event_tx, _) = broadcast::channel::<EngineEvent>(1024);

    let inner = Arc::new(EngineInner {
        event_tx,
        snapshot_rx,
        dispatcher,
        shutdown,
        stop_requested: AtomicBool::new(false),
        sessions: Mutex::new(HashMap::new()),
        settings,
        recent: Mutex::new(VecDeque::new()),
        recent_max: recent_outcomes_max.max(1),
    });

    let tick = snapshot_tick.max(Duration::from_millis(50));
    let join = tokio::spawn(run_engine_loop(inner.clone(), snapshot_tx, tick));
    Ok(EngineHandle { inner, join })
}

async fn run_engine_loop(
    inner: Arc<EngineInner>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    tick: Duration,
) -> anyhow::Result<()> {
    let _ = inner.event_tx.send(EngineEvent::Started);
    let _ = snapshot_tx.send(inner.build_snapshot());

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_status: HashMap<WorkerId, WorkerStatus> = HashMap::new();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {
                for entry in inner.dispatcher.entries() {
                    let id = entry.record.id();
                    let status = entry.record.status();
                    if last_status.insert(id, status) != Some(status) {
                        let _ = inner.event_tx.send(EngineEvent::WorkerStatusChanged {
                            worker: id,
                            status,
                        });
                    }
                }
                let _ = snapshot_tx.send(inner.build_snapshot());
            }
        }
    }

    inner.dispatcher.shutdown_all().await;
    let _ = snapshot_tx.send(inner.build_snapshot());
    let _ = inner.event_tx.send(EngineEvent::Stopped);
    Ok(())
}
