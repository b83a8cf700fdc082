//! Request-to-worker matching, pool mutation, the init-retry loop, and the
//! inactivity watchdog.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::claim::Claim;
use crate::driver::WorkerDriver;
use crate::error::GenError;
use crate::hooks::HookRegistry;
use crate::record::{WorkerId, WorkerRecord, WorkerStatus};

/// One worker in the pool: its record plus the driver serving it.
#[derive(Clone)]
pub(crate) struct PoolEntry {
    pub(crate) record: Arc<WorkerRecord>,
    pub(crate) driver: Arc<dyn WorkerDriver>,
}

struct ActiveAccess {
    record: Arc<WorkerRecord>,
    stall: CancellationToken,
}

pub(crate) struct PoolInner {
    records: RwLock<BTreeMap<WorkerId, PoolEntry>>,
    changed: Arc<Notify>,
    active: Mutex<HashMap<WorkerId, ActiveAccess>>,
    hooks: HookRegistry,
    max_init_attempts: u32,
    inactivity_timeout: Duration,
    shutdown: CancellationToken,
    init_tx: mpsc::UnboundedSender<WorkerId>,
}

/// Matches requests to workers and owns the pool. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher(Arc<PoolInner>);

/// Non-owning dispatcher handle. Drivers registered in the pool hold this
/// instead of a [`Dispatcher`] so the pool and its drivers do not keep each
/// other alive.
#[derive(Clone)]
pub(crate) struct WeakDispatcher(std::sync::Weak<PoolInner>);

impl WeakDispatcher {
    pub(crate) fn upgrade(&self) -> Option<Dispatcher> {
        self.0.upgrade().map(Dispatcher)
    }
}

impl Dispatcher {
    /// Build a dispatcher. The returned receiver feeds
    /// [`Dispatcher::run_init_loop`], which the caller spawns.
    pub fn new(
        max_init_attempts: u32,
        inactivity_timeout: Duration,
        hooks: HookRegistry,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerId>) {
        let (init_tx, init_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher(Arc::new(PoolInner {
            records: RwLock::new(BTreeMap::new()),
            changed: Arc::new(Notify::new()),
            active: Mutex::new(HashMap::new()),
            hooks,
            max_init_attempts: max_init_attempts.max(1),
            inactivity_timeout,
            shutdown,
            init_tx,
        }));
        (dispatcher, init_rx)
    }

    pub(crate) fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Arc::downgrade(&self.0))
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        &self.0.hooks
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.0.shutdown
    }

    /// Register a directly managed worker and queue it for initialization.
    pub fn add_worker(
        &self,
        driver: Arc<dyn WorkerDriver>,
        settings: serde_json::Value,
    ) -> Arc<WorkerRecord> {
        let record = WorkerRecord::new(driver.driver_type(), settings, true, self.0.changed.clone());
        let id = record.id();
        self.0
            .records
            .write()
            .expect("pool lock poisoned")
            .insert(id, PoolEntry {
                record: record.clone(),
                driver,
            });
        // Fresh records go Disabled -> Waiting and wait for the init loop.
        let _ = record.set_status(WorkerStatus::Waiting);
        let _ = self.0.init_tx.send(id);
        self.0.changed.notify_waiters();
        record
    }

    /// Synthesize a shadow record mirroring a federation slot. Shadows skip
    /// the init loop; their status tracks the parent driver's.
    pub(crate) fn add_shadow(
        &self,
        driver: Arc<dyn WorkerDriver>,
        settings: serde_json::Value,
        status: WorkerStatus,
        features: BTreeSet<String>,
    ) -> Arc<WorkerRecord> {
        let record =
            WorkerRecord::new(driver.driver_type(), settings, false, self.0.changed.clone());
        record.set_features(features);
        // Walk the lifecycle up to the parent's status without broadcasting
        // half-made states.
        let _ = record.set_status_quiet(WorkerStatus::Waiting);
        let _ = record.set_status_quiet(WorkerStatus::Loading);
        let _ = record.set_status_quiet(status);
        self.0
            .records
            .write()
            .expect("pool lock poisoned")
            .insert(record.id(), PoolEntry {
                record: record.clone(),
                driver,
            });
        self.0.changed.notify_waiters();
        record
    }

    /// Remove a worker from the pool. Waits for any in-flight claim on it to
    /// drain first; the global shutdown signal forces the removal through.
    pub async fn remove_worker(&self, id: WorkerId) -> Option<Arc<WorkerRecord>> {
        loop {
            let notified = self.0.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut records = self.0.records.write().expect("pool lock poisoned");
                match records.get(&id) {
                    None => return None,
                    Some(entry)
                        if entry.record.is_busy() && !self.0.shutdown.is_cancelled() =>
                    {
                        true
                    }
                    Some(_) => {
                        let entry = records.remove(&id);
                        drop(records);
                        self.0.changed.notify_waiters();
                        return entry.map(|e| e.record);
                    }
                }
            };
            if wait {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = self.0.shutdown.cancelled() => {}
                }
            }
        }
    }

    pub(crate) fn entry(&self, id: WorkerId) -> Option<PoolEntry> {
        self.0
            .records
            .read()
            .expect("pool lock poisoned")
            .get(&id)
            .cloned()
    }

    pub(crate) fn entries(&self) -> Vec<PoolEntry> {
        self.0
            .records
            .read()
            .expect("pool lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Flip a group of records in one step. Observers snapshotting the pool
    /// see either none or all of the group transitioned.
    pub(crate) fn set_status_group(&self, ids: &[WorkerId], to: WorkerStatus) {
        {
            let records = self.0.records.write().expect("pool lock poisoned");
            for id in ids {
                if let Some(entry) = records.get(id) {
                    if let Err(err) = entry.record.set_status_quiet(to) {
                        tracing::warn!(worker = %id, "group status flip rejected: {err}");
                    }
                }
            }
        }
        self.0.changed.notify_waiters();
    }

    /// Find and reserve a worker matching `filter`.
    ///
    /// Workers already holding `preferred_model` win; otherwise `on_will_load`
    /// fires exactly once and an idle matching worker is picked for a reload.
    /// When nothing matches, the call suspends until a record changes, the
    /// deadline elapses (queueing time included), or the claim cancels.
    pub async fn acquire(
        &self,
        filter: impl Fn(&WorkerRecord) -> bool,
        preferred_model: Option<&str>,
        timeout: Duration,
        claim: &Claim,
        mut on_will_load: impl FnMut(),
    ) -> Result<WorkerAccess, GenError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut will_load_signalled = false;

        loop {
            if claim.should_cancel() || self.0.shutdown.is_cancelled() {
                return Err(GenError::Cancelled);
            }

            let notified = self.0.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut candidates: Vec<PoolEntry> = {
                let records = self.0.records.read().expect("pool lock poisoned");
                records
                    .values()
                    .filter(|e| {
                        e.record.status() == WorkerStatus::Running
                            && !e.record.is_busy()
                            && filter(&e.record)
                    })
                    .cloned()
                    .collect()
            };
            candidates.sort_by_key(|e| (e.record.claims_served(), e.record.id()));

            let (matching, reloadable): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|e| match preferred_model {
                    Some(model) => e.record.current_model().as_deref() == Some(model),
                    None => true,
                });

            let pick_from = if !matching.is_empty() {
                matching
            } else if !reloadable.is_empty() {
                if !will_load_signalled {
                    on_will_load();
                    will_load_signalled = true;
                }
                reloadable
            } else {
                Vec::new()
            };

            let had_candidates = !pick_from.is_empty();
            let mut won = None;
            for entry in pick_from {
                if entry.record.try_acquire() {
                    // The record may have left Running between the snapshot
                    // and the swap.
                    if entry.record.status() != WorkerStatus::Running {
                        entry.record.release_busy();
                        continue;
                    }
                    won = Some(entry);
                    break;
                }
            }

            if let Some(entry) = won {
                entry.record.note_claim_served();
                entry.record.touch();
                let stall = CancellationToken::new();
                self.0.active.lock().expect("active map poisoned").insert(
                    entry.record.id(),
                    ActiveAccess {
                        record: entry.record.clone(),
                        stall: stall.clone(),
                    },
                );
                return Ok(WorkerAccess {
                    entry,
                    inner: self.0.clone(),
                    stall,
                });
            }

            if had_candidates {
                // Lost every swap; the pool just changed, re-scan right away.
                continue;
            }

            tokio::select! {
                _ = &mut deadline => return Err(GenError::Timeout),
                _ = claim.cancelled() => return Err(GenError::Cancelled),
                _ = self.0.shutdown.cancelled() => return Err(GenError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Queue an errored worker for another init round.
    pub fn retry_worker(&self, id: WorkerId) {
        let _ = self.0.init_tx.send(id);
    }

    /// Background loop that initializes queued records with retry.
    pub async fn run_init_loop(self, mut init_rx: mpsc::UnboundedReceiver<WorkerId>) {
        loop {
            let id = tokio::select! {
                _ = self.0.shutdown.cancelled() => return,
                id = init_rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            };
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.init_worker(id).await });
        }
    }

    async fn init_worker(&self, id: WorkerId) {
        let Some(entry) = self.entry(id) else { return };
        let max_attempts = self.0.max_init_attempts;

        for attempt in 1..=max_attempts {
            if self.0.shutdown.is_cancelled() {
                return;
            }
            if entry.record.status() == WorkerStatus::Errored {
                let _ = entry.record.set_status(WorkerStatus::Waiting);
            }

            match entry.driver.init(&entry.record).await {
                Ok(()) => {
                    entry.record.set_features(entry.driver.supported_features());
                    self.0.changed.notify_waiters();
                    tracing::info!(worker = %id, status = %entry.record.status(), "worker initialized");
                    return;
                }
                Err(err) => {
                    // Drivers normally leave the record Errored themselves.
                    if entry.record.status() == WorkerStatus::Loading {
                        let _ = entry.record.set_status(WorkerStatus::Errored);
                    }
                    if err.is_fatal_for_init() {
                        tracing::error!(worker = %id, "worker init failed fatally: {err}");
                        return;
                    }
                    if attempt == max_attempts {
                        tracing::error!(
                            worker = %id,
                            attempts = attempt,
                            "worker init failed permanently: {err:#}"
                        );
                        return;
                    }
                    let delay = Duration::from_secs(1u64 << (attempt.min(6) - 1));
                    tracing::warn!(
                        worker = %id,
                        attempt,
                        "worker init failed, retrying in {}s: {err:#}",
                        delay.as_secs()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.0.shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Background loop that fails workers holding a claim without progress
    /// past the inactivity threshold.
    pub async fn run_watchdog(self) {
        let tick = (self.0.inactivity_timeout / 4)
            .min(Duration::from_secs(30))
            .max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.0.shutdown.cancelled() => return,
                _ = interval.tick() => {}
            }

            let stalled: Vec<(WorkerId, CancellationToken)> = {
                let active = self.0.active.lock().expect("active map poisoned");
                active
                    .iter()
                    .filter(|(_, a)| {
                        a.record.last_activity().elapsed() >= self.0.inactivity_timeout
                    })
                    .map(|(id, a)| (*id, a.stall.clone()))
                    .collect()
            };
            for (id, stall) in stalled {
                tracing::warn!(worker = %id, "no progress within the inactivity window; failing worker");
                stall.cancel();
            }
        }
    }

    /// Shut every worker down and empty the pool.
    pub async fn shutdown_all(&self) {
        let entries: Vec<PoolEntry> = {
            let mut records = self.0.records.write().expect("pool lock poisoned");
            let drained = records.values().cloned().collect();
            records.clear();
            drained
        };
        self.0.changed.notify_waiters();
        for entry in entries {
            if entry.record.is_real() {
                entry.driver.shutdown(&entry.record).await;
            } else {
                let _ = entry.record.set_status(WorkerStatus::Disabled);
            }
        }
    }
}

/// Scoped reservation of one worker. Dropping it releases the busy flag and
/// wakes blocked acquires, on every exit path.
pub struct WorkerAccess {
    entry: PoolEntry,
    inner: Arc<PoolInner>,
    stall: CancellationToken,
}

impl WorkerAccess {
    pub fn record(&self) -> &Arc<WorkerRecord> {
        &self.entry.record
    }

    pub fn driver(&self) -> &Arc<dyn WorkerDriver> {
        &self.entry.driver
    }

    /// Note driver progress so the inactivity watchdog stays quiet.
    pub fn touch(&self) {
        self.entry.record.touch();
    }

    /// Resolves when the watchdog declares this worker stalled.
    pub async fn stalled(&self) {
        self.stall.cancelled().await;
    }
}

impl Drop for WorkerAccess {
    fn drop(&mut self) {
        let id = self.entry.record.id();
        self.inner
            .active
            .lock()
            .expect("active map poisoned")
            .remove(&id);
        if self.stall.is_cancelled() {
            // Forced release: the worker goes to Errored and back into the
            // init queue before the busy flag clears, so no new claim can
            // slip onto it in between.
            if let Err(err) = self.entry.record.set_status(WorkerStatus::Errored) {
                tracing::warn!(worker = %id, "stalled worker status flip rejected: {err}");
            }
            let _ = self.inner.init_tx.send(id);
        }
        self.entry.record.release_busy();
    }
}
