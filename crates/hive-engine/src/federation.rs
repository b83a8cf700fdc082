//! Federation driver: mirrors a peer instance's worker pool into the local
//! one.
//!
//! The peer runs this same service. One driver owns the session with the
//! peer; the dispatcher sees the driver's parent record plus a row of shadow
//! records, one per reserved concurrency slot on the peer.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use imagehive_core::settings::FederationEntry;

use crate::api::GenerateRequest;
use crate::dispatcher::{Dispatcher, WeakDispatcher};
use crate::driver::{GenerateItem, ImagePayload, StreamEnd, WorkerDriver};
use crate::error::GenError;
use crate::record::{WorkerId, WorkerRecord, WorkerStatus};

/// How often the loading wait re-queries the peer's backend list.
const LOADING_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FederationSettings {
    /// Peer base address.
    pub address: Url,

    /// Park as idle instead of errored when the peer is unreachable.
    pub allow_idle: bool,

    /// Extra shadow slots beyond the peer's running count.
    pub over_queue: u32,

    /// Stream generations over `generate-ws`; plain `generate` otherwise.
    pub use_websocket: bool,

    /// Cadence of idle re-probes and running-pool refreshes.
    pub probe_interval: Duration,
}

impl FederationSettings {
    pub fn from_entry(entry: &FederationEntry) -> anyhow::Result<Self> {
        Ok(Self {
            address: Url::parse(&entry.address)
                .map_err(|err| anyhow::anyhow!("bad federation address {:?}: {err}", entry.address))?,
            allow_idle: entry.allow_idle,
            over_queue: entry.over_queue,
            use_websocket: entry.use_websocket,
            probe_interval: Duration::from_secs(entry.probe_interval_secs.max(1)),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewSessionResponse {
    pub(crate) session_id: String,
    pub(crate) server_id: String,
    pub(crate) count_running: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PeerBackendInfo {
    pub(crate) status: String,
    #[serde(rename = "type")]
    pub(crate) backend_type: String,
    #[serde(default)]
    pub(crate) features: Vec<String>,
}

/// The peer's wire surface. Split out so federation behavior is testable
/// against a scripted peer.
#[async_trait]
pub(crate) trait PeerApi: Send + Sync {
    async fn new_session(&self) -> Result<NewSessionResponse, GenError>;

    async fn list_backends(&self, session_id: &str) -> Result<Vec<PeerBackendInfo>, GenError>;

    /// Run one generation on the peer, streaming items into `sink`.
    async fn generate(
        &self,
        session_id: &str,
        request: &GenerateRequest,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<(), GenError>;
}

/// Maps the peer's `{error_id}` envelope onto the error taxonomy.
fn check_peer_error(value: &serde_json::Value) -> Result<(), GenError> {
    if let Some(error_id) = value.get("error_id").and_then(|v| v.as_str()) {
        if error_id == "invalid_session_id" {
            return Err(GenError::SessionInvalid);
        }
        return Err(GenError::Connection(format!("peer error: {error_id}")));
    }
    Ok(())
}

/// `PeerApi` over HTTP and the peer's websocket streaming endpoint.
struct HttpPeerApi {
    http: reqwest::Client,
    address: Url,
    use_websocket: bool,
}

impl HttpPeerApi {
    fn endpoint(&self, path: &str) -> Result<Url, GenError> {
        self.address
            .join(path)
            .map_err(|err| GenError::Internal(anyhow::anyhow!("bad peer address: {err}")))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GenError> {
        let url = self.endpoint(path)?;
        let res = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(GenError::Connection(format!("http {status}: {text}")));
        }
        let value: serde_json::Value = res
            .json()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;
        check_peer_error(&value)?;
        Ok(value)
    }

    fn generate_body(session_id: &str, request: &GenerateRequest) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("session_id".to_string(), session_id.into());
        body.insert("images".to_string(), 1u32.into());
        body.insert("donotsave".to_string(), true.into());
        if let Some(model) = &request.preferred_model {
            body.insert("model".to_string(), model.as_str().into());
        }
        for (key, value) in &request.params {
            body.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(body)
    }

    fn ws_endpoint(&self) -> Result<Url, GenError> {
        let mut url = self.endpoint("generate-ws")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| GenError::Internal(anyhow::anyhow!("peer address has no ws scheme")))?;
        Ok(url)
    }

    /// Streamed generation over the peer's websocket endpoint. Each frame is
    /// one JSON object: `{gen_progress}`, `{image}`, or `{error_id}`.
    async fn generate_ws(
        &self,
        session_id: &str,
        request: &GenerateRequest,
        sink: &mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<(), GenError> {
        let url = self.ws_endpoint()?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| GenError::Connection(format!("websocket connect failed: {err}")))?;
        let (mut write, mut read) = ws.split();

        let payload = serde_json::to_string(&Self::generate_body(session_id, request))
            .map_err(|err| GenError::Internal(anyhow::anyhow!("encode generate frame: {err}")))?;
        write
            .send(Message::Text(payload.into()))
            .await
            .map_err(|err| GenError::Connection(format!("websocket send failed: {err}")))?;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Err(GenError::Cancelled);
                }
                msg = read.next() => msg,
            };
            match msg {
                None | Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Err(err)) => {
                    return Err(GenError::Connection(format!("websocket read failed: {err}")));
                }
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(text.as_str())
                        .map_err(|err| {
                            GenError::Connection(format!("bad peer frame: {err}"))
                        })?;
                    check_peer_error(&value)?;
                    if let Some(progress) = value.get("gen_progress") {
                        if sink
                            .send(GenerateItem::Progress(progress.clone()))
                            .await
                            .is_err()
                        {
                            return Err(GenError::Cancelled);
                        }
                    }
                    if let Some(uri) = value.get("image").and_then(|v| v.as_str()) {
                        let image = ImagePayload::from_data_uri(uri)?;
                        if sink.send(GenerateItem::Image(image)).await.is_err() {
                            return Err(GenError::Cancelled);
                        }
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

#[async_trait]
impl PeerApi for HttpPeerApi {
    async fn new_session(&self) -> Result<NewSessionResponse, GenError> {
        let value = self
            .post_json("session/new", &serde_json::json!({}))
            .await?;
        serde_json::from_value(value)
            .map_err(|err| GenError::Connection(format!("bad session response: {err}")))
    }

    async fn list_backends(&self, session_id: &str) -> Result<Vec<PeerBackendInfo>, GenError> {
        let value = self
            .post_json(
                "backends/list",
                &serde_json::json!({"session_id": session_id}),
            )
            .await?;
        // The list may arrive bare or wrapped in a `backends` envelope.
        let list = if value.is_array() {
            value
        } else {
            value
                .get("backends")
                .cloned()
                .unwrap_or(serde_json::Value::Array(Vec::new()))
        };
        serde_json::from_value(list)
            .map_err(|err| GenError::Connection(format!("bad backend list: {err}")))
    }

    async fn generate(
        &self,
        session_id: &str,
        request: &GenerateRequest,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<(), GenError> {
        if self.use_websocket {
            return self.generate_ws(session_id, request, &sink, cancel).await;
        }

        let body = Self::generate_body(session_id, request);
        let send = self.post_json("generate", &body);
        let value = tokio::select! {
            value = send => value?,
            _ = cancel.cancelled() => return Err(GenError::Cancelled),
        };
        let images = value
            .get("images")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for uri in images.iter().filter_map(|v| v.as_str()) {
            let image = ImagePayload::from_data_uri(uri)?;
            if sink.send(GenerateItem::Image(image)).await.is_err() {
                return Err(GenError::Cancelled);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FedState {
    session_id: Option<String>,
    remote_features: BTreeSet<String>,
    remote_backend_types: BTreeSet<String>,
    any_loading: bool,
    remote_count: u32,
}

/// Worker driver delegating to a peer instance of this service.
pub struct FederationDriver {
    settings: FederationSettings,
    peer: Arc<dyn PeerApi>,
    local_server_id: String,
    state: Mutex<FedState>,
    shadows: Mutex<Vec<WorkerId>>,
    parent: Mutex<Option<Arc<WorkerRecord>>>,
    dispatcher: WeakDispatcher,
    self_ref: OnceLock<Weak<FederationDriver>>,
    monitor_running: AtomicBool,
}

impl FederationDriver {
    pub fn new(
        http: reqwest::Client,
        settings: FederationSettings,
        local_server_id: String,
        dispatcher: &Dispatcher,
    ) -> Arc<Self> {
        let peer = Arc::new(HttpPeerApi {
            http,
            address: settings.address.clone(),
            use_websocket: settings.use_websocket,
        });
        Self::with_peer(peer, settings, local_server_id, dispatcher)
    }

    pub(crate) fn with_peer(
        peer: Arc<dyn PeerApi>,
        settings: FederationSettings,
        local_server_id: String,
        dispatcher: &Dispatcher,
    ) -> Arc<Self> {
        let driver = Arc::new(Self {
            settings,
            peer,
            local_server_id,
            state: Mutex::new(FedState::default()),
            shadows: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            dispatcher: dispatcher.downgrade(),
            self_ref: OnceLock::new(),
            monitor_running: AtomicBool::new(false),
        });
        let _ = driver.self_ref.set(Arc::downgrade(&driver));
        driver
    }

    fn dispatcher(&self) -> Result<Dispatcher, GenError> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| GenError::Internal(anyhow::anyhow!("dispatcher is gone")))
    }

    fn self_arc(&self) -> Result<Arc<FederationDriver>, GenError> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| GenError::Internal(anyhow::anyhow!("federation driver is gone")))
    }

    fn parent_record(&self) -> Option<Arc<WorkerRecord>> {
        self.parent.lock().expect("parent poisoned").clone()
    }

    fn current_session(&self) -> Option<String> {
        self.state
            .lock()
            .expect("federation state poisoned")
            .session_id
            .clone()
    }

    /// Number of shadow records currently synthesized. Test visibility.
    pub fn shadow_count(&self) -> usize {
        self.shadows.lock().expect("shadows poisoned").len()
    }

    /// Driver-type tags observed on the peer at the last list refresh.
    pub fn remote_backend_types(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("federation state poisoned")
            .remote_backend_types
            .clone()
    }

    /// True while the peer reports at least one loading sub-worker.
    pub fn peer_loading(&self) -> bool {
        self.state
            .lock()
            .expect("federation state poisoned")
            .any_loading
    }

    #[cfg(test)]
    pub(crate) fn shadow_ids(&self) -> Vec<WorkerId> {
        self.shadows.lock().expect("shadows poisoned").clone()
    }

    /// `session/new` plus loop detection. Stores the fresh token.
    async fn open_session(&self) -> Result<(), GenError> {
        let sess = self.peer.new_session().await?;
        if sess.server_id == self.local_server_id {
            return Err(GenError::LoopDetected);
        }
        let mut state = self.state.lock().expect("federation state poisoned");
        state.session_id = Some(sess.session_id);
        state.remote_count = sess.count_running;
        Ok(())
    }

    async fn session_or_open(&self) -> Result<String, GenError> {
        if let Some(sid) = self.current_session() {
            return Ok(sid);
        }
        self.open_session().await?;
        self.current_session()
            .ok_or_else(|| GenError::Connection("peer issued no session token".to_string()))
    }

    /// Session-recovery wrapper: on `SessionInvalid` the session is
    /// re-established transparently and `op` retried exactly once. A second
    /// invalidation surfaces as a connection error.
    async fn with_session<T, F>(&self, op: impl Fn(String) -> F) -> Result<T, GenError>
    where
        F: Future<Output = Result<T, GenError>>,
    {
        let sid = self.session_or_open().await?;
        match op(sid).await {
            Err(GenError::SessionInvalid) => {
                tracing::debug!(peer = %self.settings.address, "peer session invalidated; re-establishing");
                self.open_session().await?;
                let sid = self.session_or_open().await?;
                match op(sid).await {
                    Err(GenError::SessionInvalid) => Err(GenError::Connection(
                        "peer session could not be re-established".to_string(),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// `backends/list` behind the session-recovery wrapper.
    async fn list_with_recovery(&self) -> Result<Vec<PeerBackendInfo>, GenError> {
        let peer = self.peer.clone();
        self.with_session(move |sid| {
            let peer = peer.clone();
            async move { peer.list_backends(&sid).await }
        })
        .await
    }

    /// Fold a backend list into the mirrored state. Returns whether any
    /// peer sub-worker is still loading.
    fn absorb_list(&self, backends: &[PeerBackendInfo]) -> bool {
        let mut features = BTreeSet::new();
        let mut types = BTreeSet::new();
        let mut running = 0u32;
        let mut any_loading = false;
        for backend in backends {
            features.extend(backend.features.iter().cloned());
            types.insert(backend.backend_type.clone());
            match backend.status.as_str() {
                "running" => running += 1,
                "loading" => any_loading = true,
                _ => {}
            }
        }

        let mut state = self.state.lock().expect("federation state poisoned");
        state.remote_features = features;
        state.remote_backend_types = types;
        state.any_loading = any_loading;
        state.remote_count = running;
        any_loading
    }

    /// Bring the shadow row to `max(0, remote_count - 1 + over_queue)`,
    /// trimming from the front. Removal waits for in-flight claims to drain.
    async fn sync_shadows(&self) -> Result<(), GenError> {
        let dispatcher = self.dispatcher()?;
        let target = {
            let state = self.state.lock().expect("federation state poisoned");
            (state.remote_count as i64 - 1 + self.settings.over_queue as i64).max(0) as usize
        };

        loop {
            let excess = {
                let mut shadows = self.shadows.lock().expect("shadows poisoned");
                if shadows.len() > target {
                    Some(shadows.remove(0))
                } else {
                    None
                }
            };
            match excess {
                Some(id) => {
                    dispatcher.remove_worker(id).await;
                }
                None => break,
            }
        }

        let parent = self.parent_record();
        let (status, settings) = match &parent {
            Some(record) => (record.status(), record.settings().clone()),
            None => (WorkerStatus::Loading, serde_json::Value::Null),
        };
        loop {
            {
                let shadows = self.shadows.lock().expect("shadows poisoned");
                if shadows.len() >= target {
                    break;
                }
            }
            let driver: Arc<dyn WorkerDriver> = self.self_arc()?;
            let record = dispatcher.add_shadow(
                driver,
                settings.clone(),
                status,
                self.supported_features(),
            );
            self.shadows
                .lock()
                .expect("shadows poisoned")
                .push(record.id());
        }
        Ok(())
    }

    /// Flip the parent and every shadow in one step under the pool lock.
    fn set_group_status(&self, to: WorkerStatus) {
        let Ok(dispatcher) = self.dispatcher() else { return };
        let mut ids = Vec::new();
        if let Some(parent) = self.parent_record() {
            ids.push(parent.id());
        }
        ids.extend(self.shadows.lock().expect("shadows poisoned").iter().copied());
        dispatcher.set_status_group(&ids, to);
    }

    fn set_group_features(&self) {
        let features = self.supported_features();
        let Ok(dispatcher) = self.dispatcher() else { return };
        if let Some(parent) = self.parent_record() {
            parent.set_features(features.clone());
        }
        let shadows: Vec<WorkerId> = self
            .shadows
            .lock()
            .expect("shadows poisoned")
            .iter()
            .copied()
            .collect();
        for id in shadows {
            if let Some(entry) = dispatcher.entry(id) {
                entry.record.set_features(features.clone());
            }
        }
    }

    /// Full bring-up against the peer: session, list (waiting out loading
    /// sub-workers), shadow synthesis, group flip to Running.
    async fn establish(&self, record: &Arc<WorkerRecord>) -> Result<(), GenError> {
        self.open_session().await?;

        loop {
            let backends = self.list_with_recovery().await?;
            if !self.absorb_list(&backends) {
                break;
            }
            // Peer still has loading sub-workers; stay Loading and re-query.
            let shutdown = self.dispatcher()?.shutdown_token().clone();
            tokio::select! {
                _ = tokio::time::sleep(LOADING_POLL) => {}
                _ = shutdown.cancelled() => return Err(GenError::Cancelled),
            }
        }

        self.sync_shadows().await?;
        record.set_features(self.supported_features());
        self.set_group_status(WorkerStatus::Running);
        self.set_group_features();
        self.ensure_monitor();
        Ok(())
    }

    /// Re-list the peer pool and resize the shadow row. Runs while Running.
    pub(crate) async fn refresh(&self) -> Result<(), GenError> {
        let backends = self.list_with_recovery().await?;
        self.absorb_list(&backends);
        self.sync_shadows().await?;
        self.set_group_features();
        Ok(())
    }

    /// Idle re-probe: try to come back up. Stays idle while the peer still
    /// reports loading sub-workers.
    async fn probe_and_resume(&self) -> Result<(), GenError> {
        self.open_session().await?;
        let backends = self.list_with_recovery().await?;
        if self.absorb_list(&backends) {
            return Ok(());
        }
        self.sync_shadows().await?;
        self.set_group_status(WorkerStatus::Running);
        self.set_group_features();
        Ok(())
    }

    /// The peer stopped answering: drop the session and park the whole group
    /// idle (re-probed later) or errored (re-initialized by the dispatcher).
    fn mark_unreachable(&self) {
        self.state
            .lock()
            .expect("federation state poisoned")
            .session_id = None;
        if self.settings.allow_idle {
            self.set_group_status(WorkerStatus::Idle);
            self.ensure_monitor();
        } else {
            self.set_group_status(WorkerStatus::Errored);
            if let (Ok(dispatcher), Some(parent)) = (self.dispatcher(), self.parent_record()) {
                dispatcher.retry_worker(parent.id());
            }
        }
    }

    /// Spawn the long-lived peer monitor once. It re-probes idle drivers and
    /// refreshes the mirrored pool of running ones.
    fn ensure_monitor(&self) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (Ok(driver), Ok(dispatcher)) = (self.self_arc(), self.dispatcher()) else {
            return;
        };
        let shutdown = dispatcher.shutdown_token().clone();
        tokio::spawn(async move {
            driver.run_peer_monitor(shutdown).await;
        });
    }

    async fn run_peer_monitor(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.settings.probe_interval) => {}
            }
            let Some(parent) = self.parent_record() else { continue };
            match parent.status() {
                WorkerStatus::Idle => {
                    if let Err(err) = self.probe_and_resume().await {
                        tracing::debug!(peer = %self.settings.address, "idle re-probe failed: {err}");
                    }
                }
                WorkerStatus::Running => {
                    if let Err(err) = self.refresh().await {
                        tracing::warn!(peer = %self.settings.address, "peer refresh failed: {err}");
                        self.mark_unreachable();
                    }
                }
                WorkerStatus::Disabled => return,
                _ => {}
            }
        }
    }
}

#[async_trait]
impl WorkerDriver for FederationDriver {
    fn driver_type(&self) -> &'static str {
        "federation"
    }

    async fn init(&self, record: &Arc<WorkerRecord>) -> Result<(), GenError> {
        if !record.is_real() {
            // Shadows mirror the parent; nothing of their own to bring up.
            return Ok(());
        }
        {
            let mut parent = self.parent.lock().expect("parent poisoned");
            if parent.is_none() {
                *parent = Some(record.clone());
            }
        }
        let _ = record.set_status(WorkerStatus::Loading);

        match self.establish(record).await {
            Ok(()) => Ok(()),
            Err(GenError::LoopDetected) => {
                // A peer pointing back at this instance is a configuration
                // error; never retried, never probed.
                if self.settings.allow_idle {
                    let _ = record.set_status(WorkerStatus::Idle);
                } else {
                    let _ = record.set_status(WorkerStatus::Errored);
                }
                tracing::error!(peer = %self.settings.address, "federation loop detected");
                Err(GenError::LoopDetected)
            }
            Err(GenError::Connection(msg)) if self.settings.allow_idle => {
                tracing::info!(
                    peer = %self.settings.address,
                    "peer unreachable at init, parking idle: {msg}"
                );
                let _ = record.set_status(WorkerStatus::Idle);
                self.ensure_monitor();
                Ok(())
            }
            Err(err) => {
                let _ = record.set_status(WorkerStatus::Errored);
                Err(err)
            }
        }
    }

    async fn shutdown(&self, record: &Arc<WorkerRecord>) {
        if record.is_real() {
            if let Ok(dispatcher) = self.dispatcher() {
                let shadows: Vec<WorkerId> = {
                    let mut shadows = self.shadows.lock().expect("shadows poisoned");
                    std::mem::take(&mut *shadows)
                };
                for id in shadows {
                    if let Some(shadow) = dispatcher.remove_worker(id).await {
                        let _ = shadow.set_status(WorkerStatus::Disabled);
                    }
                }
            }
            self.state
                .lock()
                .expect("federation state poisoned")
                .session_id = None;
        }
        let _ = record.set_status(WorkerStatus::Disabled);
    }

    async fn load_model(
        &self,
        _record: &Arc<WorkerRecord>,
        _model: &str,
    ) -> Result<bool, GenError> {
        // The peer picks its own worker per request; the model rides along in
        // the forwarded request instead.
        Ok(true)
    }

    async fn generate_stream(
        &self,
        _record: &Arc<WorkerRecord>,
        request: &GenerateRequest,
        _batch_id: &str,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, GenError> {
        let peer = self.peer.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        let res = self
            .with_session(move |sid| {
                let peer = peer.clone();
                let request = request.clone();
                let sink = sink.clone();
                let cancel = cancel.clone();
                async move { peer.generate(&sid, &request, sink, &cancel).await }
            })
            .await;
        match res {
            Ok(()) => Ok(StreamEnd::Complete),
            Err(GenError::Connection(msg)) => {
                tracing::warn!(
                    peer = %self.settings.address,
                    "federated generate failed: {msg}; redirecting"
                );
                self.mark_unreachable();
                Ok(StreamEnd::Redirect)
            }
            Err(err) => Err(err),
        }
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("federation state poisoned")
            .remote_features
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::{
        FederationDriver, FederationSettings, NewSessionResponse, PeerApi, PeerBackendInfo,
    };
    use crate::api::GenerateRequest;
    use crate::dispatcher::Dispatcher;
    use crate::driver::{GenerateItem, StreamEnd, WorkerDriver};
    use crate::error::GenError;
    use crate::hooks::HookRegistry;
    use crate::record::{WorkerRecord, WorkerStatus};
    use crate::testing::png_image;

    struct FakePeer {
        server_id: String,
        reachable: AtomicBool,
        sessions_opened: AtomicU32,
        current_session: Mutex<Option<String>>,
        backends: Mutex<Vec<PeerBackendInfo>>,
        invalidate_generates: AtomicU32,
        generate_calls: AtomicU32,
    }

    impl FakePeer {
        fn new(server_id: &str) -> Arc<Self> {
            Arc::new(Self {
                server_id: server_id.to_string(),
                reachable: AtomicBool::new(true),
                sessions_opened: AtomicU32::new(0),
                current_session: Mutex::new(None),
                backends: Mutex::new(Vec::new()),
                invalidate_generates: AtomicU32::new(0),
                generate_calls: AtomicU32::new(0),
            })
        }

        fn set_backends(&self, statuses: &[&str]) {
            *self.backends.lock().unwrap() = statuses
                .iter()
                .map(|status| PeerBackendInfo {
                    status: status.to_string(),
                    backend_type: "api".to_string(),
                    features: vec!["sdxl".to_string()],
                })
                .collect();
        }

        fn check_session(&self, session_id: &str) -> Result<(), GenError> {
            match self.current_session.lock().unwrap().as_deref() {
                Some(sid) if sid == session_id => Ok(()),
                _ => Err(GenError::SessionInvalid),
            }
        }
    }

    #[async_trait]
    impl PeerApi for FakePeer {
        async fn new_session(&self) -> Result<NewSessionResponse, GenError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(GenError::Connection("peer unreachable".to_string()));
            }
            let n = self.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
            let session_id = format!("s{n}");
            *self.current_session.lock().unwrap() = Some(session_id.clone());
            let count_running = self
                .backends
                .lock()
                .unwrap()
                .iter()
                .filter(|b| b.status == "running")
                .count() as u32;
            Ok(NewSessionResponse {
                session_id,
                server_id: self.server_id.clone(),
                count_running,
            })
        }

        async fn list_backends(
            &self,
            session_id: &str,
        ) -> Result<Vec<PeerBackendInfo>, GenError> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(GenError::Connection("peer unreachable".to_string()));
            }
            self.check_session(session_id)?;
            Ok(self.backends.lock().unwrap().clone())
        }

        async fn generate(
            &self,
            session_id: &str,
            _request: &GenerateRequest,
            sink: mpsc::Sender<GenerateItem>,
            _cancel: &CancellationToken,
        ) -> Result<(), GenError> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(GenError::Connection("peer unreachable".to_string()));
            }
            let invalidate = self.invalidate_generates.load(Ordering::SeqCst);
            if invalidate > 0 {
                self.invalidate_generates.store(invalidate - 1, Ordering::SeqCst);
                return Err(GenError::SessionInvalid);
            }
            self.check_session(session_id)?;
            let _ = sink
                .send(GenerateItem::Progress(serde_json::json!({"percent": 100})))
                .await;
            let _ = sink.send(GenerateItem::Image(png_image())).await;
            Ok(())
        }
    }

    fn setup(
        peer: Arc<FakePeer>,
        allow_idle: bool,
        over_queue: u32,
    ) -> (Dispatcher, Arc<FederationDriver>, Arc<WorkerRecord>) {
        let (dispatcher, _init_rx) = Dispatcher::new(
            3,
            Duration::from_secs(20 * 60),
            HookRegistry::new(),
            CancellationToken::new(),
        );
        let settings = FederationSettings {
            address: Url::parse("http://peer:7801").unwrap(),
            allow_idle,
            over_queue,
            use_websocket: false,
            probe_interval: Duration::from_secs(60),
        };
        let driver =
            FederationDriver::with_peer(peer, settings, "local-server".to_string(), &dispatcher);
        let record = dispatcher.add_worker(
            driver.clone(),
            serde_json::json!({"address": "http://peer:7801"}),
        );
        (dispatcher, driver, record)
    }

    #[tokio::test]
    async fn init_mirrors_the_peer_pool() {
        let peer = FakePeer::new("peer-1");
        peer.set_backends(&["running", "running", "running"]);
        let (dispatcher, driver, record) = setup(peer.clone(), false, 1);

        driver.init(&record).await.unwrap();
        assert_eq!(record.status(), WorkerStatus::Running);
        assert!(driver.supported_features().contains("sdxl"));
        assert!(driver.remote_backend_types().contains("api"));
        assert!(!driver.peer_loading());
        // target = 3 - 1 + 1
        assert_eq!(driver.shadow_count(), 3);

        let shadows: Vec<_> = dispatcher
            .entries()
            .into_iter()
            .filter(|e| !e.record.is_real())
            .collect();
        assert_eq!(shadows.len(), 3);
        for shadow in shadows {
            assert_eq!(shadow.record.status(), WorkerStatus::Running);
            assert!(shadow.record.has_feature("sdxl"));
        }
    }

    #[tokio::test]
    async fn session_expiry_is_recovered_with_exactly_one_retry() {
        let peer = FakePeer::new("peer-1");
        peer.set_backends(&["running"]);
        let (_dispatcher, driver, record) = setup(peer.clone(), false, 0);
        driver.init(&record).await.unwrap();
        assert_eq!(peer.sessions_opened.load(Ordering::SeqCst), 1);

        peer.invalidate_generates.store(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let end = driver
            .generate_stream(&record, &GenerateRequest::default(), "b1", tx, &cancel)
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Complete);
        assert_eq!(peer.sessions_opened.load(Ordering::SeqCst), 2);
        assert_eq!(peer.generate_calls.load(Ordering::SeqCst), 2);

        let mut images = 0;
        while let Ok(item) = rx.try_recv() {
            if matches!(item, GenerateItem::Image(_)) {
                images += 1;
            }
        }
        assert_eq!(images, 1);
    }

    #[tokio::test]
    async fn second_invalidation_surfaces_as_redirect_and_marks_the_group() {
        let peer = FakePeer::new("peer-1");
        peer.set_backends(&["running", "running"]);
        let (_dispatcher, driver, record) = setup(peer.clone(), false, 0);
        driver.init(&record).await.unwrap();

        peer.invalidate_generates.store(2, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let end = driver
            .generate_stream(&record, &GenerateRequest::default(), "b1", tx, &cancel)
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Redirect);
        // Exactly one re-session was attempted, no retry storm.
        assert_eq!(peer.sessions_opened.load(Ordering::SeqCst), 2);
        assert_eq!(record.status(), WorkerStatus::Errored);
    }

    #[tokio::test]
    async fn loop_detection_fails_init_without_shadows() {
        let peer = FakePeer::new("local-server");
        peer.set_backends(&["running", "running"]);
        let (dispatcher, driver, record) = setup(peer.clone(), false, 0);

        let res = driver.init(&record).await;
        assert!(matches!(res, Err(GenError::LoopDetected)));
        assert_eq!(record.status(), WorkerStatus::Errored);
        assert_eq!(driver.shadow_count(), 0);
        assert_eq!(dispatcher.entries().len(), 1);
        assert_eq!(peer.sessions_opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shadow_row_shrinks_from_the_front() {
        let peer = FakePeer::new("peer-1");
        peer.set_backends(&["running", "running", "running"]);
        let (dispatcher, driver, record) = setup(peer.clone(), false, 1);
        driver.init(&record).await.unwrap();
        assert_eq!(driver.shadow_count(), 3);
        let before = driver.shadow_ids();

        peer.set_backends(&["running"]);
        driver.refresh().await.unwrap();

        // target = 1 - 1 + 1; the two oldest shadows are gone.
        assert_eq!(driver.shadow_ids(), before[2..].to_vec());
        let shadows = dispatcher
            .entries()
            .into_iter()
            .filter(|e| !e.record.is_real())
            .count();
        assert_eq!(shadows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn init_waits_out_loading_sub_workers() {
        let peer = FakePeer::new("peer-1");
        peer.set_backends(&["loading", "running"]);
        let (_dispatcher, driver, record) = setup(peer.clone(), false, 0);

        let init_driver = driver.clone();
        let init_record = record.clone();
        let init = tokio::spawn(async move { init_driver.init(&init_record).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(record.status(), WorkerStatus::Loading);
        assert!(driver.peer_loading());

        peer.set_backends(&["running", "running"]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        init.await.unwrap().unwrap();
        assert_eq!(record.status(), WorkerStatus::Running);
        assert_eq!(driver.shadow_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_peer_parks_idle_and_resumes_on_probe() {
        let peer = FakePeer::new("peer-1");
        peer.reachable.store(false, Ordering::SeqCst);
        let (dispatcher, driver, record) = setup(peer.clone(), true, 0);

        driver.init(&record).await.unwrap();
        assert_eq!(record.status(), WorkerStatus::Idle);
        assert_eq!(driver.shadow_count(), 0);

        peer.reachable.store(true, Ordering::SeqCst);
        peer.set_backends(&["running", "running"]);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(record.status(), WorkerStatus::Running);
        assert_eq!(driver.shadow_count(), 1);
        let shadows: Vec<_> = dispatcher
            .entries()
            .into_iter()
            .filter(|e| !e.record.is_real())
            .collect();
        assert_eq!(shadows.len(), 1);
        assert_eq!(shadows[0].record.status(), WorkerStatus::Running);
    }
}
