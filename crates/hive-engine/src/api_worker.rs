//! Driver for a plain JSON-over-HTTP generation worker.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::GenerateRequest;
use crate::driver::{GenerateItem, ImagePayload, StreamEnd, WorkerDriver};
use crate::error::GenError;
use crate::record::{WorkerRecord, WorkerStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiWorkerSettings {
    /// Worker base URL, e.g. `http://127.0.0.1:7860`.
    pub address: Url,

    /// Capability tags configured for this worker, merged with whatever the
    /// worker reports at init.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    current_model: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoadModelRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoadModelResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    error_id: Option<String>,
}

/// A directly managed worker speaking a small JSON API: an info probe, a
/// model-load endpoint, and a blocking generate call that returns data URIs.
pub struct ApiWorkerDriver {
    http: reqwest::Client,
    settings: ApiWorkerSettings,
    probed_features: Mutex<BTreeSet<String>>,
}

impl ApiWorkerDriver {
    pub fn new(http: reqwest::Client, settings: ApiWorkerSettings) -> Self {
        let configured = settings.features.iter().cloned().collect();
        Self {
            http,
            settings,
            probed_features: Mutex::new(configured),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, GenError> {
        self.settings
            .address
            .join(path)
            .map_err(|err| GenError::Internal(anyhow::anyhow!("bad worker address: {err}")))
    }
}

#[async_trait]
impl WorkerDriver for ApiWorkerDriver {
    fn driver_type(&self) -> &'static str {
        "api"
    }

    async fn init(&self, record: &Arc<WorkerRecord>) -> Result<(), GenError> {
        let _ = record.set_status(WorkerStatus::Loading);

        let url = self.endpoint("api/info")?;
        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let _ = record.set_status(WorkerStatus::Errored);
            return Err(GenError::Connection(format!("http {status}: {body}")));
        }
        let info: InfoResponse = res
            .json()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;

        let mut features: BTreeSet<String> = self.settings.features.iter().cloned().collect();
        features.extend(info.features);
        *self.probed_features.lock().expect("features poisoned") = features.clone();

        record.set_features(features);
        record.set_current_model(info.current_model);
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
        let url = self.endpoint("api/models/load")?;
        let res = self
            .http
            .post(url)
            .json(&LoadModelRequest { model })
            .send()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GenError::Connection(format!("http {status}: {body}")));
        }
        let body: LoadModelResponse = res
            .json()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;
        Ok(body.success)
    }

    async fn generate_stream(
        &self,
        _record: &Arc<WorkerRecord>,
        request: &GenerateRequest,
        _batch_id: &str,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, GenError> {
        let url = self.endpoint("api/generate")?;

        let mut body = serde_json::Map::new();
        body.insert("images".to_string(), request.images.into());
        for (key, value) in &request.params {
            body.insert(key.clone(), value.clone());
        }
        if let Some(model) = &request.preferred_model {
            body.insert("model".to_string(), model.as_str().into());
        }

        let send = self.http.post(url).json(&body).send();
        let res = tokio::select! {
            res = send => res.map_err(|err| GenError::Connection(format!("{err:#}")))?,
            _ = cancel.cancelled() => return Err(GenError::Cancelled),
        };
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GenError::Connection(format!("http {status}: {body}")));
        }
        let body: GenerateResponse = res
            .json()
            .await
            .map_err(|err| GenError::Connection(format!("{err:#}")))?;

        if let Some(error_id) = body.error_id {
            return Err(GenError::Internal(anyhow::anyhow!(
                "worker refused generation: {error_id}"
            )));
        }

        for uri in &body.images {
            let image = ImagePayload::from_data_uri(uri)?;
            if sink.send(GenerateItem::Image(image)).await.is_err() {
                return Err(GenError::Cancelled);
            }
        }
        Ok(StreamEnd::Complete)
    }

    fn supported_features(&self) -> BTreeSet<String> {
        self.probed_features
            .lock()
            .expect("features poisoned")
            .clone()
    }
}
