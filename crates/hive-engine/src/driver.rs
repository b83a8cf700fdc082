//! The capability interface every worker driver implements.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::GenerateRequest;
use crate::error::GenError;
use crate::record::WorkerRecord;

/// A produced image, decoded from the driver's wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub data: Vec<u8>,
    pub mime: String,
}

impl ImagePayload {
    /// Parse a `data:<mime>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> Result<Self, GenError> {
        let rest = uri
            .strip_prefix("data:")
            .ok_or_else(|| GenError::Internal(anyhow::anyhow!("image is not a data URI")))?;
        let (mime, payload) = rest
            .split_once(";base64,")
            .ok_or_else(|| GenError::Internal(anyhow::anyhow!("image data URI is not base64")))?;
        let data = B64
            .decode(payload.as_bytes())
            .map_err(|err| GenError::Internal(anyhow::anyhow!("bad image payload: {err}")))?;
        Ok(Self {
            data,
            mime: mime.to_string(),
        })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, B64.encode(&self.data))
    }

    /// File extension implied by the mime type.
    pub fn extension(&self) -> &str {
        match self.mime.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "png",
        }
    }
}

/// One item streamed out of a driver during generation.
#[derive(Debug, Clone)]
pub enum GenerateItem {
    /// Opaque progress object, forwarded to the caller as-is.
    Progress(serde_json::Value),
    /// A finished image.
    Image(ImagePayload),
}

/// How a generation stream ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The driver emitted everything it will emit.
    Complete,
    /// The driver asks the pipeline to re-issue the same logical generation
    /// on a different worker.
    Redirect,
}

/// Adapter over one generation worker.
///
/// Shared state (status, current model, busy flag) lives on the
/// [`WorkerRecord`] passed into each call, not on the driver: a federation
/// driver serves its parent record and every shadow record through the same
/// instance.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    /// Tag naming this driver variant, e.g. `"api"` or `"swarm"`.
    fn driver_type(&self) -> &'static str;

    /// Bring the worker up: `Disabled -> Loading -> (Running | Idle |
    /// Errored)` on the record. Must be idempotent under retry.
    async fn init(&self, record: &Arc<WorkerRecord>) -> Result<(), GenError>;

    /// Release all resources and transition the record to `Disabled`.
    /// Tolerates being called from any non-terminal state.
    async fn shutdown(&self, record: &Arc<WorkerRecord>);

    /// Load `model` on the worker. Returns false when the worker refused.
    /// Drivers that manage their own model state may no-op with `Ok(true)`.
    async fn load_model(&self, record: &Arc<WorkerRecord>, model: &str)
        -> Result<bool, GenError>;

    /// Stream progress objects and image payloads into `sink` until the
    /// terminal end-of-stream. Must honor `cancel` by stopping promptly.
    /// The record's busy flag is owned by the dispatcher's access guard;
    /// drivers never touch it.
    async fn generate_stream(
        &self,
        record: &Arc<WorkerRecord>,
        request: &GenerateRequest,
        batch_id: &str,
        sink: mpsc::Sender<GenerateItem>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, GenError>;

    /// Snapshot of the capability tags this driver supports.
    fn supported_features(&self) -> BTreeSet<String>;
}

#[cfg(test)]
mod tests {
    use super::ImagePayload;

    #[test]
    fn data_uri_round_trip() {
        let img = ImagePayload {
            data: vec![1, 2, 3, 255],
            mime: "image/png".to_string(),
        };
        let uri = img.to_data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(ImagePayload::from_data_uri(&uri).unwrap(), img);
    }

    #[test]
    fn rejects_non_data_uris() {
        assert!(ImagePayload::from_data_uri("https://host/img.png").is_err());
        assert!(ImagePayload::from_data_uri("data:image/png;base64,!!!").is_err());
        assert!(ImagePayload::from_data_uri("data:image/png,plain").is_err());
    }

    #[test]
    fn extension_follows_mime() {
        let mut img = ImagePayload {
            data: Vec::new(),
            mime: "image/jpeg".to_string(),
        };
        assert_eq!(img.extension(), "jpg");
        img.mime = "image/png".to_string();
        assert_eq!(img.extension(), "png");
    }
}
