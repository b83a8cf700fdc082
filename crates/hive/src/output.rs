use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use imagehive_engine::{GenError, GenerateRequest, ImagePayload, OutputSink, ProgressUpdate};

/// Output sink writing accepted images (plus a metadata sidecar) into a
/// directory and reporting progress through tracing.
pub struct FileOutputSink {
    out_dir: PathBuf,
    user: String,
    counter: AtomicU32,
}

impl FileOutputSink {
    pub fn new(out_dir: PathBuf, user: String) -> Self {
        Self {
            out_dir,
            user,
            counter: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl OutputSink for FileOutputSink {
    async fn emit(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::WaitingForWorker => tracing::info!("waiting for a worker"),
            ProgressUpdate::WillLoadModel { model } => {
                tracing::info!(model, "worker is loading the requested model");
            }
            ProgressUpdate::GenProgress { gen_progress } => {
                tracing::debug!(progress = %gen_progress, "generation progress");
            }
            ProgressUpdate::ImageSaved { index } => {
                tracing::info!(index, "image accepted");
            }
            ProgressUpdate::Timing { message } => println!("{message}"),
        }
    }

    async fn apply_metadata(
        &self,
        image: ImagePayload,
        request: &GenerateRequest,
        index: u32,
    ) -> (ImagePayload, String) {
        let metadata = serde_json::json!({
            "user": self.user,
            "index": index,
            "model": request.preferred_model,
            "prompt": request.params.get("prompt"),
            "generated_at": Utc::now().timestamp(),
        });
        (image, metadata.to_string())
    }

    async fn save_image(&self, image: ImagePayload, metadata: String) -> Result<(), GenError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{n:03}.{}", Utc::now().timestamp(), image.extension());
        let path = self.out_dir.join(name);
        let meta_path = path.with_extension("json");
        let dir = self.out_dir.clone();

        let written = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&path, &image.data)?;
            std::fs::write(&meta_path, metadata.as_bytes())?;
            Ok(path)
        })
        .await
        .map_err(|err| GenError::Internal(anyhow::anyhow!("save image task: {err:#}")))?
        .map_err(GenError::Internal)?;

        tracing::info!(path = %written.display(), "image written");
        Ok(())
    }

    async fn set_error(&self, message: String) {
        eprintln!("{message}");
    }
}
