use std::path::PathBuf;

use clap::Parser;
use url::Url;

#[derive(Debug, Clone, Parser)]
#[command(name = "imagehive", version, about = "Multi-backend image generation dispatcher")]
pub struct Cli {
    /// One-shot prompt: generate and exit. Without it the engine runs as a
    /// service until interrupted.
    pub prompt: Option<String>,

    /// Settings file to load instead of the default config path.
    #[arg(long, env = "IMAGEHIVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Register a single API worker at this URL, in addition to whatever the
    /// settings file configures.
    #[arg(long, env = "IMAGEHIVE_WORKER_URL")]
    pub worker_url: Option<Url>,

    /// Capability tags assumed for `--worker-url`.
    #[arg(long = "worker-feature", value_name = "TAG")]
    pub worker_features: Vec<String>,

    /// Capability tags the serving worker must carry.
    #[arg(long = "require", value_name = "TAG")]
    pub require: Vec<String>,

    /// Model to prefer when several workers match.
    #[arg(long, env = "IMAGEHIVE_MODEL")]
    pub model: Option<String>,

    /// Number of images to request.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub images: u32,

    /// Directory where accepted images are written.
    #[arg(short = 'o', long, env = "IMAGEHIVE_OUT_DIR", default_value = "images")]
    pub out_dir: PathBuf,

    /// Caller identity attached to requests.
    #[arg(long, default_value = "cli")]
    pub user: String,
}
