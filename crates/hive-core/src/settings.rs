use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level dispatch settings, persisted as JSON in the user config dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// How many times a worker's `init` is retried before it stays errored.
    #[serde(default = "default_max_init_attempts")]
    pub max_init_attempts: u32,

    /// Inactivity threshold: a worker holding a generation without emitting
    /// progress for this long is declared failed.
    #[serde(default = "default_max_timeout_minutes")]
    pub max_timeout_minutes: u64,

    /// Upper bound on how long a request may wait for a worker, queueing
    /// included.
    #[serde(default = "default_per_request_timeout_minutes")]
    pub per_request_timeout_minutes: u64,

    /// Directly managed workers.
    #[serde(default)]
    pub workers: Vec<WorkerEntry>,

    /// Peer instances whose pools are mirrored into this one.
    #[serde(default)]
    pub federation: Vec<FederationEntry>,
}

/// One configured worker. The `settings` record is opaque here and decoded
/// per `driver_type` by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEntry {
    #[serde(rename = "type")]
    pub driver_type: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// One federated peer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationEntry {
    /// Peer base address, e.g. `http://10.0.0.7:7801`.
    pub address: String,

    /// When the peer is unreachable at init, park the driver as idle and
    /// re-probe instead of marking it errored.
    #[serde(default)]
    pub allow_idle: bool,

    /// Extra shadow slots to synthesize beyond the peer's running count.
    #[serde(default)]
    pub over_queue: u32,

    /// Stream generations over the peer's websocket endpoint; fall back to
    /// the plain HTTP endpoint when disabled.
    #[serde(default = "default_true")]
    pub use_websocket: bool,

    /// Seconds between idle re-probes and running-pool refreshes.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_max_init_attempts() -> u32 {
    3
}

fn default_max_timeout_minutes() -> u64 {
    20
}

fn default_per_request_timeout_minutes() -> u64 {
    10_080
}

fn default_true() -> bool {
    true
}

fn default_probe_interval_secs() -> u64 {
    60
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_init_attempts: default_max_init_attempts(),
            max_timeout_minutes: default_max_timeout_minutes(),
            per_request_timeout_minutes: default_per_request_timeout_minutes(),
            workers: Vec::new(),
            federation: Vec::new(),
        }
    }
}

impl DispatchSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.per_request_timeout_minutes.max(1) * 60)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_minutes.max(1) * 60)
    }

    fn normalize(&mut self) {
        if self.max_init_attempts == 0 {
            self.max_init_attempts = default_max_init_attempts();
        }
        for entry in &mut self.federation {
            entry.address = entry.address.trim().to_string();
        }
        self.federation.retain(|entry| !entry.address.is_empty());
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("imagehive").join("config.json"))
}

pub fn load_settings() -> anyhow::Result<Option<DispatchSettings>> {
    let path = settings_path()?;
    load_settings_from(&path)
}

pub fn load_settings_from(path: &std::path::Path) -> anyhow::Result<Option<DispatchSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut cfg: DispatchSettings = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

pub fn save_settings(cfg: &DispatchSettings) -> anyhow::Result<()> {
    let path = settings_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::DispatchSettings;

    #[test]
    fn defaults_match_documented_values() {
        let cfg: DispatchSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_init_attempts, 3);
        assert_eq!(cfg.max_timeout_minutes, 20);
        assert_eq!(cfg.per_request_timeout_minutes, 10_080);
        assert!(cfg.workers.is_empty());
        assert!(cfg.federation.is_empty());
    }

    #[test]
    fn normalize_drops_blank_federation_entries() {
        let raw = r#"{
            "federation": [
                {"address": "  http://peer:7801 "},
                {"address": "   "}
            ]
        }"#;
        let mut cfg: DispatchSettings = serde_json::from_str(raw).unwrap();
        cfg.normalize();
        assert_eq!(cfg.federation.len(), 1);
        assert_eq!(cfg.federation[0].address, "http://peer:7801");
        assert!(cfg.federation[0].use_websocket);
        assert_eq!(cfg.federation[0].over_queue, 0);
    }

    #[test]
    fn timeouts_convert_to_durations() {
        let cfg = DispatchSettings::default();
        assert_eq!(cfg.inactivity_timeout().as_secs(), 20 * 60);
        assert_eq!(cfg.acquire_timeout().as_secs(), 10_080 * 60);
    }
}
