mod cli;
mod output;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;

use imagehive_core::settings::{self, DispatchSettings, WorkerEntry};
use imagehive_engine::{
    EngineConfig, EngineEvent, GenerateRequest, OutputSink, StopHandle, start_engine,
};

use crate::cli::Cli;
use crate::output::FileOutputSink;

fn load_settings(cli: &Cli) -> anyhow::Result<DispatchSettings> {
    let loaded = match &cli.config {
        Some(path) => settings::load_settings_from(path)?,
        None => settings::load_settings()?,
    };
    let mut loaded = loaded.unwrap_or_default();

    if let Some(url) = &cli.worker_url {
        loaded.workers.push(WorkerEntry {
            driver_type: "api".to_string(),
            settings: serde_json::json!({
                "address": url,
                "features": cli.worker_features,
            }),
        });
    }
    Ok(loaded)
}

/// First Ctrl-C asks the engine to drain; a second one gives up waiting.
fn spawn_interrupt_watcher(stop: StopHandle) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if !stop.request_stop() {
                std::process::exit(130);
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let dispatch_settings = load_settings(&cli)?;
    if dispatch_settings.workers.is_empty() && dispatch_settings.federation.is_empty() {
        tracing::warn!("no workers configured; requests will queue until the pool is populated");
    }

    let engine = start_engine(EngineConfig::new(dispatch_settings))?;
    spawn_interrupt_watcher(engine.stop_handle());

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Warning { message }) => tracing::warn!("{message}"),
                Ok(EngineEvent::Error { message }) => tracing::error!("{message}"),
                Ok(EngineEvent::WorkerStatusChanged { worker, status }) => {
                    tracing::info!(worker = %worker, status = %status, "worker status changed");
                }
                Ok(EngineEvent::Stopped) => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    });

    if let Some(prompt) = &cli.prompt {
        let sink: Arc<dyn OutputSink> =
            Arc::new(FileOutputSink::new(cli.out_dir.clone(), cli.user.clone()));
        let mut params = serde_json::Map::new();
        params.insert("prompt".to_string(), prompt.as_str().into());
        let request = GenerateRequest {
            user_id: cli.user.clone(),
            preferred_model: cli.model.clone(),
            required_features: cli.require.iter().cloned().collect(),
            images: cli.images.max(1),
            params,
        };

        // An interrupt cancels the claim through the engine's stop signal,
        // so this unwinds on its own.
        let outcome = engine.generate(request, sink).await;

        engine.request_stop();
        engine.wait().await?;

        if let Some(error) = &outcome.error {
            anyhow::bail!("{error}");
        }
        println!(
            "saved {} image(s) to {}",
            outcome.images_saved,
            cli.out_dir.display()
        );
        return Ok(());
    }

    tracing::info!(
        "imagehive {} running; press Ctrl-C to stop",
        env!("CARGO_PKG_VERSION")
    );
    engine.wait().await
}
