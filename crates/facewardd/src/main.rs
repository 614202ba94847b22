use anyhow::{Context, Result};
use faceward_core::{
    DatasetLoader, DisplayOverlay, EmbeddingProvider, EuclideanMatcher, FsBlobCache, Gallery,
    HeadlessOverlay, RecognitionSession, SessionSettings, Sha256Hasher, SpectralAnalyzer,
    VerificationService,
};
use faceward_hw::V4l2Device;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod notify;
mod sidecar;

use config::Config;
use dbus_interface::{FacewardService, BUS_NAME, OBJECT_PATH};
use notify::EvidenceNotifier;
use sidecar::SidecarProvider;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        dataset = %config.dataset_dir.display(),
        cache = %config.cache_dir.display(),
        provider = %config.provider_cmd,
        "facewardd starting"
    );

    let provider: Arc<dyn EmbeddingProvider> = Arc::new(SidecarProvider::new(&config.provider_cmd));
    let loader = Arc::new(DatasetLoader::new(
        Arc::clone(&provider),
        Arc::new(Sha256Hasher),
        Arc::new(FsBlobCache::new(&config.cache_dir)),
    ));

    // Fail fast: without known faces every verification would be a denial.
    let store = {
        let loader = Arc::clone(&loader);
        let dataset = config.dataset_dir.clone();
        tokio::task::spawn_blocking(move || loader.load(&dataset))
            .await?
            .with_context(|| format!("loading dataset {}", config.dataset_dir.display()))?
    };
    tracing::info!(profiles = store.len(), "known faces loaded");

    let verifier = Arc::new(VerificationService::new(
        provider,
        Arc::new(SpectralAnalyzer::new()),
        Arc::new(EuclideanMatcher),
        Arc::new(Gallery::new(store)),
        Arc::new(EvidenceNotifier::new(
            &config.evidence_dir,
            config.alert_hook.clone(),
        )),
        config.tolerance,
    ));

    let session = Arc::new(RecognitionSession::new(
        Arc::new(V4l2Device::new(&config.camera_device)),
        Arc::clone(&verifier),
        Arc::new(|| Box::new(HeadlessOverlay::new()) as Box<dyn DisplayOverlay>),
        SessionSettings {
            requester: config.requester.clone(),
            warmup_frames: config.warmup_frames,
            alert_cooldown: config.alert_cooldown,
        },
    ));

    let service = FacewardService::new(
        Arc::clone(&session),
        verifier,
        loader,
        config.dataset_dir.clone(),
    );
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the D-Bus session bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "facewardd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facewardd shutting down");

    // Release the camera before exiting.
    tokio::task::spawn_blocking(move || session.stop()).await?;

    Ok(())
}
