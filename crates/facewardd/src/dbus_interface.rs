use faceward_core::{
    DatasetLoader, RecognitionSession, SessionStatus, StopStatus, VerificationOutcome,
    VerificationService,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceward.Faceward1";
pub const OBJECT_PATH: &str = "/org/faceward/Faceward1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ReplyStatus {
    Success,
    Warning,
    Error,
}

fn reply(status: ReplyStatus, message: &str) -> String {
    serde_json::json!({ "status": status, "message": message }).to_string()
}

#[derive(Serialize)]
struct VerifyReply<'a> {
    status: ReplyStatus,
    verified: bool,
    identity: &'a str,
    message: String,
    #[serde(flatten)]
    outcome: &'a VerificationOutcome,
}

fn verify_reply(outcome: &VerificationOutcome) -> serde_json::Result<String> {
    let status = if outcome.is_verified() {
        ReplyStatus::Success
    } else {
        ReplyStatus::Warning
    };
    serde_json::to_string(&VerifyReply {
        status,
        verified: outcome.is_verified(),
        identity: outcome.identity(),
        message: outcome.message(),
        outcome,
    })
}

fn join_error(e: tokio::task::JoinError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("worker task failed: {e}"))
}

/// D-Bus interface for the Faceward daemon.
///
/// Bus name: org.faceward.Faceward1
/// Object path: /org/faceward/Faceward1
///
/// Session control blocks on thread joins and device I/O, so every call runs
/// on the blocking pool.
pub struct FacewardService {
    session: Arc<RecognitionSession>,
    verifier: Arc<VerificationService>,
    loader: Arc<DatasetLoader>,
    dataset_dir: PathBuf,
}

impl FacewardService {
    pub fn new(
        session: Arc<RecognitionSession>,
        verifier: Arc<VerificationService>,
        loader: Arc<DatasetLoader>,
        dataset_dir: PathBuf,
    ) -> Self {
        Self {
            session,
            verifier,
            loader,
            dataset_dir,
        }
    }
}

#[interface(name = "org.faceward.Faceward1")]
impl FacewardService {
    /// Start continuous recognition, restarting it if already running.
    async fn start_recognition(&self) -> zbus::fdo::Result<String> {
        tracing::info!("start_recognition requested");
        let session = Arc::clone(&self.session);
        let started = tokio::task::spawn_blocking(move || session.start())
            .await
            .map_err(join_error)?;
        Ok(match started {
            Ok(()) => reply(ReplyStatus::Success, "Face recognition started"),
            Err(e) => {
                tracing::warn!(error = %e, "recognition session failed to start");
                reply(ReplyStatus::Error, &e.to_string())
            }
        })
    }

    /// Stop continuous recognition. Stopping an idle session is a warning.
    async fn stop_recognition(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop_recognition requested");
        let session = Arc::clone(&self.session);
        let stopped = tokio::task::spawn_blocking(move || session.stop())
            .await
            .map_err(join_error)?;
        Ok(match stopped {
            StopStatus::Stopped => reply(ReplyStatus::Success, "Face recognition stopped"),
            StopStatus::NotRunning => reply(ReplyStatus::Warning, "Face recognition is not running"),
        })
    }

    /// Verify the face in an image file on behalf of `requester`.
    async fn verify(&self, image_path: &str, requester: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, requester, "verify requested");
        let path = PathBuf::from(image_path);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            zbus::fdo::Error::FileNotFound(format!("{}: {e}", path.display()))
        })?;

        let verifier = Arc::clone(&self.verifier);
        let requester = requester.to_string();
        let outcome = tokio::task::spawn_blocking(move || verifier.verify_image(&bytes, &requester))
            .await
            .map_err(join_error)?;
        verify_reply(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Re-read the dataset and swap in the new store.
    async fn reload_dataset(&self) -> zbus::fdo::Result<String> {
        tracing::info!(dataset = %self.dataset_dir.display(), "reload_dataset requested");
        let loader = Arc::clone(&self.loader);
        let dir = self.dataset_dir.clone();
        let store = tokio::task::spawn_blocking(move || loader.load(&dir))
            .await
            .map_err(join_error)?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        let profiles = store.len();
        self.verifier.gallery().replace(store);
        Ok(reply(
            ReplyStatus::Success,
            &format!("Loaded {profiles} known faces"),
        ))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let recognition = match self.session.status() {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
        };
        let store = self.verifier.gallery().snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "recognition": recognition,
            "profiles": store.len(),
            "names": store.names(),
            "dataset": self.dataset_dir.display().to_string(),
            "tolerance": self.verifier.tolerance(),
        })
        .to_string())
    }
}
