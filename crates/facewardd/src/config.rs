use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory of enrolled images, one identity per file.
    pub dataset_dir: PathBuf,
    /// Where the encoding cache blobs live.
    pub cache_dir: PathBuf,
    /// Where unknown-face evidence images are written.
    pub evidence_dir: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub tolerance: f32,
    /// Minimum time between two unknown-face alerts.
    pub alert_cooldown: Duration,
    /// Script run with the event JSON on stdin for every denial.
    pub alert_hook: Option<PathBuf>,
    /// Embedding helper command line.
    pub provider_cmd: String,
    /// Number of warmup frames to discard after opening the camera.
    pub warmup_frames: usize,
    /// Requester recorded on continuous-loop alerts.
    pub requester: String,
}

impl Config {
    /// Load configuration from `FACEWARD_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
        let xdg = |key: &str, fallback: &str| {
            var(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| Path::new(&home).join(fallback))
                .join("faceward")
        };
        let data_dir = xdg("XDG_DATA_HOME", ".local/share");
        let cache_root = xdg("XDG_CACHE_HOME", ".cache");

        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<f64>().ok());

        Self {
            camera_device: var("FACEWARD_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            dataset_dir: var("FACEWARD_DATASET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("dataset")),
            cache_dir: var("FACEWARD_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(cache_root),
            evidence_dir: var("FACEWARD_EVIDENCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("evidence")),
            tolerance: parsed("FACEWARD_TOLERANCE")
                .map(|t| t as f32)
                .filter(|t| *t > 0.0)
                .unwrap_or(faceward_core::DEFAULT_TOLERANCE),
            alert_cooldown: Duration::from_secs(
                var("FACEWARD_ALERT_COOLDOWN_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(30),
            ),
            alert_hook: var("FACEWARD_ALERT_HOOK")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            provider_cmd: var("FACEWARD_PROVIDER_CMD")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "faceward-embedder".to_string()),
            warmup_frames: var("FACEWARD_WARMUP_FRAMES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(4),
            requester: var("FACEWARD_REQUESTER").unwrap_or_else(|| "continuous-monitor".to_string()),
        }
    }
}
