//! Evidence files and the alert hook.

use chrono::Local;
use faceward_core::{AccessEvent, LogNotifier, Notifier, NotifyError};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Payload written to the hook's stdin.
#[derive(Serialize)]
struct HookPayload<'a> {
    #[serde(flatten)]
    event: &'a AccessEvent,
    evidence_path: Option<&'a Path>,
}

/// Stores evidence for denied access and hands the event to an external hook
/// (e.g. a mail script).
///
/// Verified events are only logged.
pub struct EvidenceNotifier {
    evidence_dir: PathBuf,
    hook: Option<PathBuf>,
}

impl EvidenceNotifier {
    pub fn new(evidence_dir: impl Into<PathBuf>, hook: Option<PathBuf>) -> Self {
        Self {
            evidence_dir: evidence_dir.into(),
            hook,
        }
    }

    /// Write the evidence frame as `unknown_face_<YYYYmmdd_HHMMSS>.jpg`.
    fn store_evidence(&self, event: &AccessEvent) -> Result<Option<PathBuf>, NotifyError> {
        let Some(frame) = event.evidence.as_ref() else {
            return Ok(None);
        };
        std::fs::create_dir_all(&self.evidence_dir)?;

        let stamp = event.timestamp.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        let mut path = self.evidence_dir.join(format!("unknown_face_{stamp}.jpg"));
        if path.exists() {
            // Two alerts in the same second.
            let id = event.id.simple().to_string();
            path = self
                .evidence_dir
                .join(format!("unknown_face_{stamp}_{}.jpg", &id[..8]));
        }

        let image = frame
            .to_luma_image()
            .map_err(|e| NotifyError::Evidence(e.to_string()))?;
        image
            .save(&path)
            .map_err(|e| NotifyError::Evidence(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), event_id = %event.id, "evidence saved");
        Ok(Some(path))
    }

    /// Start the hook and return. The hook is reaped on its own thread, so a
    /// stuck script never stalls the caller.
    fn run_hook(
        &self,
        hook: &Path,
        event: &AccessEvent,
        evidence: Option<&Path>,
    ) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(&HookPayload {
            event,
            evidence_path: evidence,
        })
        .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let mut child = Command::new(hook)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| NotifyError::Delivery(format!("{}: {e}", hook.display())))?;

        let hook = hook.display().to_string();
        let event_id = event.id;
        std::thread::Builder::new()
            .name("faceward-alert-hook".into())
            .spawn(move || {
                if let Some(mut stdin) = child.stdin.take() {
                    if let Err(e) = stdin.write_all(&payload) {
                        tracing::warn!(hook = %hook, error = %e, "could not write event to alert hook");
                    }
                }
                match child.wait() {
                    Ok(status) if status.success() => {
                        tracing::debug!(hook = %hook, %event_id, "alert hook completed");
                    }
                    Ok(status) => {
                        tracing::warn!(hook = %hook, %event_id, %status, "alert hook failed");
                    }
                    Err(e) => tracing::warn!(hook = %hook, error = %e, "alert hook wait failed"),
                }
            })?;
        Ok(())
    }
}

impl Notifier for EvidenceNotifier {
    fn send(&self, event: &AccessEvent) -> Result<(), NotifyError> {
        LogNotifier.send(event)?;
        if event.outcome.is_verified() {
            return Ok(());
        }

        let evidence = self.store_evidence(event)?;
        match &self.hook {
            Some(hook) => self.run_hook(hook, event, evidence.as_deref()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceward_core::{DenyReason, VerificationOutcome};
    use faceward_hw::Frame;
    use std::time::{Duration, Instant};

    fn denied_with_evidence() -> AccessEvent {
        AccessEvent::new(
            "continuous-monitor",
            VerificationOutcome::denied(DenyReason::NotRecognized),
            Some(Frame::new(vec![77; 16 * 12], 16, 12).unwrap()),
        )
    }

    fn jpgs(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default();
        files.retain(|p| p.extension().is_some_and(|e| e == "jpg"));
        files
    }

    fn executable_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hook.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// The hook runs in the background; poll until it has written a full document.
    fn wait_for_json(path: &Path) -> serde_json::Value {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(value) = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
            {
                return value;
            }
            assert!(Instant::now() < deadline, "hook never wrote {}", path.display());
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_denied_event_writes_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = EvidenceNotifier::new(dir.path().join("evidence"), None);
        notifier.send(&denied_with_evidence()).unwrap();

        let files = jpgs(&dir.path().join("evidence"));
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("unknown_face_"));

        let img = image::open(&files[0]).unwrap();
        assert_eq!((img.width(), img.height()), (16, 12));
    }

    #[test]
    fn test_same_second_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = EvidenceNotifier::new(dir.path(), None);
        let mut second = denied_with_evidence();
        let first = denied_with_evidence();
        second.timestamp = first.timestamp;
        notifier.send(&first).unwrap();
        notifier.send(&second).unwrap();
        assert_eq!(jpgs(dir.path()).len(), 2);
    }

    #[test]
    fn test_verified_event_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = EvidenceNotifier::new(dir.path(), Some(PathBuf::from("/nonexistent/hook")));
        let event = AccessEvent::new(
            "door",
            VerificationOutcome::Verified {
                name: "alice".into(),
                confidence: 80.0,
            },
            Some(Frame::new(vec![1; 4], 2, 2).unwrap()),
        );
        notifier.send(&event).unwrap();
        assert!(jpgs(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_hook_is_delivery_failure() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = EvidenceNotifier::new(dir.path(), Some(PathBuf::from("/nonexistent/hook")));
        assert!(matches!(
            notifier.send(&denied_with_evidence()),
            Err(NotifyError::Delivery(_))
        ));
    }

    #[test]
    fn test_hook_receives_event_json() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("payload.json");
        let hook = executable_script(dir.path(), &format!("cat > '{}'", out.display()));

        let notifier = EvidenceNotifier::new(dir.path().join("evidence"), Some(hook));
        notifier.send(&denied_with_evidence()).unwrap();

        let payload = wait_for_json(&out);
        assert_eq!(payload["recognized"], "Unknown");
        assert_eq!(payload["requester"], "continuous-monitor");
        assert_eq!(payload["outcome"]["outcome"], "denied");
        assert!(payload["evidence_path"]
            .as_str()
            .is_some_and(|p| p.contains("unknown_face_")));
    }

    #[test]
    fn test_stuck_hook_does_not_block_send() {
        let dir = tempfile::tempdir().unwrap();
        let hook = executable_script(dir.path(), "sleep 30");
        let notifier = EvidenceNotifier::new(dir.path().join("evidence"), Some(hook));

        let started = Instant::now();
        notifier.send(&denied_with_evidence()).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(jpgs(&dir.path().join("evidence")).len(), 1);
    }
}
