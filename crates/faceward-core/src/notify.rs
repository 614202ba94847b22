//! Outbound access notifications.
//!
//! The core only builds [`AccessEvent`]s; delivery (mail, hooks, evidence
//! files) belongs to the embedding application. Delivery is best-effort:
//! callers log a [`NotifyError`] and carry on.

use crate::types::AccessEvent;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error("evidence could not be stored: {0}")]
    Evidence(String),
    #[error("notification io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Notifier: Send + Sync {
    fn send(&self, event: &AccessEvent) -> Result<(), NotifyError>;
}

/// Records every event in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, event: &AccessEvent) -> Result<(), NotifyError> {
        if event.outcome.is_verified() {
            tracing::info!(
                event_id = %event.id,
                requester = %event.requester,
                recognized = %event.recognized,
                "{}",
                event.message
            );
        } else {
            tracing::warn!(
                event_id = %event.id,
                requester = %event.requester,
                evidence = event.evidence.is_some(),
                "{}",
                event.message
            );
        }
        Ok(())
    }
}

/// Send and swallow: delivery failures are logged, never returned.
pub(crate) fn deliver(notifier: &dyn Notifier, event: &AccessEvent) {
    if let Err(e) = notifier.send(event) {
        tracing::warn!(event_id = %event.id, error = %e, "access notification not delivered");
    }
}
