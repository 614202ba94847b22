//! Single-shot verification: one frame in, one outcome out.

use crate::liveness::{exceeds_spoof_gate, LivenessAnalyzer};
use crate::matcher::Matcher;
use crate::notify::{deliver, Notifier};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::Gallery;
use crate::types::{
    AccessEvent, BoundingBox, DenyReason, LabeledFace, VerificationOutcome,
};
use faceward_hw::Frame;
use std::sync::Arc;

/// Faces in one frame after liveness and matching.
#[derive(Debug, Clone, Default)]
pub struct FrameLabels {
    pub faces: Vec<LabeledFace>,
    /// The frame was judged a screen presentation; every face is unknown.
    pub spoof: bool,
}

impl FrameLabels {
    pub fn has_unknown(&self) -> bool {
        self.faces.iter().any(LabeledFace::is_unknown)
    }
}

/// Orchestrates liveness, embedding and matching against the current gallery.
///
/// Holds no per-request state, so concurrent `verify` calls are independent.
pub struct VerificationService {
    provider: Arc<dyn EmbeddingProvider>,
    liveness: Arc<dyn LivenessAnalyzer>,
    matcher: Arc<dyn Matcher>,
    gallery: Arc<Gallery>,
    notifier: Arc<dyn Notifier>,
    tolerance: f32,
}

impl VerificationService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        liveness: Arc<dyn LivenessAnalyzer>,
        matcher: Arc<dyn Matcher>,
        gallery: Arc<Gallery>,
        notifier: Arc<dyn Notifier>,
        tolerance: f32,
    ) -> Self {
        Self {
            provider,
            liveness,
            matcher,
            gallery,
            notifier,
            tolerance,
        }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Verify the single subject in `frame` and report the outcome to the notifier.
    pub fn verify(&self, frame: &Frame, requester: &str) -> VerificationOutcome {
        let outcome = self.evaluate(frame);
        tracing::info!(
            requester,
            verified = outcome.is_verified(),
            identity = outcome.identity(),
            "verification complete"
        );
        deliver(
            self.notifier.as_ref(),
            &AccessEvent::new(requester, outcome.clone(), Some(frame.clone())),
        );
        outcome
    }

    /// Verify an encoded JPEG/PNG image. Undecodable input is a `DecodeError` denial.
    pub fn verify_image(&self, bytes: &[u8], requester: &str) -> VerificationOutcome {
        match Frame::decode(bytes) {
            Ok(frame) => self.verify(&frame, requester),
            Err(e) => {
                tracing::warn!(requester, error = %e, "verification image could not be decoded");
                let outcome = VerificationOutcome::denied(DenyReason::DecodeError);
                deliver(
                    self.notifier.as_ref(),
                    &AccessEvent::new(requester, outcome.clone(), None),
                );
                outcome
            }
        }
    }

    fn evaluate(&self, frame: &Frame) -> VerificationOutcome {
        let boxes = match self.provider.locate_faces(frame) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "face localization failed");
                return VerificationOutcome::denied(DenyReason::DecodeError);
            }
        };
        let Some(subject) = boxes.first() else {
            return VerificationOutcome::denied(DenyReason::NoFace);
        };

        let assessment = self.liveness.assess(frame);
        if exceeds_spoof_gate(assessment.combined_confidence) {
            tracing::warn!(
                combined = assessment.combined_confidence,
                peak_ratio = assessment.peak_ratio,
                grid = assessment.grid_score,
                periodic = assessment.periodic_score,
                "screen presentation suspected"
            );
            return VerificationOutcome::denied(DenyReason::ScreenSpoof);
        }

        let probe = match self.provider.encode_faces(frame, std::slice::from_ref(subject)) {
            Ok(embeddings) => embeddings.into_iter().next(),
            Err(e) => {
                tracing::warn!(error = %e, "face encoding failed");
                None
            }
        };
        let Some(probe) = probe else {
            return VerificationOutcome::denied(DenyReason::DecodeError);
        };

        let store = self.gallery.snapshot();
        let result = self.matcher.compare(&probe, &store, self.tolerance);
        tracing::debug!(candidates = result.confidences.len(), distance = ?result.distance, "match scored");
        match (result.name.clone(), result.confidence()) {
            (Some(name), Some(confidence)) => VerificationOutcome::Verified { name, confidence },
            _ => VerificationOutcome::denied(DenyReason::NotRecognized),
        }
    }

    pub(crate) fn locate(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError> {
        self.provider.locate_faces(frame)
    }

    /// Label every face located in `small`, a downsampled copy of `frame`.
    ///
    /// Liveness runs once, on the full-resolution `frame`: shrinking averages
    /// away the pixel-grid frequencies it looks for. Encoding uses `small`,
    /// the frame `boxes` refer to.
    pub(crate) fn label_faces(
        &self,
        frame: &Frame,
        small: &Frame,
        boxes: &[BoundingBox],
    ) -> FrameLabels {
        if boxes.is_empty() {
            return FrameLabels::default();
        }

        let unknown = |spoof| FrameLabels {
            faces: boxes
                .iter()
                .map(|b| LabeledFace {
                    bbox: b.clone(),
                    name: None,
                    confidence: None,
                })
                .collect(),
            spoof,
        };

        let assessment = self.liveness.assess(frame);
        if exceeds_spoof_gate(assessment.combined_confidence) {
            tracing::debug!(combined = assessment.combined_confidence, "frame rejected as screen");
            return unknown(true);
        }

        let embeddings = match self.provider.encode_faces(small, boxes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "face encoding failed");
                return unknown(false);
            }
        };

        let store = self.gallery.snapshot();
        let faces = boxes
            .iter()
            .enumerate()
            .map(|(i, bbox)| {
                let result = embeddings
                    .get(i)
                    .map(|probe| self.matcher.compare(probe, &store, self.tolerance));
                LabeledFace {
                    bbox: bbox.clone(),
                    confidence: result.as_ref().and_then(|r| r.confidence()),
                    name: result.and_then(|r| r.name),
                }
            })
            .collect();
        FrameLabels {
            faces,
            spoof: false,
        }
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }
}
