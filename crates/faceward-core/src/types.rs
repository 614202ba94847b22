use chrono::{DateTime, Utc};
use faceward_hw::Frame;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label used for faces that matched no enrolled profile.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Bounding box for a detected face, in the pixel space of the frame it was found in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

impl BoundingBox {
    /// Map a box found on a downsampled frame back to source resolution.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }
}

/// Face embedding vector; dimensionality is fixed by the embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance to another embedding.
    ///
    /// Mismatched lengths compare over the shared prefix.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// A known identity: one enrolled image reduced to its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceProfile {
    /// Identity name (the dataset image's file stem).
    pub name: String,
    pub embedding: Embedding,
    /// Content hash of the dataset image the embedding came from.
    pub source_hash: String,
}

/// Why a verification attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    ScreenSpoof,
    NoFace,
    NotRecognized,
    DecodeError,
}

impl DenyReason {
    pub fn describe(&self) -> &'static str {
        match self {
            DenyReason::ScreenSpoof => "face appears to be presented on a screen",
            DenyReason::NoFace => "no face detected",
            DenyReason::NotRecognized => "face not recognized",
            DenyReason::DecodeError => "face could not be encoded",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Result of a single verification attempt. Denials are business outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified { name: String, confidence: f32 },
    Denied { reason: DenyReason },
}

impl VerificationOutcome {
    pub fn denied(reason: DenyReason) -> Self {
        Self::Denied { reason }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Recognized identity, or [`UNKNOWN_IDENTITY`] for any denial.
    pub fn identity(&self) -> &str {
        match self {
            Self::Verified { name, .. } => name,
            Self::Denied { .. } => UNKNOWN_IDENTITY,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Verified { name, confidence } => {
                format!("Access granted: {name} ({confidence:.1}% confidence)")
            }
            Self::Denied { reason } => format!("Access denied: {reason}"),
        }
    }
}

/// A face found in a frame of the continuous loop, with its match label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledFace {
    pub bbox: BoundingBox,
    /// Matched identity, or `None` when unknown or rejected as a spoof.
    pub name: Option<String>,
    pub confidence: Option<f32>,
}

impl LabeledFace {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }

    pub fn is_unknown(&self) -> bool {
        self.name.is_none()
    }
}

/// Notification request handed to the external [`Notifier`](crate::notify::Notifier).
///
/// Never persisted by the core.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEvent {
    pub id: Uuid,
    #[serde(skip)]
    pub evidence: Option<Frame>,
    pub requester: String,
    pub recognized: String,
    pub outcome: VerificationOutcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AccessEvent {
    pub fn new(requester: &str, outcome: VerificationOutcome, evidence: Option<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            evidence,
            requester: requester.to_string(),
            recognized: outcome.identity().to_string(),
            message: outcome.message(),
            outcome,
            timestamp: Utc::now(),
        }
    }
}
