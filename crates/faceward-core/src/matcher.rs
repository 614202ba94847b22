//! Identity matching against the encoding store.

use crate::store::EncodingStore;
use crate::types::Embedding;

/// Default maximum Euclidean distance for a positive match. Smaller is stricter.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Result of matching a probe embedding against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Name of the selected profile, if any candidate was within tolerance.
    pub name: Option<String>,
    /// Store index of the selected profile.
    pub index: Option<usize>,
    /// Distance of the selected profile.
    pub distance: Option<f32>,
    /// `(1 - distance) * 100` for every stored candidate, in store order.
    pub confidences: Vec<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.name.is_some()
    }

    /// Confidence of the selected profile.
    pub fn confidence(&self) -> Option<f32> {
        self.index.and_then(|i| self.confidences.get(i).copied())
    }
}

/// Strategy for comparing a probe embedding against the enrolled profiles.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, store: &EncodingStore, tolerance: f32) -> MatchResult;
}

/// First-match Euclidean matcher.
///
/// Candidates are scanned in store order and the **first** one whose distance
/// is `<= tolerance` is selected, even when a later candidate is closer. Store
/// order therefore decides who is authenticated when several profiles are
/// within tolerance; do not replace this with best-distance selection.
///
/// Confidences are still computed for every candidate so callers can log them.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, store: &EncodingStore, tolerance: f32) -> MatchResult {
        let distances: Vec<f32> = store
            .embeddings()
            .map(|known| probe.euclidean_distance(known))
            .collect();

        let selected = distances.iter().position(|&d| d <= tolerance);

        MatchResult {
            name: selected.and_then(|i| store.name(i).map(str::to_string)),
            index: selected,
            distance: selected.map(|i| distances[i]),
            confidences: distances.iter().map(|d| (1.0 - d) * 100.0).collect(),
        }
    }
}
