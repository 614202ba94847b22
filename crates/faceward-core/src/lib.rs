//! faceward-core: encoding cache, identity matching, spectral liveness,
//! single-shot verification and the continuous recognition loop.

pub mod cache;
pub mod liveness;
pub mod matcher;
pub mod notify;
pub mod overlay;
pub mod provider;
pub mod session;
pub mod store;
pub mod types;
pub mod verify;

pub use cache::{CacheError, ContentHasher, FsBlobCache, PersistentCache, Sha256Hasher};
pub use liveness::{LivenessAnalyzer, LivenessAssessment, SpectralAnalyzer};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher, DEFAULT_TOLERANCE};
pub use notify::{LogNotifier, Notifier, NotifyError};
pub use overlay::{DisplayOverlay, HeadlessOverlay};
pub use provider::{EmbeddingProvider, ProviderError};
pub use session::{
    OverlayFactory, RecognitionSession, SessionError, SessionSettings, SessionStatus, StopStatus,
};
pub use store::{DatasetLoader, EncodingStore, Gallery, StoreError};
pub use types::{
    AccessEvent, BoundingBox, DenyReason, Embedding, FaceProfile, LabeledFace,
    VerificationOutcome, UNKNOWN_IDENTITY,
};
pub use verify::VerificationService;
