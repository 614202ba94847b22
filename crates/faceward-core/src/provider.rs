//! Face localization and embedding, supplied by an external model.

use crate::types::{BoundingBox, Embedding};
use faceward_hw::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("embedding provider protocol error: {0}")]
    Protocol(String),
    #[error("embedding provider reported: {0}")]
    Remote(String),
    #[error("embedding provider io: {0}")]
    Io(#[from] std::io::Error),
}

/// External capability that finds faces and turns them into embeddings.
///
/// Either list may be empty. Box coordinates are in the pixel space of the
/// frame passed in.
pub trait EmbeddingProvider: Send + Sync {
    fn locate_faces(&self, frame: &Frame) -> Result<Vec<BoundingBox>, ProviderError>;

    /// One embedding per box, in box order.
    fn encode_faces(
        &self,
        frame: &Frame,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError>;
}
