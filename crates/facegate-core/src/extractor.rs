//! Contract for the external face embedding model.

use crate::types::{Embedding, Frame};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces; cannot tell which to use")]
    MultipleAmbiguousFaces,
    #[error("inference failed: {0}")]
    Inference(String),
}

impl ExtractError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ExtractError::NoFaceDetected => "no_face_detected",
            ExtractError::MultipleAmbiguousFaces => "ambiguous_faces",
            ExtractError::Inference(_) => "error_processing",
        }
    }
}

/// Turns a decoded frame into a face embedding.
pub trait EmbeddingExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Embedding, ExtractError>;
}

/// Extract an embedding from every frame that yields one.
///
/// Frames the extractor cannot handle are skipped; an empty result means no
/// usable face was found in any frame.
pub fn extract_batch<E: EmbeddingExtractor + ?Sized>(
    extractor: &mut E,
    frames: &[Frame],
) -> Vec<Embedding> {
    let mut out = Vec::with_capacity(frames.len());
    for (i, frame) in frames.iter().enumerate() {
        match extractor.extract(frame) {
            Ok(embedding) => out.push(embedding),
            Err(err) => tracing::debug!(frame = i, error = %err, "skipping frame"),
        }
    }
    tracing::debug!(frames = frames.len(), extracted = out.len(), "batch extracted");
    out
}
