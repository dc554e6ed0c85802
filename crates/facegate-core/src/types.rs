use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, as reported by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// A decoded camera frame handed over by the capture layer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded pixel data; layout is agreed between the caller and the extractor.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreError {
    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("embedding has zero magnitude")]
    DegenerateVector,
}

impl ScoreError {
    /// Stable code used at the API boundary.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ScoreError::DimensionMismatch { .. } => "dimension_mismatch",
            ScoreError::DegenerateVector => "degenerate_vector",
        }
    }
}

/// Face embedding vector (e.g. 512-dimensional for ArcFace, 2622 for VGG-Face).
///
/// Values are fixed at construction; there is no mutable access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "vgg-face").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Cosine similarity against another embedding. See [`score`].
    pub fn similarity(&self, other: &Embedding) -> Result<f32, ScoreError> {
        score(&self.values, &other.values)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Cosine similarity `dot(a, b) / (|a| * |b|)`.
///
/// Returns a value in [-1, 1]. Higher = more similar. Accumulates in f64 so
/// long VGG-Face vectors do not lose precision.
pub fn score(a: &[f32], b: &[f32]) -> Result<f32, ScoreError> {
    if a.len() != b.len() {
        return Err(ScoreError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 && denom.is_finite() {
        Ok((dot / denom).clamp(-1.0, 1.0) as f32)
    } else {
        Err(ScoreError::DegenerateVector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_self_is_one() {
        let a: Vec<f32> = (0..2622).map(|i| ((i * 37) % 101) as f32 / 13.0 - 3.0).collect();
        assert!((score(&a, &a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_symmetric() {
        let a = [0.3, -1.2, 4.0, 0.01];
        let b = [2.0, 0.5, -0.7, 9.0];
        assert_eq!(score(&a, &b).unwrap(), score(&b, &a).unwrap());
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = [1.0, 2.0, 3.0];
        let b = [10.0, 20.0, 30.0];
        assert!((score(&a, &b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), Err(ScoreError::DegenerateVector));
        assert_eq!(b.similarity(&a), Err(ScoreError::DegenerateVector));
    }

    #[test]
    fn test_cosine_similarity_empty_is_degenerate() {
        assert_eq!(score(&[], &[]), Err(ScoreError::DegenerateVector));
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let err = score(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert_eq!(err, ScoreError::DimensionMismatch { left: 2, right: 3 });
        assert_eq!(err.reason_code(), "dimension_mismatch");
    }

    #[test]
    fn test_embedding_serde_omits_missing_model_version() {
        let json = serde_json::to_string(&Embedding::new(vec![0.5])).unwrap();
        assert_eq!(json, r#"{"values":[0.5]}"#);
        let tagged = Embedding::new(vec![0.5]).with_model_version("vgg-face");
        assert_eq!(tagged.model_version(), Some("vgg-face"));
    }

    #[test]
    fn test_bounding_box_area() {
        let b = BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 2.5 };
        assert_eq!(b.area(), 10.0);
    }
}
