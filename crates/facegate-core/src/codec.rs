//! On-disk embedding batch format.
//!
//! One file holds one registration batch as a 2-D array (rows = embeddings,
//! columns = dimensionality). Layout, all little-endian:
//!
//! ```text
//! magic "FGEB" | version u16 | rows u32 | cols u32 | rows*cols f32 | sha256[32]
//! ```
//!
//! The digest covers every byte before it. Values are stored verbatim, so a
//! decode reproduces the encoded rows bit for bit.

use ndarray::Array2;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"FGEB";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 4;
const DIGEST_LEN: usize = 32;

/// File extension for embedding batch files (without the dot).
pub const FILE_EXTENSION: &str = "fge";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("not an embedding batch file")]
    BadMagic,
    #[error("unsupported batch format version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated batch: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("batch digest does not match contents")]
    ChecksumMismatch,
    #[error("batch has no embeddings")]
    EmptyBatch,
    #[error("batch rows have differing lengths")]
    RaggedRows,
}

/// Encode a batch of equally sized rows.
pub fn encode_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Vec<u8>, CodecError> {
    let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
    if rows.is_empty() || cols == 0 {
        return Err(CodecError::EmptyBatch);
    }
    if rows.iter().any(|r| r.as_ref().len() != cols) {
        return Err(CodecError::RaggedRows);
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + rows.len() * cols * 4 + DIGEST_LEN);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(cols as u32).to_le_bytes());
    for row in rows {
        for v in row.as_ref() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    let digest = Sha256::digest(&buf);
    buf.extend_from_slice(&digest);
    Ok(buf)
}

/// Decode a batch file into a `rows x cols` array.
pub fn decode(bytes: &[u8]) -> Result<Array2<f32>, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    if &bytes[0..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let rows = read_u32(&bytes[6..10]) as usize;
    let cols = read_u32(&bytes[10..14]) as usize;
    if rows == 0 || cols == 0 {
        return Err(CodecError::EmptyBatch);
    }

    let payload_len = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(4))
        .ok_or(CodecError::Truncated {
            expected: usize::MAX,
            actual: bytes.len(),
        })?;
    let expected = HEADER_LEN + payload_len + DIGEST_LEN;
    if bytes.len() != expected {
        return Err(CodecError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    let (body, digest) = bytes.split_at(HEADER_LEN + payload_len);
    if Sha256::digest(body).as_slice() != digest {
        return Err(CodecError::ChecksumMismatch);
    }

    let values: Vec<f32> = body[HEADER_LEN..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    // Shape was validated against the payload length above.
    Array2::from_shape_vec((rows, cols), values).map_err(|_| CodecError::Truncated {
        expected,
        actual: bytes.len(),
    })
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
