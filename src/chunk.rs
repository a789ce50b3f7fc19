//! Fixed-size character chunker.
//!
//! Splits extracted text into segments of at most `chunk_size` characters.
//! Cuts fall on character positions, never inside a UTF-8 sequence, and there
//! is no overlap: concatenating the pieces in order reproduces the input.
//!
//! Each chunk also carries a SHA-256 hash of its text, written to the stored
//! object's metadata as `content_sha256`. Nothing reads it back.

use sha2::{Digest, Sha256};

use crate::naming::chunk_object_name;

/// One chunk ready to be written to the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkObject {
    /// Object name, `{classification}/{filename}_part{N}.txt`.
    pub name: String,
    /// 1-based part number.
    pub part: usize,
    pub text: String,
    pub hash: String,
}

/// Split text into consecutive slices of at most `chunk_size` characters.
///
/// Empty input yields no slices. A `chunk_size` of zero is treated as one.
pub fn split_fixed(text: &str, chunk_size: usize) -> Vec<&str> {
    let size = chunk_size.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == size {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }

    pieces
}

/// Chunk a document's extracted text into named objects.
pub fn chunk_document(
    classification: &str,
    filename: &str,
    text: &str,
    chunk_size: usize,
) -> Vec<ChunkObject> {
    split_fixed(text, chunk_size)
        .into_iter()
        .enumerate()
        .map(|(idx, piece)| make_chunk(classification, filename, idx + 1, piece))
        .collect()
}

fn make_chunk(classification: &str, filename: &str, part: usize, text: &str) -> ChunkObject {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = hex::encode(hasher.finalize());

    ChunkObject {
        name: chunk_object_name(classification, filename, part),
        part,
        text: text.to_string(),
        hash,
    }
}
