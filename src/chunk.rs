//! Paragraph-boundary chunker for raw ingested text.
//!
//! Chunks are cut from the raw input (not from the edited markdown), on
//! `\n\n` boundaries, and packed up to `max_tokens`. Paragraphs longer than
//! the limit are hard-split at the last newline or space before the limit.
//! Each chunk gets a fresh UUID and a SHA-256 of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Where a set of chunks came from.
#[derive(Debug, Clone)]
pub struct ChunkSource<'a> {
    pub source_file: &'a str,
    pub platform: &'a str,
    pub timestamp: &'a str,
    pub citation_id: Option<u32>,
}

/// Split text into chunks with contiguous indices starting at 0.
/// Blank input yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize, source: &ChunkSource<'_>) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(i as i64, piece, source))
        .collect()
}

/// Largest char boundary `<= index`, never zero for non-empty input.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        s.char_indices().nth(1).map_or(s.len(), |(pos, _)| pos)
    } else {
        i
    }
}

fn make_chunk(index: i64, text: String, source: &ChunkSource<'_>) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        chunk_id: Uuid::new_v4().to_string(),
        text,
        source_file: source.source_file.to_string(),
        platform: source.platform.to_string(),
        timestamp: source.timestamp.to_string(),
        citation_id: source.citation_id,
        chunk_index: index,
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> ChunkSource<'static> {
        ChunkSource {
            source_file: "career/Job Search.md",
            platform: "Gmail",
            timestamp: "2024-10-15T00:00:00Z",
            citation_id: Some(2),
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 200, &src());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source_file, "career/Job Search.md");
        assert_eq!(chunks[0].citation_id, Some(2));
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("  \n\n ", 200, &src()).is_empty());
    }

    #[test]
    fn test_paragraphs_exceed_limit() {
        // max_tokens=5 => max_chars=20
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text(text, 5, &src());
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_multibyte_hard_split_does_not_panic() {
        let text = "é".repeat(50);
        let chunks = chunk_text(&text, 2, &src());
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = chunk_text("Same text.", 200, &src());
        let b = chunk_text("Same text.", 200, &src());
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
    }
}
