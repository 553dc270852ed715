//! Document chunking
//!
//! Splits already-extracted document text into overlapping chunks. A cut is
//! moved back to the nearest paragraph break, then sentence end, then
//! whitespace, as long as that keeps the chunk at least half full. Offsets
//! and sizes are in characters.

use crate::config::ChunkingConfig;
use crate::error::{Error, Result};

/// One chunk of a source document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Offset of the first character in the source document
    pub offset: usize,
    pub text: String,
}

/// Overlapping text chunker
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self> {
        if size == 0 || overlap >= size {
            return Err(Error::Validation(format!(
                "invalid chunking policy: size {} overlap {}",
                size, overlap
            )));
        }
        Ok(Self { size, overlap })
    }

    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Split `text` into chunks; empty or whitespace-only text yields none
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        if chars.iter().all(|c| c.is_whitespace()) {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < chars.len() {
            let hard_end = (start + self.size).min(chars.len());
            let end = if hard_end < chars.len() {
                self.boundary(&chars, start, hard_end)
            } else {
                hard_end
            };

            let text: String = chars[start..end].iter().collect();
            if !text.trim().is_empty() {
                chunks.push(TextChunk {
                    offset: start,
                    text,
                });
            }
            if end == chars.len() {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
        }
        chunks
    }

    /// Best cut in `(start + size/2, hard_end]`, falling back to `hard_end`
    fn boundary(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let floor = start + self.size / 2;
        let window = floor.max(start + 1)..=hard_end;

        let paragraph = window
            .clone()
            .rev()
            .find(|&i| i >= 2 && chars[i - 1] == '\n' && chars[i - 2] == '\n');
        if let Some(i) = paragraph {
            return i;
        }

        let sentence = window.clone().rev().find(|&i| {
            i < hard_end && is_sentence_end(chars[i - 1]) && chars[i].is_whitespace()
        });
        if let Some(i) = sentence {
            return i + 1;
        }

        let space = window.rev().find(|&i| chars[i - 1].is_whitespace());
        space.unwrap_or(hard_end)
    }
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
}

/// Rebuild document text from chunks, dropping the overlapping prefix of each
pub fn reassemble<'a>(chunks: impl IntoIterator<Item = (usize, &'a str)>) -> String {
    let mut ordered: Vec<(usize, &str)> = chunks.into_iter().collect();
    ordered.sort_by_key(|(offset, _)| *offset);

    let mut text = String::new();
    let mut covered = 0usize;
    for (offset, chunk) in ordered {
        let len = chunk.chars().count();
        if offset + len <= covered {
            continue;
        }
        let skip = covered.saturating_sub(offset);
        text.extend(chunk.chars().skip(skip));
        covered = offset + len;
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = Chunker::new(100, 20).unwrap();
        let chunks = chunker.chunk("hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn test_empty_text_no_chunks() {
        let chunker = Chunker::new(100, 20).unwrap();
        assert!(chunker.chunk("   \n ").is_empty());
    }

    #[test]
    fn test_invalid_policy() {
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(10, 10).is_err());
    }

    #[test]
    fn test_chunks_overlap_and_cover_text() {
        let text = "word ".repeat(200);
        let chunker = Chunker::new(100, 20).unwrap();
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_end = pair[0].offset + pair[0].text.chars().count();
            assert!(pair[1].offset < prev_end, "chunks must overlap");
            assert!(pair[1].offset > pair[0].offset, "chunks must advance");
        }
        let rebuilt = reassemble(chunks.iter().map(|c| (c.offset, c.text.as_str())));
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = format!("{}. {}", "a".repeat(70), "b".repeat(60));
        let chunker = Chunker::new(100, 10).unwrap();
        let chunks = chunker.chunk(&text);
        assert!(chunks[0].text.ends_with(". "));
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}. more words here", "a".repeat(60), "b".repeat(30));
        let chunker = Chunker::new(100, 10).unwrap();
        let chunks = chunker.chunk(&text);
        assert!(chunks[0].text.ends_with("\n\n"));
    }

    #[test]
    fn test_multibyte_text() {
        let text = "记忆系统需要分块。".repeat(30);
        let chunker = Chunker::new(50, 10).unwrap();
        let chunks = chunker.chunk(&text);
        let rebuilt = reassemble(chunks.iter().map(|c| (c.offset, c.text.as_str())));
        assert_eq!(rebuilt, text);
    }
}
