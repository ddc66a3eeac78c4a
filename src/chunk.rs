//! Recursive character splitter.
//!
//! Text is packed greedily into windows of at most `chunk_size` characters.
//! Consecutive windows share up to `chunk_overlap` characters of trailing
//! context. Break points are tried in priority order: paragraph, line,
//! sentence punctuation, word, and finally single characters. A piece that
//! is still too large at one level is re-split at the next.
//!
//! Each chunk is tagged with the origin file's basename, the loader's page
//! number (when the format has pages), and its byte offset within that
//! page's text.

use std::path::Path;

use crate::config::ChunkingConfig;
use crate::error::RagError;
use crate::extract::{load_pages, PageText};
use crate::models::Chunk;

const SEPARATORS: &[&str] = &["\n\n", "\n", ".", "!", "?", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Split raw text into trimmed, non-empty windows in document order.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, SEPARATORS)
    }

    /// Split every page and attach provenance.
    pub fn split_pages(&self, source: &str, pages: &[PageText]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for page in pages {
            let mut prev: Option<(usize, usize)> = None;
            for piece in self.split_text(&page.text) {
                let hint = match prev {
                    Some((start, len)) => self.next_search_start(&page.text, start, len),
                    None => 0,
                };
                let offset = page.text[hint..]
                    .find(piece.as_str())
                    .map(|i| i + hint);
                if let Some(start) = offset {
                    prev = Some((start, piece.len()));
                }
                chunks.push(Chunk {
                    text: piece,
                    source: source.to_string(),
                    page: page.page,
                    start_offset: offset,
                });
            }
        }
        chunks
    }

    /// Earliest byte where the next window can begin: the previous window's
    /// end minus the overlap, but strictly after the previous start.
    fn next_search_start(&self, text: &str, prev_start: usize, prev_len: usize) -> usize {
        let prev_end = prev_start + prev_len;
        let overlap_start = text[..prev_end]
            .char_indices()
            .rev()
            .take(self.chunk_overlap)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(prev_end);
        let after_prev = text[prev_start..]
            .chars()
            .next()
            .map(|c| prev_start + c.len_utf8())
            .unwrap_or(prev_start);
        overlap_start.max(after_prev).min(text.len())
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let idx = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(idx).copied().unwrap_or("");
        let finer = separators.get(idx + 1..).unwrap_or(&[]);

        let mut out = Vec::new();
        let mut small: Vec<&str> = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                small.push(piece);
                continue;
            }
            if !small.is_empty() {
                out.extend(self.merge(&small));
                small.clear();
            }
            if finer.is_empty() {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    out.push(trimmed.to_string());
                }
            } else {
                out.extend(self.split_recursive(piece, finer));
            }
        }
        if !small.is_empty() {
            out.extend(self.merge(&small));
        }
        out
    }

    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut docs = Vec::new();
        let mut window: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut docs, &window);
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match window.pop_front() {
                        Some(front) => total -= char_len(front),
                        None => break,
                    }
                }
            }
            window.push_back(piece);
            total += len;
        }
        push_joined(&mut docs, &window);
        docs
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_joined(docs: &mut Vec<String>, window: &std::collections::VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Split on `separator`, attaching each separator to the start of the piece
/// that follows it so that concatenating the pieces restores the input.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut last = 0;
    for (i, _) in text.match_indices(separator) {
        if i > last {
            pieces.push(&text[last..i]);
        }
        last = i;
    }
    if last < text.len() {
        pieces.push(&text[last..]);
    }
    pieces
}

/// Load one file and split it. Runs synchronously; callers fan out across
/// files on blocking threads.
pub fn load_and_split(path: &Path, splitter: &TextSplitter) -> Result<Vec<Chunk>, RagError> {
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let pages = load_pages(path).map_err(|e| RagError::LoadFailure {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(splitter.split_pages(&source, &pages))
}
