//! Markdown chunking for the document index.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

pub const DEFAULT_MAX_TOKENS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentChunk {
    pub chunk_id: String,
    /// Path relative to the base directory, `/`-separated.
    pub file_path: String,
    pub section_header: String,
    pub content: String,
    pub tokens: usize,
    /// 1-based line where the chunk starts.
    pub start_line: usize,
    pub phase: Option<u32>,
    pub workflow_type: Option<String>,
    pub source: String,
}

fn tokenizer() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Token count under `cl100k_base`; falls back to a chars/4 estimate.
pub fn count_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

fn workflow_phase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^workflows/([^/]+)/phases/(\d+)/").expect("valid regex"))
}

/// Workflow type and phase number of an indexed `workflows/<type>/phases/<n>/` path.
/// Paths carry the source label, so this holds for any configured workflows root.
pub fn path_metadata(rel_path: &str) -> (Option<String>, Option<u32>) {
    match workflow_phase_re().captures(rel_path) {
        Some(caps) => (Some(caps[1].to_string()), caps[2].parse().ok()),
        None => (None, None),
    }
}

fn heading_level(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=3).contains(&level) && trimmed[level..].starts_with(' ') {
        Some((level, trimmed[level..].trim()))
    } else {
        None
    }
}

struct Section {
    header: String,
    start_line: usize,
    lines: Vec<String>,
}

fn split_sections(content: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut current = Section {
        header: String::new(),
        start_line: 1,
        lines: Vec::new(),
    };
    let mut in_fence = false;

    for (idx, line) in content.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some((_, title)) = heading_level(line) {
                if current.lines.iter().any(|l| !l.trim().is_empty()) {
                    sections.push(current);
                }
                current = Section {
                    header: title.to_string(),
                    start_line: idx + 1,
                    lines: Vec::new(),
                };
            }
        }
        current.lines.push(line.to_string());
    }
    if current.lines.iter().any(|l| !l.trim().is_empty()) {
        sections.push(current);
    }
    sections
}

/// Splits an oversized section at blank lines, never inside a code fence.
fn split_paragraphs(section: &Section, max_tokens: usize) -> Vec<(usize, String)> {
    let mut parts: Vec<(usize, String)> = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut buf_start = section.start_line;
    let mut buf_tokens = 0;
    let mut in_fence = false;

    for (offset, line) in section.lines.iter().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let line_tokens = count_tokens(line) + 1;
        let boundary = !in_fence && line.trim().is_empty();
        if boundary && buf_tokens + line_tokens > max_tokens && !buf.is_empty() {
            parts.push((buf_start, buf.join("\n")));
            buf.clear();
            buf_tokens = 0;
            buf_start = section.start_line + offset + 1;
            continue;
        }
        if buf.is_empty() && line.trim().is_empty() {
            buf_start = section.start_line + offset + 1;
            continue;
        }
        buf.push(line);
        buf_tokens += line_tokens;
    }
    if buf.iter().any(|l| !l.trim().is_empty()) {
        parts.push((buf_start, buf.join("\n")));
    }
    parts
}

fn chunk_id(file_path: &str, start_line: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(start_line.to_le_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Chunks one markdown document.
pub fn chunk_markdown(
    rel_path: &str,
    source: &str,
    content: &str,
    max_tokens: usize,
) -> Vec<DocumentChunk> {
    let (workflow_type, phase) = path_metadata(rel_path);
    let mut chunks = Vec::new();

    for section in split_sections(content) {
        let text = section.lines.join("\n");
        let tokens = count_tokens(&text);
        let pieces = if tokens > max_tokens {
            split_paragraphs(&section, max_tokens)
        } else {
            vec![(section.start_line, text)]
        };
        for (start_line, piece) in pieces {
            let piece = piece.trim_end().to_string();
            if piece.trim().is_empty() {
                continue;
            }
            chunks.push(DocumentChunk {
                chunk_id: chunk_id(rel_path, start_line, &piece),
                file_path: rel_path.to_string(),
                section_header: section.header.clone(),
                tokens: count_tokens(&piece),
                content: piece,
                start_line,
                phase,
                workflow_type: workflow_type.clone(),
                source: source.to_string(),
            });
        }
    }
    chunks
}
