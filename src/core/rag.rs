//! Lexical retrieval over the document index.
//!
//! All chunks are held in memory behind an `RwLock`; `reload_index` swaps in a
//! fresh snapshot after the watcher rebuilds the database. Scoring is TF-IDF
//! over lower-cased terms with a bonus for header and path hits.

use crate::core::chunker::DocumentChunk;
use crate::core::error;
use crate::core::index;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "how", "in", "is", "it", "of",
    "on", "or", "that", "the", "this", "to", "was", "what", "when", "with",
];

/// Cached query results; the oldest entry is evicted past this.
pub const SEARCH_CACHE_CAPACITY: usize = 256;

const HEADER_BONUS: f64 = 2.0;
const PATH_BONUS: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SearchFilters {
    pub phase: Option<u32>,
    pub workflow_type: Option<String>,
}

impl SearchFilters {
    pub fn phase(phase: u32) -> Self {
        Self {
            phase: Some(phase),
            workflow_type: None,
        }
    }

    pub fn for_workflow(workflow_type: &str, phase: u32) -> Self {
        Self {
            phase: Some(phase),
            workflow_type: Some(workflow_type.to_string()),
        }
    }

    fn is_empty(&self) -> bool {
        self.phase.is_none() && self.workflow_type.is_none()
    }

    fn matches(&self, chunk: &DocumentChunk) -> bool {
        self.phase.is_none_or(|p| chunk.phase == Some(p))
            && self
                .workflow_type
                .as_ref()
                .is_none_or(|wt| chunk.workflow_type.as_ref() == Some(wt))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: DocumentChunk,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunks: Vec<ScoredChunk>,
    pub total_tokens: usize,
    pub retrieval_method: String,
    pub query_time_ms: f64,
}

struct Snapshot {
    chunks: Vec<DocumentChunk>,
    /// Lower-cased term frequencies per chunk.
    term_counts: Vec<FxHashMap<String, u32>>,
    doc_freq: FxHashMap<String, u32>,
}

impl Snapshot {
    fn build(chunks: Vec<DocumentChunk>) -> Self {
        let term_counts: Vec<FxHashMap<String, u32>> = chunks
            .iter()
            .map(|c| {
                let mut counts = FxHashMap::default();
                for term in tokenize(&c.content) {
                    *counts.entry(term).or_insert(0) += 1;
                }
                counts
            })
            .collect();
        let mut doc_freq = FxHashMap::default();
        for counts in &term_counts {
            for term in counts.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
        }
        Self {
            chunks,
            term_counts,
            doc_freq,
        }
    }
}

/// Lower-cased alphanumeric/underscore words of 2+ characters, minus stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| w.chars().count() >= 2)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

type CacheKey = (String, usize, SearchFilters);

#[derive(Default)]
struct SearchCache {
    entries: FxHashMap<CacheKey, SearchResult>,
    order: VecDeque<CacheKey>,
}

impl SearchCache {
    fn insert(&mut self, key: CacheKey, result: SearchResult) {
        if self.entries.insert(key.clone(), result).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > SEARCH_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

pub struct RagEngine {
    index_path: PathBuf,
    snapshot: RwLock<Snapshot>,
    cache: Mutex<SearchCache>,
    generation: AtomicU64,
}

impl RagEngine {
    pub fn open(index_path: &Path) -> Result<Self, error::PhasegateError> {
        let chunks = index::load_chunks(index_path)?;
        info!(chunks = chunks.len(), index = %index_path.display(), "RAG engine loaded");
        Ok(Self {
            index_path: index_path.to_path_buf(),
            snapshot: RwLock::new(Snapshot::build(chunks)),
            cache: Mutex::new(SearchCache::default()),
            generation: AtomicU64::new(0),
        })
    }

    /// Bumped on every reload. Consumers compare it to drop derived caches.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> usize {
        self.snapshot.read().map(|s| s.chunks.len()).unwrap_or(0)
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }

    pub fn reload_index(&self) -> Result<(), error::PhasegateError> {
        let snapshot = Snapshot::build(index::load_chunks(&self.index_path)?);
        let count = snapshot.chunks.len();
        {
            let mut guard = self
                .snapshot
                .write()
                .map_err(|_| error::PhasegateError::ValidationError("index lock poisoned".to_string()))?;
            *guard = snapshot;
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        info!(chunks = count, "RAG index reloaded");
        Ok(())
    }

    pub fn search(
        &self,
        query: &str,
        n_results: usize,
        filters: &SearchFilters,
    ) -> Result<SearchResult, error::PhasegateError> {
        let key = (query.to_string(), n_results, filters.clone());
        if let Some(hit) = self.cache.lock().ok().and_then(|c| c.entries.get(&key).cloned()) {
            debug!(query, "Search cache hit");
            return Ok(hit);
        }

        let started = Instant::now();
        let snapshot = self
            .snapshot
            .read()
            .map_err(|_| error::PhasegateError::ValidationError("index lock poisoned".to_string()))?;
        // Reloads bump the generation under the write lock, so this pairs with the snapshot.
        let generation = self.generation();

        let terms: FxHashSet<String> = tokenize(query).into_iter().collect();
        let total_docs = snapshot.chunks.len().max(1) as f64;

        let mut scored: Vec<(f64, usize)> = snapshot
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| filters.matches(c))
            .map(|(i, c)| {
                let counts = &snapshot.term_counts[i];
                let header = c.section_header.to_lowercase();
                let path = c.file_path.to_lowercase();
                let mut score = 0.0;
                for term in &terms {
                    if let Some(&tf) = counts.get(term) {
                        let df = snapshot.doc_freq.get(term).copied().unwrap_or(1) as f64;
                        let idf = (total_docs / df).ln() + 1.0;
                        score += (1.0 + (tf as f64).ln()) * idf;
                    }
                    if header.contains(term.as_str()) {
                        score += HEADER_BONUS;
                    }
                    if path.contains(term.as_str()) {
                        score += PATH_BONUS;
                    }
                }
                (score, i)
            })
            .filter(|(score, _)| !filters.is_empty() || *score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| snapshot.chunks[a.1].file_path.cmp(&snapshot.chunks[b.1].file_path))
                .then_with(|| snapshot.chunks[a.1].start_line.cmp(&snapshot.chunks[b.1].start_line))
        });
        scored.truncate(n_results);

        let chunks: Vec<ScoredChunk> = scored
            .into_iter()
            .map(|(score, i)| ScoredChunk {
                chunk: snapshot.chunks[i].clone(),
                relevance_score: (score * 1000.0).round() / 1000.0,
            })
            .collect();
        drop(snapshot);

        let result = SearchResult {
            total_tokens: chunks.iter().map(|c| c.chunk.tokens).sum(),
            chunks,
            retrieval_method: "lexical".to_string(),
            query_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        if let Ok(mut cache) = self.cache.lock() {
            if self.generation() == generation {
                cache.insert(key, result.clone());
            } else {
                debug!(query, "Index reloaded during search, result not cached");
            }
        }
        Ok(result)
    }
}
