//! Document index builder.
//!
//! Markdown under the configured content roots is chunked and stored in
//! `<index_path>/chunks.db`. Each file's SHA-256 is recorded so incremental
//! builds only re-chunk what changed.

use crate::core::chunker::{self, DocumentChunk};
use crate::core::error;
use crate::core::time;
use rayon::prelude::*;
use rusqlite::{Connection, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const INDEX_DB_NAME: &str = "chunks.db";

pub const INDEX_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        hash TEXT NOT NULL,
        chunk_count INTEGER NOT NULL,
        indexed_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS chunks (
        chunk_id TEXT NOT NULL,
        file_path TEXT NOT NULL,
        section_header TEXT NOT NULL,
        content TEXT NOT NULL,
        tokens INTEGER NOT NULL,
        start_line INTEGER NOT NULL,
        phase INTEGER,
        workflow_type TEXT,
        source TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);
    CREATE INDEX IF NOT EXISTS idx_chunks_phase ON chunks(phase);
";

pub fn index_db_path(index_path: &Path) -> PathBuf {
    index_path.join(INDEX_DB_NAME)
}

pub fn index_connect(index_path: &Path) -> Result<Connection, error::PhasegateError> {
    fs::create_dir_all(index_path).map_err(error::PhasegateError::IoError)?;
    let conn = Connection::open(index_db_path(index_path))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::PhasegateError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::PhasegateError::RusqliteError)?;
    conn.execute_batch(INDEX_SCHEMA)?;
    Ok(conn)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BuildReport {
    pub status: String,
    pub build_type: String,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_indexed: usize,
    pub message: String,
}

struct SourceFile {
    rel_path: String,
    source: String,
    abs_path: PathBuf,
}

struct PreparedFile {
    rel_path: String,
    hash: String,
    chunks: Vec<DocumentChunk>,
}

pub struct IndexBuilder {
    index_path: PathBuf,
    roots: Vec<(String, PathBuf)>,
    max_tokens: usize,
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn collect_markdown(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), error::PhasegateError> {
    for entry in fs::read_dir(dir).map_err(error::PhasegateError::IoError)? {
        let path = entry.map_err(error::PhasegateError::IoError)?.path();
        if path.is_dir() {
            collect_markdown(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
    Ok(())
}

impl IndexBuilder {
    /// `roots` pairs a source label (`standards`, `usage`, `workflows`) with its directory.
    /// Indexed paths are `<label>/<path under root>` wherever the root lives on disk.
    pub fn new(index_path: &Path, roots: Vec<(String, PathBuf)>) -> Self {
        Self {
            index_path: index_path.to_path_buf(),
            roots,
            max_tokens: chunker::DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn index_exists(&self) -> bool {
        let db = index_db_path(&self.index_path);
        if !db.exists() {
            return false;
        }
        Connection::open(&db)
            .and_then(|conn| conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get::<_, i64>(0)))
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    fn relative_path(source: &str, root: &Path, abs: &Path) -> String {
        let rel = abs.strip_prefix(root).unwrap_or(abs);
        format!("{}/{}", source, rel.to_string_lossy().replace('\\', "/"))
    }

    fn discover(&self) -> Result<Vec<SourceFile>, error::PhasegateError> {
        let mut files = Vec::new();
        for (source, root) in &self.roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "Skipping missing content root");
                continue;
            }
            let mut paths = Vec::new();
            collect_markdown(root, &mut paths)?;
            paths.sort();
            for abs_path in paths {
                files.push(SourceFile {
                    rel_path: Self::relative_path(source, root, &abs_path),
                    source: source.clone(),
                    abs_path,
                });
            }
        }
        Ok(files)
    }

    fn indexed_hashes(conn: &Connection) -> Result<HashMap<String, String>, error::PhasegateError> {
        let mut stmt = conn.prepare("SELECT path, hash FROM files")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut out = HashMap::new();
        for row in rows {
            let (path, hash) = row?;
            out.insert(path, hash);
        }
        Ok(out)
    }

    /// Builds or refreshes the index.
    ///
    /// `force` or `incremental == false` discards existing rows first.
    pub fn build_index(&self, force: bool, incremental: bool) -> Result<BuildReport, error::PhasegateError> {
        let mut conn = index_connect(&self.index_path)?;
        let full = force || !incremental;
        if full {
            conn.execute_batch("DELETE FROM chunks; DELETE FROM files;")?;
        }
        let known = Self::indexed_hashes(&conn)?;
        let files = self.discover()?;

        let prepared: Vec<PreparedFile> = files
            .par_iter()
            .filter_map(|f| match fs::read_to_string(&f.abs_path) {
                Ok(content) => {
                    let hash = hash_bytes(content.as_bytes());
                    if known.get(&f.rel_path) == Some(&hash) {
                        return None;
                    }
                    let chunks =
                        chunker::chunk_markdown(&f.rel_path, &f.source, &content, self.max_tokens);
                    Some(PreparedFile {
                        rel_path: f.rel_path.clone(),
                        hash,
                        chunks,
                    })
                }
                Err(e) => {
                    warn!(file = %f.abs_path.display(), error = %e, "Could not read file for indexing");
                    None
                }
            })
            .collect();

        let present: std::collections::HashSet<&str> =
            files.iter().map(|f| f.rel_path.as_str()).collect();
        let removed: Vec<&String> = known
            .keys()
            .filter(|path| !present.contains(path.as_str()))
            .collect();

        let tx = conn.transaction()?;
        for path in &removed {
            tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![path])?;
            tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
        }
        let indexed_at = time::now_utc().to_rfc3339();
        let mut chunks_indexed = 0;
        for file in &prepared {
            tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file.rel_path])?;
            for c in &file.chunks {
                tx.execute(
                    "INSERT INTO chunks (chunk_id, file_path, section_header, content, tokens, start_line, phase, workflow_type, source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        c.chunk_id,
                        c.file_path,
                        c.section_header,
                        c.content,
                        c.tokens as i64,
                        c.start_line as i64,
                        c.phase,
                        c.workflow_type,
                        c.source
                    ],
                )?;
            }
            tx.execute(
                "INSERT OR REPLACE INTO files (path, hash, chunk_count, indexed_at) VALUES (?1, ?2, ?3, ?4)",
                params![file.rel_path, file.hash, file.chunks.len() as i64, indexed_at],
            )?;
            chunks_indexed += file.chunks.len();
        }
        tx.commit()?;

        let build_type = if full {
            "full"
        } else if prepared.is_empty() && removed.is_empty() {
            "unchanged"
        } else {
            "incremental"
        };
        let report = BuildReport {
            status: "success".to_string(),
            build_type: build_type.to_string(),
            files_indexed: prepared.len(),
            files_removed: removed.len(),
            chunks_indexed,
            message: format!(
                "Indexed {} files ({} chunks), removed {}",
                prepared.len(),
                chunks_indexed,
                removed.len()
            ),
        };
        info!(
            build_type = %report.build_type,
            files = report.files_indexed,
            chunks = report.chunks_indexed,
            removed = report.files_removed,
            "Index build complete"
        );
        Ok(report)
    }
}

/// Reads every stored chunk, ordered by file and line.
pub fn load_chunks(index_path: &Path) -> Result<Vec<DocumentChunk>, error::PhasegateError> {
    let conn = index_connect(index_path)?;
    let mut stmt = conn.prepare(
        "SELECT chunk_id, file_path, section_header, content, tokens, start_line, phase, workflow_type, source
         FROM chunks ORDER BY file_path, start_line",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DocumentChunk {
            chunk_id: row.get(0)?,
            file_path: row.get(1)?,
            section_header: row.get(2)?,
            content: row.get(3)?,
            tokens: row.get::<_, i64>(4)? as usize,
            start_line: row.get::<_, i64>(5)? as usize,
            phase: row.get(6)?,
            workflow_type: row.get(7)?,
            source: row.get(8)?,
        })
    })?;
    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(row?);
    }
    Ok(chunks)
}
