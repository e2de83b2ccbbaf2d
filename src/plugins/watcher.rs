//! Content watching with debounced incremental reindex.
//!
//! A burst of edits under the content roots collapses into one rebuild: the
//! first relevant event arms a timer, later events are absorbed until the
//! rebuild runs.

use crate::core::error;
use crate::core::index::{BuildReport, IndexBuilder};
use crate::core::rag::RagEngine;
use crate::core::time;
use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Markdown and JSON (workflow metadata) changes trigger a rebuild.
pub fn is_relevant_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("json")
    )
}

pub fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|p| is_relevant_path(p))
}

pub struct RebuildScheduler {
    builder: IndexBuilder,
    rag: Arc<RagEngine>,
    debounce: Duration,
    pending: AtomicBool,
    last_rebuild: Mutex<Option<DateTime<Utc>>>,
}

impl RebuildScheduler {
    pub fn new(builder: IndexBuilder, rag: Arc<RagEngine>, debounce: Duration) -> Self {
        Self {
            builder,
            rag,
            debounce,
            pending: AtomicBool::new(false),
            last_rebuild: Mutex::new(None),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn last_rebuild(&self) -> Option<DateTime<Utc>> {
        self.last_rebuild.lock().ok().and_then(|g| *g)
    }

    /// Arms a debounced rebuild. Returns false when one is already pending.
    pub fn schedule(self: &Arc<Self>) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Rebuild already pending, event absorbed");
            return false;
        }
        let scheduler = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(scheduler.debounce);
            if let Err(e) = scheduler.rebuild_now() {
                error!(error = %e, "Failed to rebuild index");
            }
        });
        true
    }

    /// Runs an incremental build and reloads the engine on success.
    pub fn rebuild_now(&self) -> Result<BuildReport, error::PhasegateError> {
        info!("Incrementally updating index after content changes");
        let outcome = self.builder.build_index(false, true).and_then(|report| {
            if report.status == "success" {
                self.rag.reload_index()?;
                info!(build_type = %report.build_type, "Index update complete, engine reloaded");
            } else {
                warn!(message = %report.message, "Index rebuild had issues");
            }
            Ok(report)
        });
        if outcome.is_ok() {
            if let Ok(mut last) = self.last_rebuild.lock() {
                *last = Some(time::now_utc());
            }
        }
        self.pending.store(false, Ordering::SeqCst);
        outcome
    }

    pub fn handle_event(self: &Arc<Self>, event: &Event) {
        if !is_relevant_event(event) {
            return;
        }
        if let Some(path) = event.paths.first() {
            info!(file = %path.display(), kind = ?event.kind, "Content changed");
        }
        self.schedule();
    }
}

pub struct ContentWatcher {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl ContentWatcher {
    /// Watches each existing root recursively. Missing roots are skipped.
    pub fn start(roots: &[PathBuf], scheduler: Arc<RebuildScheduler>) -> Result<Self, error::PhasegateError> {
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => scheduler.handle_event(&event),
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "Skipping missing watch root");
                continue;
            }
            watcher.watch(root, RecursiveMode::Recursive)?;
            watched.push(root.clone());
        }
        info!(roots = watched.len(), "File watchers started (hot reload enabled)");
        Ok(Self {
            watcher,
            roots: watched,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn stop(mut self) {
        for root in &self.roots {
            if let Err(e) = self.watcher.unwatch(root) {
                debug!(root = %root.display(), error = %e, "Unwatch failed");
            }
        }
        info!("File watchers stopped");
    }
}
