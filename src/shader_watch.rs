// src/shader_watch.rs
//! Native file watching for shader hot reload.
//!
//! Editors often write a file several times in quick succession, so changes
//! are debounced: a reload is requested once no `.wgsl` event has arrived
//! for `debounce`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Error, Result};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    window: Duration,
    last_change: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_change: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_change = Some(now);
    }

    /// True exactly once per burst of changes, after the burst settles.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.last_change {
            Some(at) if now.saturating_duration_since(at) >= self.window => {
                self.last_change = None;
                true
            }
            _ => false,
        }
    }
}

pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    changes: Receiver<PathBuf>,
    debounce: Debounce,
}

impl ShaderWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, changes) = unbounded();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)) {
                    for path in event.paths.into_iter().filter(|p| is_shader(p)) {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(err) => log::warn!("shader watcher error: {err}"),
        })
        .map_err(|err| Error::custom(format!("creating shader watcher: {err}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| Error::custom(format!("watching {}: {err}", root.display())))?;
        log::info!("watching {} for shader changes", root.display());

        Ok(Self {
            _watcher: watcher,
            changes,
            debounce: Debounce::new(DEFAULT_DEBOUNCE),
        })
    }

    /// Non-blocking; call once per frame. True when shaders should be reloaded.
    pub fn poll(&mut self) -> bool {
        let now = Instant::now();
        for path in self.changes.try_iter() {
            log::debug!("shader changed: {}", path.display());
            self.debounce.touch(now);
        }
        self.debounce.fire(now)
    }
}

fn is_shader(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "wgsl")
}
