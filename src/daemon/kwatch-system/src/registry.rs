//! Watch registry
//!
//! Maps backend identifiers to the paths they were registered for, and back.
//! Lookups on the event path are O(1); path-correlated backends resolve by the
//! longest registered prefix instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kwatch_core::{BackendId, MonitoredPath, Result, WatchError};
use tracing::{debug, warn};

use crate::channel::NotificationChannel;

#[derive(Debug, Default)]
pub struct WatchRegistry {
    by_id: HashMap<BackendId, MonitoredPath>,
    by_path: HashMap<PathBuf, BackendId>,
    /// Registration order, used for iteration and release
    order: Vec<BackendId>,
    /// Canonical form of each path, for matching absolute subjects
    anchors: HashMap<BackendId, PathBuf>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path` with `channel`, making exactly one backend call.
    ///
    /// Fails when the backend refuses the path, when the path is already
    /// registered, or when the backend returns an id that is still live (the
    /// same inode reached through another spelling).
    pub fn register<N>(&mut self, path: &Path, channel: &mut N) -> Result<BackendId>
    where
        N: NotificationChannel + ?Sized,
    {
        if self.by_path.contains_key(path) {
            return Err(WatchError::registration(path, "path is already registered"));
        }

        let id = channel.register_path(path)?;
        if let Some(existing) = self.by_id.get(&id) {
            return Err(WatchError::registration(
                path,
                format!(
                    "backend id {id} is already registered for {}",
                    existing.path.display()
                ),
            ));
        }

        let anchor = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        debug!(path = %path.display(), id = %id, "Registered watch");

        self.by_id.insert(
            id,
            MonitoredPath {
                path: path.to_path_buf(),
                backend_id: id,
            },
        );
        self.by_path.insert(path.to_path_buf(), id);
        self.anchors.insert(id, anchor);
        self.order.push(id);
        Ok(id)
    }

    pub fn resolve(&self, id: BackendId) -> Option<&MonitoredPath> {
        self.by_id.get(&id)
    }

    /// Finds the monitored path containing `subject`, preferring the longest
    /// match. Returns the entry and `subject` relative to it, which is empty
    /// when the subject is the monitored path itself.
    pub fn resolve_subject(&self, subject: &Path) -> Option<(&MonitoredPath, PathBuf)> {
        let mut best: Option<(BackendId, &Path)> = None;
        for (id, anchor) in &self.anchors {
            if !subject.starts_with(anchor) {
                continue;
            }
            let longer = best.map_or(true, |(_, current)| {
                anchor.components().count() > current.components().count()
            });
            if longer {
                best = Some((*id, anchor.as_path()));
            }
        }

        let (id, anchor) = best?;
        let relative = subject.strip_prefix(anchor).ok()?.to_path_buf();
        self.by_id.get(&id).map(|entry| (entry, relative))
    }

    pub fn find(&self, path: &Path) -> Option<&MonitoredPath> {
        self.by_path.get(path).and_then(|id| self.by_id.get(id))
    }

    /// Forgets an entry the kernel has already released, so it is never
    /// deregistered a second time
    pub fn retire(&mut self, id: BackendId) -> Option<MonitoredPath> {
        let entry = self.by_id.remove(&id)?;
        self.by_path.remove(&entry.path);
        self.anchors.remove(&id);
        self.order.retain(|live| *live != id);
        debug!(path = %entry.path.display(), id = %id, "Watch retired by the kernel");
        Some(entry)
    }

    /// Deregisters every live entry in registration order and empties the
    /// registry. Failures are logged and skipped. Returns the number of
    /// entries released.
    pub fn release_all<N>(&mut self, channel: &mut N) -> usize
    where
        N: NotificationChannel + ?Sized,
    {
        let released = self.order.len();
        for id in self.order.drain(..) {
            if let Err(err) = channel.deregister(id) {
                let path = self.by_id.get(&id).map(|entry| entry.path.display().to_string());
                warn!(id = %id, path = ?path, error = %err, "Failed to remove watch");
            }
        }

        self.by_id.clear();
        self.by_path.clear();
        self.anchors.clear();
        if released > 0 {
            debug!(released, "Released all watches");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live entries in registration order
    pub fn iter(&self) -> impl Iterator<Item = &MonitoredPath> + '_ {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}
