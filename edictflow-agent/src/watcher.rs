//! Filesystem watcher for managed files
//!
//! Each project registers a watch on its managed file, or on the project
//! directory while that file does not exist yet. Only write and create
//! events whose basename is the managed filename are forwarded; everything
//! else is noise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::Result;

/// Whether an event kind counts as a write or create
pub fn is_significant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Paths in `event` worth rehashing
pub fn significant_paths(event: &Event, managed_filename: &str) -> Vec<PathBuf> {
    if !is_significant(&event.kind) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()) == Some(managed_filename))
        .cloned()
        .collect()
}

/// Watches managed files and forwards significant paths to a channel
pub struct FileWatcher {
    inner: RecommendedWatcher,
    managed_filename: String,
    /// Project dir -> the path actually registered with the OS
    registered: HashMap<PathBuf, PathBuf>,
}

impl FileWatcher {
    pub fn new(managed_filename: impl Into<String>, events: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let managed_filename = managed_filename.into();
        let filter = managed_filename.clone();
        let inner = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in significant_paths(&event, &filter) {
                    if events.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "watch error"),
        })?;
        Ok(Self {
            inner,
            managed_filename,
            registered: HashMap::new(),
        })
    }

    /// Managed file inside `project_dir`
    pub fn managed_path(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.managed_filename)
    }

    /// Watch the managed file of `project_dir`, or the directory if the file is missing
    pub fn watch_project(&mut self, project_dir: &Path) -> Result<()> {
        let file = self.managed_path(project_dir);
        let target = if file.exists() {
            file
        } else {
            project_dir.to_path_buf()
        };
        if self.registered.get(project_dir) == Some(&target) {
            return Ok(());
        }
        self.unwatch_project(project_dir)?;
        self.inner.watch(&target, RecursiveMode::NonRecursive)?;
        tracing::debug!(target = %target.display(), "watching");
        self.registered.insert(project_dir.to_path_buf(), target);
        Ok(())
    }

    pub fn unwatch_project(&mut self, project_dir: &Path) -> Result<()> {
        if let Some(previous) = self.registered.remove(project_dir) {
            if let Err(e) = self.inner.unwatch(&previous) {
                tracing::debug!(target = %previous.display(), error = %e, "unwatch failed");
            }
        }
        Ok(())
    }

    pub fn watched_projects(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.registered.keys().cloned().collect();
        dirs.sort();
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_write_and_create_are_significant() {
        assert!(is_significant(&EventKind::Create(CreateKind::File)));
        assert!(is_significant(&EventKind::Modify(ModifyKind::Data(DataChange::Content))));
        assert!(is_significant(&EventKind::Access(AccessKind::Close(AccessMode::Write))));
        assert!(!is_significant(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_significant(&EventKind::Access(AccessKind::Read)));
    }

    #[test]
    fn test_basename_filter() {
        let e = event(EventKind::Create(CreateKind::File), "/work/app/CLAUDE.md");
        assert_eq!(significant_paths(&e, "CLAUDE.md"), vec![PathBuf::from("/work/app/CLAUDE.md")]);

        let e = event(EventKind::Create(CreateKind::File), "/work/app/CLAUDE.md.swp");
        assert!(significant_paths(&e, "CLAUDE.md").is_empty());

        let e = event(EventKind::Remove(RemoveKind::File), "/work/app/CLAUDE.md");
        assert!(significant_paths(&e, "CLAUDE.md").is_empty());
    }

    #[tokio::test]
    async fn test_directory_watch_sees_file_creation() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = FileWatcher::new("CLAUDE.md", tx).unwrap();
        watcher.watch_project(dir.path()).unwrap();
        assert_eq!(watcher.watched_projects(), vec![dir.path().to_path_buf()]);

        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "hello").unwrap();

        let path = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "CLAUDE.md");
    }
}
