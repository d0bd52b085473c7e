//! Data directory watcher
//!
//! Feeds file create/remove/rename events for `*.db` files into the
//! registry so the catalog follows databases copied in or deleted out of
//! band. Events are collected over a short debounce window; a rename whose
//! halves were also reported separately is applied once as a rename so the
//! database keeps its grants.

use crate::registry::{database_name_from_path, DatabaseRegistry};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A change to a database file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(PathBuf),
    Removed(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl FileEvent {
    fn touches_database(&self) -> bool {
        let is_db = |p: &Path| database_name_from_path(p).is_some();
        match self {
            FileEvent::Created(p) | FileEvent::Removed(p) => is_db(p),
            FileEvent::Renamed { from, to } => is_db(from) || is_db(to),
        }
    }
}

/// Translate one notify event into database file events
pub fn translate(event: &Event) -> Vec<FileEvent> {
    let events: Vec<FileEvent> = match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(FileEvent::Created).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(FileEvent::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![FileEvent::Renamed {
                from: from.clone(),
                to: to.clone(),
            }],
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(FileEvent::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(FileEvent::Created).collect()
        }
        _ => Vec::new(),
    };
    events.into_iter().filter(FileEvent::touches_database).collect()
}

/// Drop the separate halves of any rename reported as a whole in the same batch
pub fn coalesce(batch: Vec<FileEvent>) -> Vec<FileEvent> {
    let renames: Vec<(PathBuf, PathBuf)> = batch
        .iter()
        .filter_map(|e| match e {
            FileEvent::Renamed { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect();

    let mut out: Vec<FileEvent> = Vec::with_capacity(batch.len());
    for event in batch {
        let shadowed = match &event {
            FileEvent::Removed(p) => renames.iter().any(|(from, _)| from == p),
            FileEvent::Created(p) => renames.iter().any(|(_, to)| to == p),
            FileEvent::Renamed { .. } => false,
        };
        if !shadowed && !out.contains(&event) {
            out.push(event);
        }
    }
    out
}

/// Watch `registry.data_dir()` until `shutdown` fires
pub fn spawn_watcher(
    registry: Arc<DatabaseRegistry>,
    debounce: Duration,
    shutdown: CancellationToken,
) -> notify::Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<FileEvent>();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for change in translate(&event) {
                let _ = tx.send(change);
            }
        }
        Err(e) => warn!("Watch error: {}", e),
    })?;
    watcher.watch(registry.data_dir(), RecursiveMode::NonRecursive)?;
    info!(dir = %registry.data_dir().display(), "Watching data directory");

    Ok(tokio::spawn(async move {
        // The watcher stops delivering events once dropped
        let _watcher = watcher;
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let window = tokio::time::sleep(debounce);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    event = rx.recv() => match event {
                        Some(event) => batch.push(event),
                        None => break,
                    },
                }
            }

            for event in coalesce(batch) {
                if let Err(e) = registry.apply_file_event(&event, &shutdown).await {
                    error!(?event, "Failed to apply data directory event: {}", e);
                }
            }
        }
        debug!("Data directory watcher stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_translate_filters_non_database_files() {
        let created = event(EventKind::Create(CreateKind::File), &["/d/A.db", "/d/A.db-wal", "/d/x.txt"]);
        assert_eq!(translate(&created), vec![FileEvent::Created("/d/A.db".into())]);

        let removed = event(EventKind::Remove(RemoveKind::File), &["/d/B.db"]);
        assert_eq!(translate(&removed), vec![FileEvent::Removed("/d/B.db".into())]);
    }

    #[test]
    fn test_translate_rename() {
        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/d/OLD.db", "/d/NEW.db"],
        );
        assert_eq!(
            translate(&both),
            vec![FileEvent::Renamed {
                from: "/d/OLD.db".into(),
                to: "/d/NEW.db".into()
            }]
        );
    }

    #[test]
    fn test_coalesce_drops_rename_halves() {
        let batch = vec![
            FileEvent::Removed("/d/OLD.db".into()),
            FileEvent::Created("/d/NEW.db".into()),
            FileEvent::Renamed {
                from: "/d/OLD.db".into(),
                to: "/d/NEW.db".into(),
            },
            FileEvent::Created("/d/OTHER.db".into()),
            FileEvent::Created("/d/OTHER.db".into()),
        ];
        assert_eq!(
            coalesce(batch),
            vec![
                FileEvent::Renamed {
                    from: "/d/OLD.db".into(),
                    to: "/d/NEW.db".into()
                },
                FileEvent::Created("/d/OTHER.db".into()),
            ]
        );
    }
}
