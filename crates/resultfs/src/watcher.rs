use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, io};

use crossbeam_channel::Sender;
use notify::RecursiveMode;
use notify_debouncer_full::{
    new_debouncer,
    notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};

use crate::FsEvent;

/// Problems reported by the watcher thread. None of these stop watching;
/// they are logged so the mirror's periodic poll can catch up.
#[derive(Debug, Clone)]
pub enum WatcherError {
    Notify {
        error: String,
        path: Option<PathBuf>,
    },
    /// Too many changes at once; some events were dropped.
    RescanRequired,
    ChannelClosed,
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify { error, path } => {
                write!(f, "file watcher error: {} (path: {:?})", error, path)
            }
            Self::RescanRequired => write!(f, "file watcher requested a rescan"),
            Self::ChannelClosed => write!(f, "file watcher event channel closed"),
        }
    }
}

impl std::error::Error for WatcherError {}

pub(crate) struct Watcher {
    debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    watches: HashSet<PathBuf>,
}

impl Watcher {
    pub(crate) fn new(event_sender: Sender<FsEvent>) -> io::Result<Self> {
        let debounce_timeout = Duration::from_millis(50);

        let debouncer = new_debouncer(
            debounce_timeout,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for fs_event in convert_event(&event.event) {
                            if event_sender.send(fs_event).is_err() {
                                log::debug!("{}", WatcherError::ChannelClosed);
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        let err = if error.paths.is_empty() {
                            WatcherError::RescanRequired
                        } else {
                            WatcherError::Notify {
                                error: format!("{:?}", error.kind),
                                path: error.paths.first().cloned(),
                            }
                        };
                        log::warn!("{}. Some result changes may have been missed.", err);
                    }
                }
            },
        )
        .map_err(|err| io::Error::other(format!("{:?}", err)))?;

        Ok(Self {
            debouncer,
            watches: HashSet::new(),
        })
    }

    pub(crate) fn watch(&mut self, path: &Path) -> io::Result<()> {
        if path
            .ancestors()
            .any(|ancestor| self.watches.contains(ancestor))
        {
            return Ok(());
        }

        match self.debouncer.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                log::debug!("Watching result tree at {}", path.display());
                self.watches.insert(path.to_path_buf());
                Ok(())
            }
            Err(err) => {
                log::warn!("Failed to watch {}: {:?}", path.display(), err);
                Err(io::Error::other(format!("{:?}", err)))
            }
        }
    }
}

/// Collapses notify's event taxonomy into create/write/remove.
pub(crate) fn convert_event(event: &notify::Event) -> Vec<FsEvent> {
    let paths = event.paths.iter().cloned();

    match &event.kind {
        EventKind::Create(
            CreateKind::File | CreateKind::Folder | CreateKind::Any | CreateKind::Other,
        ) => paths.map(FsEvent::Create).collect(),

        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
            paths.map(FsEvent::Write).collect()
        }

        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2 {
                vec![
                    FsEvent::Remove(event.paths[0].clone()),
                    FsEvent::Create(event.paths[1].clone()),
                ]
            } else {
                Vec::new()
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(FsEvent::Remove).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(FsEvent::Create).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
            paths.map(FsEvent::Write).collect()
        }

        EventKind::Remove(
            RemoveKind::File | RemoveKind::Folder | RemoveKind::Any | RemoveKind::Other,
        ) => paths.map(FsEvent::Remove).collect(),

        EventKind::Access(_) => Vec::new(),

        EventKind::Other | EventKind::Any => paths.map(FsEvent::Write).collect(),
    }
}
