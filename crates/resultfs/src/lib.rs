/*!
Read-only access to a directory tree of test result files, with optional
recursive file watching.

resultfs is the filesystem layer underneath testmirror's `FsStore`. It knows
nothing about test outcomes: it lists directories in a stable order, reads
files, and turns `notify` events into a small set of [`FsEvent`]s that the
mirror's change processor consumes.
*/

mod watcher;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};

pub use watcher::WatcherError;

/// Trait that transforms `io::Result<T>` into `io::Result<Option<T>>`.
///
/// `Ok(None)` takes the place of IO errors whose `io::ErrorKind` is `NotFound`.
/// Result files routinely vanish between an event and the read that follows
/// it, so callers use this to tell "gone" apart from "broken".
pub trait IoResultExt<T> {
    fn with_not_found(self) -> io::Result<Option<T>>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_not_found(self) -> io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// A single entry returned by [`ResultFs::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    path: PathBuf,
    is_dir: bool,
}

impl DirEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// The final path component, if it is valid UTF-8.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// A change observed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FsEvent {
    Create(PathBuf),
    Write(PathBuf),
    Remove(PathBuf),
}

impl FsEvent {
    pub fn path(&self) -> &Path {
        match self {
            FsEvent::Create(path) | FsEvent::Write(path) | FsEvent::Remove(path) => path,
        }
    }
}

struct ResultFsInner {
    event_sender: Sender<FsEvent>,
    watcher: Option<watcher::Watcher>,
}

/// Filesystem access for result trees.
///
/// Reads go straight to `std::fs` (through `fs_err` for better messages).
/// Watching is opt-in: nothing is watched until [`ResultFs::watch`] is called,
/// after which events for the watched tree arrive on
/// [`ResultFs::event_receiver`].
pub struct ResultFs {
    inner: Mutex<ResultFsInner>,
    event_receiver: Receiver<FsEvent>,
}

impl ResultFs {
    pub fn new() -> Self {
        let (event_sender, event_receiver) = crossbeam_channel::unbounded();

        Self {
            inner: Mutex::new(ResultFsInner {
                event_sender,
                watcher: None,
            }),
            event_receiver,
        }
    }

    /// Lists a directory, sorted by file name so that repeated listings of an
    /// unchanged directory are identical.
    pub fn read_dir<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();

        for entry in fs_err::read_dir(path.as_ref())? {
            let entry = entry?;
            let is_dir = entry.file_type()?.is_dir();

            entries.push(DirEntry {
                path: entry.path(),
                is_dir,
            });
        }

        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

        Ok(entries)
    }

    pub fn read<P: AsRef<Path>>(&self, path: P) -> io::Result<Vec<u8>> {
        fs_err::read(path.as_ref())
    }

    pub fn is_dir<P: AsRef<Path>>(&self, path: P) -> bool {
        path.as_ref().is_dir()
    }

    pub fn canonicalize<P: AsRef<Path>>(&self, path: P) -> io::Result<PathBuf> {
        fs_err::canonicalize(path.as_ref())
    }

    /// Starts watching `path` recursively. Watching a path that is already
    /// covered by an existing watch is a no-op.
    pub fn watch<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.watcher.is_none() {
            inner.watcher = Some(watcher::Watcher::new(inner.event_sender.clone())?);
        }

        match inner.watcher.as_mut() {
            Some(watcher) => watcher.watch(path.as_ref()),
            None => Ok(()),
        }
    }

    pub fn is_watching(&self) -> bool {
        self.inner.lock().unwrap().watcher.is_some()
    }

    /// Receiver for watcher events. Clones share the same queue.
    pub fn event_receiver(&self) -> Receiver<FsEvent> {
        self.event_receiver.clone()
    }
}

impl Default for ResultFs {
    fn default() -> Self {
        Self::new()
    }
}
