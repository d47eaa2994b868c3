use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use crossbeam_channel::Receiver;
use resultfs::{FsEvent, IoResultExt, ResultFs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    BackingStore, BackingStoreFault, BranchHandle, LeafHandle, StoreEvent, TestOutcome,
    TestStatus,
};

/// On-disk shape of a single result file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultFile {
    status: TestStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Error)]
pub enum FsStoreError {
    #[error("{} is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    #[error("could not open result directory {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A backing store over a directory tree.
///
/// Directories are branches. Files ending in the configured suffix are leaves
/// holding a JSON outcome; a file `unit/parser/handles_eof.result.json` is the
/// test with logical path `unit/parser/handles_eof`. Hidden entries (leading
/// `.`) are ignored, which keeps the mirror's own log directory out of the
/// tree.
pub struct FsStore {
    fs: ResultFs,
    root_dir: PathBuf,
    suffix: String,
    root: BranchHandle,

    /// Branch handles by path, so that every listing of a directory reports
    /// the same identity until the directory is removed.
    interned: Mutex<HashMap<Vec<String>, BranchHandle>>,
}

impl FsStore {
    pub fn new(root_dir: impl AsRef<Path>, suffix: impl Into<String>) -> Result<Self, FsStoreError> {
        let fs = ResultFs::new();
        let root_dir = root_dir.as_ref();

        let root_dir = fs
            .canonicalize(root_dir)
            .map_err(|source| FsStoreError::Io {
                path: root_dir.to_path_buf(),
                source,
            })?;

        if !fs.is_dir(&root_dir) {
            return Err(FsStoreError::NotADirectory { path: root_dir });
        }

        let root_name = root_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("results")
            .to_owned();

        Ok(Self {
            fs,
            root: BranchHandle::root(root_name),
            root_dir,
            suffix: suffix.into(),
            interned: Mutex::new(HashMap::new()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Starts watching the result tree and returns the raw event stream.
    /// Feed those events through [`FsStore::translate`].
    pub fn watch(&self) -> Result<Receiver<FsEvent>, FsStoreError> {
        self.fs
            .watch(&self.root_dir)
            .map_err(|source| FsStoreError::Io {
                path: self.root_dir.clone(),
                source,
            })?;

        Ok(self.fs.event_receiver())
    }

    /// Turns a filesystem event into a store event, or `None` if the event
    /// doesn't concern the result tree.
    pub fn translate(&self, event: &FsEvent) -> Option<StoreEvent> {
        let segments = self.relative_segments(event.path())?;
        let (name, parent_segments) = segments.split_last()?;

        if let Some(stem) = name.strip_suffix(self.suffix.as_str()) {
            let logical_path = logical_leaf_path(parent_segments, stem);

            return match event {
                FsEvent::Create(path) => self
                    .read_leaf(path, logical_path)
                    .map(StoreEvent::LeafDiscovered),
                FsEvent::Write(path) => self
                    .read_leaf(path, logical_path)
                    .map(StoreEvent::LeafUpdated),
                FsEvent::Remove(_) => Some(StoreEvent::LeafRemoved { path: logical_path }),
                _ => None,
            };
        }

        match event {
            FsEvent::Create(path) if self.fs.is_dir(path) => Some(StoreEvent::BranchDiscovered {
                parent: self.intern(parent_segments),
                branch: self.intern(&segments),
            }),
            // Only directories we have listed can be in the mirror.
            FsEvent::Remove(_) if self.forget(&segments) => {
                Some(StoreEvent::BranchRemoved { path: segments })
            }
            _ => None,
        }
    }

    fn relative_segments(&self, path: &Path) -> Option<Vec<String>> {
        let relative = path.strip_prefix(&self.root_dir).ok()?;
        let mut segments = Vec::new();

        for component in relative.components() {
            let segment = component.as_os_str().to_str()?;
            if segment.starts_with('.') {
                return None;
            }
            segments.push(segment.to_owned());
        }

        Some(segments)
    }

    fn dir_for(&self, branch: &BranchHandle) -> PathBuf {
        branch
            .path()
            .iter()
            .fold(self.root_dir.clone(), |dir, segment| dir.join(segment))
    }

    fn intern(&self, segments: &[String]) -> BranchHandle {
        let mut interned = self.interned.lock().unwrap();
        let mut current = self.root.clone();

        for depth in 1..=segments.len() {
            let key = &segments[..depth];
            current = match interned.get(key) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = current.child(segments[depth - 1].clone());
                    interned.insert(key.to_vec(), handle.clone());
                    handle
                }
            };
        }

        current
    }

    /// Drops the handles at and below `segments`. Returns whether there was
    /// one for `segments` itself.
    fn forget(&self, segments: &[String]) -> bool {
        let mut interned = self.interned.lock().unwrap();
        let known = interned.contains_key(segments);
        interned.retain(|key, _| !key.starts_with(segments));
        known
    }

    fn read_leaf(&self, path: &Path, logical_path: String) -> Option<LeafHandle> {
        let contents = match self.fs.read(path).with_not_found() {
            Ok(Some(contents)) => contents,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("Could not read result file {}: {}", path.display(), err);
                return None;
            }
        };

        match serde_json::from_slice::<ResultFile>(&contents) {
            Ok(file) => {
                let mut outcome = TestOutcome::new(logical_path, file.status);
                outcome.duration = file.duration_ms.map(Duration::from_millis);
                outcome.message = file.message;
                Some(LeafHandle::new(outcome))
            }
            Err(err) => {
                log::warn!("Skipping malformed result file {}: {}", path.display(), err);
                None
            }
        }
    }

    fn list(&self, branch: &BranchHandle) -> Result<Vec<resultfs::DirEntry>, BackingStoreFault> {
        let dir = self.dir_for(branch);

        match self.fs.read_dir(&dir) {
            Ok(entries) => Ok(entries
                .into_iter()
                .filter(|entry| {
                    entry
                        .file_name()
                        .is_some_and(|name| !name.starts_with('.'))
                })
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BackingStoreFault::Missing {
                path: branch.logical_path(),
            }),
            Err(source) => Err(BackingStoreFault::Io {
                path: branch.logical_path(),
                source,
            }),
        }
    }
}

impl BackingStore for FsStore {
    fn root(&self) -> BranchHandle {
        self.root.clone()
    }

    fn child_branches(
        &self,
        branch: &BranchHandle,
    ) -> Result<Vec<BranchHandle>, BackingStoreFault> {
        let entries = self.list(branch)?;
        let mut segments = branch.path().to_vec();

        Ok(entries
            .iter()
            .filter(|entry| entry.is_dir())
            .filter_map(|entry| entry.file_name())
            .map(|name| {
                segments.push(name.to_owned());
                let handle = self.intern(&segments);
                segments.pop();
                handle
            })
            .collect())
    }

    fn leaf_results(&self, branch: &BranchHandle) -> Result<Vec<LeafHandle>, BackingStoreFault> {
        let entries = self.list(branch)?;

        Ok(entries
            .iter()
            .filter(|entry| !entry.is_dir())
            .filter_map(|entry| {
                let stem = entry.file_name()?.strip_suffix(self.suffix.as_str())?;
                let logical_path = logical_leaf_path(branch.path(), stem);
                self.read_leaf(entry.path(), logical_path)
            })
            .collect())
    }
}

fn logical_leaf_path(parent_segments: &[String], stem: &str) -> String {
    if parent_segments.is_empty() {
        stem.to_owned()
    } else {
        format!("{}/{}", parent_segments.join("/"), stem)
    }
}
