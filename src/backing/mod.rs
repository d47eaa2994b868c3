//! The backing store: the externally owned result tree the mirror projects.
//!
//! The mirror never mutates a store. It holds handles into it and pulls
//! snapshots when a branch materializes.

mod fs;
mod memory;

use std::{fmt, io, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::fs::{FsStore, FsStoreError};
pub use self::memory::MemoryStore;

/// Separator used by logical paths (`suite/module/test_name`).
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl TestStatus {
    pub const ALL: [TestStatus; 6] = [
        TestStatus::Pending,
        TestStatus::Running,
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Errored,
        TestStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Errored => "errored",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn is_finished(self) -> bool {
        !matches!(self, TestStatus::Pending | TestStatus::Running)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Invalid test status '{attempted}'. Valid values are: pending, running, passed, failed, errored, skipped")]
pub struct TestStatusParseError {
    attempted: String,
}

impl FromStr for TestStatus {
    type Err = TestStatusParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        TestStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(source))
            .ok_or_else(|| TestStatusParseError {
                attempted: source.to_owned(),
            })
    }
}

/// One observation of a single test.
///
/// Outcomes are immutable. A status change produces a new outcome sharing the
/// same logical `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub path: String,
    pub status: TestStatus,
    pub duration: Option<Duration>,
    pub message: Option<String>,
}

impl TestOutcome {
    pub fn new(path: impl Into<String>, status: TestStatus) -> Self {
        Self {
            path: path.into(),
            status,
            duration: None,
            message: None,
        }
    }

    pub fn duration(self, duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..self
        }
    }

    pub fn message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    /// The last segment of the logical path.
    pub fn name(&self) -> &str {
        self.path
            .rsplit(PATH_SEPARATOR)
            .next()
            .unwrap_or(self.path.as_str())
    }

    /// The logical path of the branch containing this test.
    pub fn parent_path(&self) -> &str {
        match self.path.rfind(PATH_SEPARATOR) {
            Some(index) => &self.path[..index],
            None => "",
        }
    }
}

/// Handle to a backing leaf. Cloning shares the same outcome instance.
#[derive(Clone)]
pub struct LeafHandle(Arc<TestOutcome>);

impl LeafHandle {
    pub fn new(outcome: TestOutcome) -> Self {
        Self(Arc::new(outcome))
    }

    pub fn outcome(&self) -> &TestOutcome {
        &self.0
    }

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn status(&self) -> TestStatus {
        self.0.status
    }

    /// Whether both handles point at the very same outcome instance. Two
    /// observations of the same test are usually *not* the same instance.
    pub fn same_instance(&self, other: &LeafHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LeafHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeafHandle({} = {})", self.0.path, self.0.status)
    }
}

impl From<TestOutcome> for LeafHandle {
    fn from(outcome: TestOutcome) -> Self {
        Self::new(outcome)
    }
}

#[derive(Debug)]
struct BranchRecord {
    name: String,
    path: Vec<String>,
}

/// Handle to a backing branch.
///
/// Identity is object identity: two handles are the same branch only if they
/// were cloned from one another. Stores hand out the same instance every time
/// they report a given branch.
#[derive(Clone)]
pub struct BranchHandle(Arc<BranchRecord>);

impl BranchHandle {
    /// Creates the handle for a store's root. The root has an empty path.
    pub fn root(name: impl Into<String>) -> Self {
        Self(Arc::new(BranchRecord {
            name: name.into(),
            path: Vec::new(),
        }))
    }

    /// Creates a new identity for a child of `self` called `name`.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        let mut path = self.0.path.clone();
        path.push(name.clone());

        Self(Arc::new(BranchRecord { name, path }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Path segments from the store root, exclusive of the root itself.
    pub fn path(&self) -> &[String] {
        &self.0.path
    }

    pub fn logical_path(&self) -> String {
        self.0.path.join("/")
    }

    pub fn same_identity(&self, other: &BranchHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BranchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchHandle({:?} @ /{})", self.0.name, self.logical_path())
    }
}

#[derive(Debug, Error)]
pub enum BackingStoreFault {
    #[error("branch '/{path}' no longer exists in the backing store")]
    Missing { path: String },

    #[error("failed to read branch '/{path}'")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("backing store could not serve '/{path}': {reason}")]
    Unavailable { path: String, reason: String },
}

/// A mutation reported by a producer (the harness, a watcher, a poll).
#[derive(Debug, Clone)]
pub enum StoreEvent {
    LeafDiscovered(LeafHandle),
    LeafUpdated(LeafHandle),
    LeafRemoved { path: String },
    BranchDiscovered {
        parent: BranchHandle,
        branch: BranchHandle,
    },
    BranchRemoved { path: Vec<String> },
    SubtreeInvalidated(BranchHandle),
}

/// Read-only view of an external result tree.
///
/// Implementations must be safe to call from any thread. Fetches may block on
/// I/O; the mirror never calls them while holding a node lock.
pub trait BackingStore: Send + Sync + 'static {
    fn root(&self) -> BranchHandle;

    fn child_branches(&self, branch: &BranchHandle)
        -> Result<Vec<BranchHandle>, BackingStoreFault>;

    fn leaf_results(&self, branch: &BranchHandle) -> Result<Vec<LeafHandle>, BackingStoreFault>;

    fn logical_path(&self, leaf: &LeafHandle) -> String {
        leaf.path().to_owned()
    }

    fn branch_display_name(&self, branch: &BranchHandle) -> String {
        branch.name().to_owned()
    }

    fn leaf_display_name(&self, leaf: &LeafHandle) -> String {
        leaf.outcome().name().to_owned()
    }

    fn branch_path(&self, branch: &BranchHandle) -> Vec<String> {
        branch.path().to_vec()
    }
}

/// Splits a logical path into its segments, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<String> {
    path.split(PATH_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .collect()
}
