use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use super::{BackingStore, BackingStoreFault, BranchHandle, LeafHandle, TestOutcome};

struct MemoryBranch {
    handle: BranchHandle,
    branches: Vec<BranchHandle>,
    leaves: Vec<LeafHandle>,
}

impl MemoryBranch {
    fn new(handle: BranchHandle) -> Self {
        Self {
            handle,
            branches: Vec::new(),
            leaves: Vec::new(),
        }
    }
}

/// A mutable, thread-safe backing store held entirely in memory.
///
/// Used by tests and benchmarks, and by embedders whose harness reports
/// results directly instead of through files. Branches are keyed by logical
/// path; each path keeps the same handle instance until it is removed.
pub struct MemoryStore {
    root: BranchHandle,
    branches: RwLock<HashMap<String, MemoryBranch>>,

    /// Number of `child_branches` calls served, i.e. materialization pulls.
    fetches: AtomicUsize,
    pending_faults: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = BranchHandle::root(root_name);
        let mut branches = HashMap::new();
        branches.insert(String::new(), MemoryBranch::new(root.clone()));

        Self {
            root,
            branches: RwLock::new(branches),
            fetches: AtomicUsize::new(0),
            pending_faults: AtomicUsize::new(0),
            fetch_delay: Mutex::new(None),
        }
    }

    /// Adds a child branch, or returns the existing one with that name.
    ///
    /// Panics if `parent` is not part of this store.
    pub fn add_branch(&self, parent: &BranchHandle, name: &str) -> BranchHandle {
        let mut branches = self.branches.write().unwrap();
        let parent_key = parent.logical_path();

        let existing = branches
            .get(&parent_key)
            .unwrap_or_else(|| panic!("{:?} is not part of this store", parent))
            .branches
            .iter()
            .find(|branch| branch.name() == name)
            .cloned();

        if let Some(existing) = existing {
            return existing;
        }

        let child = parent.child(name);
        branches.insert(child.logical_path(), MemoryBranch::new(child.clone()));
        if let Some(entry) = branches.get_mut(&parent_key) {
            entry.branches.push(child.clone());
        }

        child
    }

    /// Adds every missing branch along `path` and returns the deepest one.
    pub fn ensure_path(&self, path: &str) -> BranchHandle {
        super::split_path(path)
            .iter()
            .fold(self.root.clone(), |parent, name| self.add_branch(&parent, name))
    }

    /// Records an outcome under the branch named by the outcome's parent
    /// path, creating branches as needed. An existing outcome with the same
    /// logical path is replaced.
    pub fn record(&self, outcome: TestOutcome) -> LeafHandle {
        let parent = self.ensure_path(outcome.parent_path());
        let leaf = LeafHandle::new(outcome);

        let mut branches = self.branches.write().unwrap();
        if let Some(entry) = branches.get_mut(&parent.logical_path()) {
            match entry
                .leaves
                .iter_mut()
                .find(|existing| existing.path() == leaf.path())
            {
                Some(existing) => *existing = leaf.clone(),
                None => entry.leaves.push(leaf.clone()),
            }
        }

        leaf
    }

    /// Removes a branch and everything under it.
    pub fn remove_branch(&self, path: &str) -> Option<BranchHandle> {
        let key = super::split_path(path).join("/");
        if key.is_empty() {
            return None;
        }

        let mut branches = self.branches.write().unwrap();
        let removed = branches.remove(&key)?.handle;

        let prefix = format!("{}/", key);
        branches.retain(|path, _| !path.starts_with(&prefix));

        let parent_key = match key.rfind('/') {
            Some(index) => key[..index].to_owned(),
            None => String::new(),
        };
        if let Some(parent) = branches.get_mut(&parent_key) {
            parent
                .branches
                .retain(|branch| !branch.same_identity(&removed));
        }

        Some(removed)
    }

    pub fn remove_leaf(&self, path: &str) -> Option<LeafHandle> {
        let parent_key = match path.rfind('/') {
            Some(index) => &path[..index],
            None => "",
        };

        let mut branches = self.branches.write().unwrap();
        let entry = branches.get_mut(parent_key)?;
        let index = entry.leaves.iter().position(|leaf| leaf.path() == path)?;

        Some(entry.leaves.remove(index))
    }

    pub fn branch(&self, path: &str) -> Option<BranchHandle> {
        let key = super::split_path(path).join("/");
        self.branches
            .read()
            .unwrap()
            .get(&key)
            .map(|entry| entry.handle.clone())
    }

    pub fn leaf(&self, path: &str) -> Option<LeafHandle> {
        let parent_key = match path.rfind('/') {
            Some(index) => &path[..index],
            None => "",
        };

        self.branches
            .read()
            .unwrap()
            .get(parent_key)?
            .leaves
            .iter()
            .find(|leaf| leaf.path() == path)
            .cloned()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Makes the next `count` fetches fail with `BackingStoreFault::Unavailable`.
    pub fn fail_next_fetches(&self, count: usize) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    /// Makes every fetch sleep first, widening race windows in tests.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    fn lookup(&self, branch: &BranchHandle) -> Result<(), BackingStoreFault> {
        let branches = self.branches.read().unwrap();
        match branches.get(&branch.logical_path()) {
            Some(entry) if entry.handle.same_identity(branch) => Ok(()),
            _ => Err(BackingStoreFault::Missing {
                path: branch.logical_path(),
            }),
        }
    }

    fn take_fault(&self, branch: &BranchHandle) -> Result<(), BackingStoreFault> {
        let took = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();

        if took {
            Err(BackingStoreFault::Unavailable {
                path: branch.logical_path(),
                reason: "injected fault".to_owned(),
            })
        } else {
            Ok(())
        }
    }
}

impl BackingStore for MemoryStore {
    fn root(&self) -> BranchHandle {
        self.root.clone()
    }

    fn child_branches(
        &self,
        branch: &BranchHandle,
    ) -> Result<Vec<BranchHandle>, BackingStoreFault> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        self.take_fault(branch)?;
        self.lookup(branch)?;

        let branches = self.branches.read().unwrap();
        Ok(branches
            .get(&branch.logical_path())
            .map(|entry| entry.branches.clone())
            .unwrap_or_default())
    }

    fn leaf_results(&self, branch: &BranchHandle) -> Result<Vec<LeafHandle>, BackingStoreFault> {
        self.lookup(branch)?;

        let branches = self.branches.read().unwrap();
        Ok(branches
            .get(&branch.logical_path())
            .map(|entry| entry.leaves.clone())
            .unwrap_or_default())
    }
}
