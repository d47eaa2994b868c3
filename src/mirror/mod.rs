//! The lazily loaded mirror of a backing store's test tree.

mod insertion;
mod materialize;
mod node;

#[cfg(test)]
mod tests;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use rayon::prelude::*;

use crate::{
    backing::{split_path, BackingStore, BranchHandle, LeafHandle, StoreEvent},
    change::ChangeNotifier,
};

pub use self::{
    insertion::{insert_sorted, Comparator, Placement},
    materialize::MaterializationState,
    node::{
        BranchNode, LeafChange, LeafNode, MirrorError, MirrorNode, NodeId, NodeKind,
        StatusCounts,
    },
};

use self::node::TreeContext;

/// How a producer notification was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// The mirror was mutated.
    Applied,

    /// The affected branch isn't loaded yet. It will see the change when it
    /// is.
    Absorbed,

    /// The affected branch is loaded but the target doesn't exist, even
    /// after re-reading the parent.
    NotFound,

    /// The root itself changed; the whole tree has to be rebuilt.
    RebuildRequired,
}

enum Located {
    Found(Arc<MirrorNode>),
    Unmaterialized,
    Missing,
}

/// A mirror over one backing store.
pub struct MirrorTree {
    context: Arc<TreeContext>,
    root: Arc<MirrorNode>,
}

impl MirrorTree {
    pub fn new(
        store: Arc<dyn BackingStore>,
        comparator: Option<Comparator>,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        let context = Arc::new(TreeContext {
            store,
            notifier,
            comparator,
        });
        let root = MirrorNode::new_root(Arc::clone(&context));

        Self { context, root }
    }

    pub fn root(&self) -> &Arc<MirrorNode> {
        &self.root
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.context.store
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.context.notifier
    }

    pub fn comparator(&self) -> Option<&Comparator> {
        self.context.comparator.as_ref()
    }

    /// Loads `node`'s children if needed. Returns whether this call did it.
    pub fn materialize_on_demand(&self, node: &MirrorNode) -> Result<bool, MirrorError> {
        node.materialize()
    }

    /// Loads every branch down to `max_depth` levels below the root, in
    /// parallel. Failed branches are reported and their subtrees skipped.
    pub fn materialize_all(&self, max_depth: Option<usize>) -> Vec<MirrorError> {
        profiling::scope!("MirrorTree::materialize_all");

        let errors = Mutex::new(Vec::new());
        materialize_recursive(&self.root, 0, max_depth, &errors);
        errors.into_inner().unwrap()
    }

    /// Walks display names from the root, loading branches on the way.
    pub fn find_node_by_path<S: AsRef<str>>(
        &self,
        path: &[S],
    ) -> Result<Option<Arc<MirrorNode>>, MirrorError> {
        let mut current = Arc::clone(&self.root);

        for name in path {
            if !current.is_branch() {
                return Ok(None);
            }
            match current.find_by_display_name(name.as_ref())? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    /// Finds a loaded branch by backing path without starting any load. A
    /// branch that is being loaded right now is waited for, since its fetch
    /// may predate the change being routed. When `resync` is set, a loaded
    /// branch missing the next segment re-reads its child branches once
    /// before giving up.
    fn locate(&self, path: &[String], resync: bool) -> Result<Located, MirrorError> {
        let mut current = Arc::clone(&self.root);

        for segment in path {
            if !settle(&current)? {
                return Ok(Located::Unmaterialized);
            }

            let next = match current.loaded_child_named(segment) {
                Some(next) => next,
                None if resync => {
                    current.resync_branches()?;
                    match current.loaded_child_named(segment) {
                        Some(next) => next,
                        None => return Ok(Located::Missing),
                    }
                }
                None => return Ok(Located::Missing),
            };

            if !next.is_branch() {
                return Ok(Located::Missing);
            }
            current = next;
        }

        if !settle(&current)? {
            return Ok(Located::Unmaterialized);
        }

        Ok(Located::Found(current))
    }

    /// A test outcome was recorded for the first time.
    pub fn on_leaf_discovered(&self, leaf: LeafHandle) -> Result<Routed, MirrorError> {
        let mut path = split_path(&self.context.store.logical_path(&leaf));
        path.pop();

        match self.locate(&path, true)? {
            Located::Found(branch) => {
                branch.insert_or_update_leaf(leaf)?;
                Ok(Routed::Applied)
            }
            Located::Unmaterialized => Ok(Routed::Absorbed),
            Located::Missing => {
                log::debug!("No branch for discovered leaf '{}'", leaf.path());
                Ok(Routed::NotFound)
            }
        }
    }

    /// A newer outcome replaced an existing one.
    pub fn on_leaf_updated(&self, leaf: LeafHandle) -> Result<Routed, MirrorError> {
        self.on_leaf_discovered(leaf)
    }

    pub fn on_leaf_removed(&self, logical_path: &str) -> Result<Routed, MirrorError> {
        let mut path = split_path(logical_path);
        path.pop();

        match self.locate(&path, false)? {
            Located::Found(branch) => match branch.remove_leaf_path(logical_path) {
                Some(_) => Ok(Routed::Applied),
                None => Ok(Routed::NotFound),
            },
            Located::Unmaterialized => Ok(Routed::Absorbed),
            Located::Missing => Ok(Routed::NotFound),
        }
    }

    pub fn on_branch_discovered(
        &self,
        parent: &BranchHandle,
        branch: BranchHandle,
    ) -> Result<Routed, MirrorError> {
        let path = self.context.store.branch_path(parent);

        match self.locate(&path, true)? {
            Located::Found(owner) => {
                owner.insert_branches([branch])?;
                Ok(Routed::Applied)
            }
            Located::Unmaterialized => Ok(Routed::Absorbed),
            Located::Missing => {
                log::debug!("No branch for discovered branch '{}'", branch.logical_path());
                Ok(Routed::NotFound)
            }
        }
    }

    pub fn on_branch_removed(&self, path: &[String]) -> Result<Routed, MirrorError> {
        let Some((name, parent)) = path.split_last() else {
            return Ok(Routed::RebuildRequired);
        };

        match self.locate(parent, false)? {
            Located::Found(owner) => {
                let removed = owner
                    .loaded_child_named(name)
                    .filter(|child| child.is_branch())
                    .and_then(|child| owner.remove_child(&child));

                match removed {
                    Some(_) => Ok(Routed::Applied),
                    None => Ok(Routed::NotFound),
                }
            }
            Located::Unmaterialized => Ok(Routed::Absorbed),
            Located::Missing => Ok(Routed::NotFound),
        }
    }

    /// The contents below `branch` changed wholesale. Its mirror subtree is
    /// discarded and replaced with an unloaded branch.
    pub fn on_subtree_invalidated(&self, branch: BranchHandle) -> Result<Routed, MirrorError> {
        let path = self.context.store.branch_path(&branch);
        let Some((name, parent)) = path.split_last() else {
            return Ok(Routed::RebuildRequired);
        };

        match self.locate(parent, false)? {
            Located::Found(owner) => match owner.replace_subtree(name, branch) {
                Some(_) => Ok(Routed::Applied),
                None => Ok(Routed::NotFound),
            },
            Located::Unmaterialized => Ok(Routed::Absorbed),
            Located::Missing => Ok(Routed::NotFound),
        }
    }

    pub fn apply(&self, event: StoreEvent) -> Result<Routed, MirrorError> {
        match event {
            StoreEvent::LeafDiscovered(leaf) => self.on_leaf_discovered(leaf),
            StoreEvent::LeafUpdated(leaf) => self.on_leaf_updated(leaf),
            StoreEvent::LeafRemoved { path } => self.on_leaf_removed(&path),
            StoreEvent::BranchDiscovered { parent, branch } => {
                self.on_branch_discovered(&parent, branch)
            }
            StoreEvent::BranchRemoved { path } => self.on_branch_removed(&path),
            StoreEvent::SubtreeInvalidated(branch) => self.on_subtree_invalidated(branch),
        }
    }

    /// Re-reads every loaded branch, top down, and applies the differences.
    /// Returns how many branches changed.
    pub fn refresh(&self) -> usize {
        profiling::scope!("MirrorTree::refresh");

        let mut queue = VecDeque::from([Arc::clone(&self.root)]);
        let mut changed = 0;

        while let Some(node) = queue.pop_front() {
            if !node.is_branch() || !node.is_materialized() {
                continue;
            }

            match node.reconcile() {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(err) => {
                    log::debug!("Skipping refresh of '/{}': {}", node.path().join("/"), err);
                    continue;
                }
            }

            queue.extend(
                node.loaded_children()
                    .into_iter()
                    .filter(|child| child.is_branch()),
            );
        }

        changed
    }
}

/// Whether `branch` is loaded, waiting out a load in progress.
fn settle(branch: &MirrorNode) -> Result<bool, MirrorError> {
    match branch.materialization_state() {
        Some(MaterializationState::Unmaterialized) => Ok(false),
        Some(MaterializationState::Materializing) => branch.materialize().map(|_| true),
        Some(MaterializationState::Materialized) | None => Ok(true),
    }
}

fn materialize_recursive(
    node: &Arc<MirrorNode>,
    depth: usize,
    max_depth: Option<usize>,
    errors: &Mutex<Vec<MirrorError>>,
) {
    if max_depth.is_some_and(|max| depth >= max) {
        return;
    }

    match node.children() {
        Ok(children) => children
            .par_iter()
            .filter(|child| child.is_branch())
            .for_each(|child| materialize_recursive(child, depth + 1, max_depth, errors)),
        Err(err) => errors.lock().unwrap().push(err),
    }
}
