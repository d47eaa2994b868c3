use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, RwLock, Weak,
    },
};

use serde::Serialize;
use thiserror::Error;

use crate::{
    backing::{
        split_path, BackingStore, BackingStoreFault, BranchHandle, LeafHandle, TestStatus,
    },
    change::{ChangeKind, ChangeNotifier, ChangeRecord},
    filter::{self, ActiveFilterQuery},
};

use super::{
    insertion::{insert_sorted, Comparator, Placement},
    materialize::{MaterializationCell, MaterializationState},
};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// How many times a refresh re-fetches a branch that producers keep
/// mutating before leaving it to the next refresh.
const RECONCILE_ATTEMPTS: usize = 3;

/// Process-unique identifier of a mirror node. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State shared by every branch of one mirror tree.
pub(crate) struct TreeContext {
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) notifier: Arc<ChangeNotifier>,
    pub(crate) comparator: Option<Comparator>,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("child index {index} is out of range for '{branch}' ({count} children)")]
    IndexOutOfRange {
        branch: String,
        index: usize,
        count: usize,
    },

    #[error("'{node}' is a leaf and has no children")]
    NotABranch { node: String },

    #[error("could not load '/{branch}'")]
    Backing {
        branch: String,
        #[source]
        source: BackingStoreFault,
    },
}

/// What [`MirrorNode::insert_or_update_leaf`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafChange {
    Inserted(usize),
    Updated(usize),
}

impl LeafChange {
    pub fn index(self) -> usize {
        match self {
            LeafChange::Inserted(index) | LeafChange::Updated(index) => index,
        }
    }
}

/// Per-status totals over the loaded part of a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,

    /// Branches whose children have not been loaded yet.
    pub unloaded_branches: usize,
}

impl StatusCounts {
    fn add(&mut self, status: TestStatus) {
        let slot = match status {
            TestStatus::Pending => &mut self.pending,
            TestStatus::Running => &mut self.running,
            TestStatus::Passed => &mut self.passed,
            TestStatus::Failed => &mut self.failed,
            TestStatus::Errored => &mut self.errored,
            TestStatus::Skipped => &mut self.skipped,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.passed + self.failed + self.errored + self.skipped
    }
}

/// A node of the displayed tree.
pub struct MirrorNode {
    id: NodeId,
    parent: Weak<MirrorNode>,
    display_name: String,
    kind: NodeKind,
}

pub enum NodeKind {
    Branch(BranchNode),
    Leaf(LeafNode),
}

pub struct BranchNode {
    this: Weak<MirrorNode>,
    handle: BranchHandle,
    state: MaterializationCell,

    /// Guards the child sequence. Held for the whole of one mutation,
    /// including publication of its change record.
    children: Mutex<Vec<Arc<MirrorNode>>>,

    /// Signalled, with `children` locked, whenever `state` leaves
    /// `Materializing`.
    settled: Condvar,

    /// Bumped, with `children` locked, by every mutation that publishes a
    /// record. Lets a refresh tell whether its store snapshot went stale
    /// while it was being fetched.
    revision: AtomicU64,

    context: Arc<TreeContext>,
}

impl BranchNode {
    pub fn handle(&self) -> &BranchHandle {
        &self.handle
    }

    pub fn state(&self) -> MaterializationState {
        self.state.get()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<MirrorNode>>> {
        self.children.lock().unwrap()
    }
}

pub struct LeafNode {
    logical_path: String,
    handle: RwLock<LeafHandle>,
}

impl LeafNode {
    pub fn logical_path(&self) -> &str {
        &self.logical_path
    }

    pub fn handle(&self) -> LeafHandle {
        self.handle.read().unwrap().clone()
    }
}

/// A leaf's names, computed before any lock is taken.
struct PreparedLeaf {
    handle: LeafHandle,
    logical_path: String,
    display_name: String,
}

impl PreparedLeaf {
    fn new(store: &dyn BackingStore, handle: LeafHandle) -> Self {
        Self {
            logical_path: store.logical_path(&handle),
            display_name: store.leaf_display_name(&handle),
            handle,
        }
    }
}

struct PreparedBranch {
    handle: BranchHandle,
    display_name: String,
}

impl PreparedBranch {
    fn new(store: &dyn BackingStore, handle: BranchHandle) -> Self {
        Self {
            display_name: store.branch_display_name(&handle),
            handle,
        }
    }
}

fn display_name_of(node: &Arc<MirrorNode>) -> &str {
    &node.display_name
}

impl MirrorNode {
    pub(crate) fn new_root(context: Arc<TreeContext>) -> Arc<Self> {
        let handle = context.store.root();
        let prepared = PreparedBranch::new(context.store.as_ref(), handle);
        Self::new_branch(Weak::new(), prepared, context)
    }

    fn new_branch(
        parent: Weak<MirrorNode>,
        prepared: PreparedBranch,
        context: Arc<TreeContext>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| MirrorNode {
            id: NodeId::next(),
            parent,
            display_name: prepared.display_name,
            kind: NodeKind::Branch(BranchNode {
                this: this.clone(),
                handle: prepared.handle,
                state: MaterializationCell::new(),
                children: Mutex::new(Vec::new()),
                settled: Condvar::new(),
                revision: AtomicU64::new(0),
                context,
            }),
        })
    }

    fn new_leaf(parent: Weak<MirrorNode>, prepared: PreparedLeaf) -> Arc<Self> {
        Arc::new(MirrorNode {
            id: NodeId::next(),
            parent,
            display_name: prepared.display_name,
            kind: NodeKind::Leaf(LeafNode {
                logical_path: prepared.logical_path,
                handle: RwLock::new(prepared.handle),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn parent(&self) -> Option<Arc<MirrorNode>> {
        self.parent.upgrade()
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.kind, NodeKind::Branch(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn branch_handle(&self) -> Option<&BranchHandle> {
        match &self.kind {
            NodeKind::Branch(branch) => Some(&branch.handle),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn leaf_handle(&self) -> Option<LeafHandle> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(leaf.handle()),
            NodeKind::Branch(_) => None,
        }
    }

    pub fn leaf_logical_path(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf(leaf) => Some(&leaf.logical_path),
            NodeKind::Branch(_) => None,
        }
    }

    pub fn status(&self) -> Option<TestStatus> {
        self.leaf_handle().map(|leaf| leaf.status())
    }

    /// `None` for leaves.
    pub fn materialization_state(&self) -> Option<MaterializationState> {
        match &self.kind {
            NodeKind::Branch(branch) => Some(branch.state()),
            NodeKind::Leaf(_) => None,
        }
    }

    /// Leaves count as materialized: there is nothing to load.
    pub fn is_materialized(&self) -> bool {
        match &self.kind {
            NodeKind::Branch(branch) => branch.state() == MaterializationState::Materialized,
            NodeKind::Leaf(_) => true,
        }
    }

    fn wraps_branch(&self, handle: &BranchHandle) -> bool {
        match &self.kind {
            NodeKind::Branch(branch) => branch.handle.same_identity(handle),
            NodeKind::Leaf(_) => false,
        }
    }

    /// Display names from the root down to this node, exclusive of the root.
    pub fn path(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = match self.parent() {
            Some(parent) => parent,
            None => return names,
        };
        names.push(self.display_name.clone());

        while let Some(next) = current.parent() {
            names.push(current.display_name.clone());
            current = next;
        }

        names.reverse();
        names
    }

    /// Node ids from the root down to and including this node.
    pub fn id_path(&self) -> Vec<NodeId> {
        let mut ids = vec![self.id];
        let mut current = self.parent();

        while let Some(node) = current {
            ids.push(node.id);
            current = node.parent();
        }

        ids.reverse();
        ids
    }

    /// The path of the wrapped backing node, as the store sees it.
    pub fn backing_path(&self, store: &dyn BackingStore) -> Vec<String> {
        match &self.kind {
            NodeKind::Branch(branch) => store.branch_path(&branch.handle),
            NodeKind::Leaf(leaf) => split_path(&store.logical_path(&leaf.handle())),
        }
    }

    /// Display verdict for this node. Branches are always accepted.
    pub fn is_accepted(&self, filter: Option<&dyn ActiveFilterQuery>) -> bool {
        match (&self.kind, filter) {
            (NodeKind::Leaf(leaf), Some(filter)) => filter::is_accepted(filter, &leaf.handle()),
            _ => true,
        }
    }

    fn branch(&self) -> Result<&BranchNode, MirrorError> {
        match &self.kind {
            NodeKind::Branch(branch) => Ok(branch),
            NodeKind::Leaf(_) => Err(MirrorError::NotABranch {
                node: self.display_name.clone(),
            }),
        }
    }

    /// Loads this branch from the store if that hasn't happened yet, waiting
    /// for a load already in progress on another thread.
    ///
    /// Returns whether this call did the loading.
    pub fn materialize(&self) -> Result<bool, MirrorError> {
        match &self.kind {
            NodeKind::Branch(branch) => self.ensure_materialized(branch),
            NodeKind::Leaf(_) => Ok(false),
        }
    }

    /// Like [`MirrorNode::materialize`], but returns `Ok(false)` immediately
    /// when the branch is loaded or being loaded elsewhere.
    pub fn try_materialize(&self) -> Result<bool, MirrorError> {
        match &self.kind {
            NodeKind::Branch(branch) => match branch.state.try_begin() {
                Ok(()) => self.run_materialization(branch).map(|()| true),
                Err(_) => Ok(false),
            },
            NodeKind::Leaf(_) => Ok(false),
        }
    }

    fn ensure_materialized(&self, branch: &BranchNode) -> Result<bool, MirrorError> {
        loop {
            match branch.state.try_begin() {
                Ok(()) => return self.run_materialization(branch).map(|()| true),
                Err(MaterializationState::Materialized) => return Ok(false),
                Err(_) => {
                    let children = branch.lock();
                    let _children = branch
                        .settled
                        .wait_while(children, |_| {
                            branch.state.get() == MaterializationState::Materializing
                        })
                        .unwrap();
                    // Either loaded, or the loader failed and we retry.
                }
            }
        }
    }

    #[profiling::function]
    fn run_materialization(&self, branch: &BranchNode) -> Result<(), MirrorError> {
        log::trace!("Materializing '/{}'", self.path().join("/"));

        let fetched = self.fetch_snapshot();

        let mut children = branch.lock();

        let (branches, leaves) = match fetched {
            Ok(snapshot) => snapshot,
            Err(err) => {
                branch.state.abort();
                drop(children);
                branch.settled.notify_all();

                if let MirrorError::Backing { branch, source } = &err {
                    log::warn!("Could not load '/{}': {}", branch, source);
                }
                return Err(err);
            }
        };

        let mut created = HashSet::new();

        for prepared in branches {
            let (node, is_new) = self.place_branch(branch, &mut children, prepared);
            if is_new {
                created.insert(node.id);
            }
        }

        for prepared in leaves {
            let (_, _, node) = self.place_leaf(branch, &mut children, prepared);
            created.insert(node.id);
        }

        branch.state.finish();

        let (indices, nodes) = positions_of(&children, &created);
        let count = children.len();
        self.publish(branch, ChangeKind::Inserted, indices, nodes);

        drop(children);
        branch.settled.notify_all();

        log::debug!(
            "Materialized '/{}' with {} children",
            self.path().join("/"),
            count
        );

        Ok(())
    }

    /// Pulls this branch's current children from the store. Never called
    /// with the child lock held.
    fn fetch_snapshot(&self) -> Result<(Vec<PreparedBranch>, Vec<PreparedLeaf>), MirrorError> {
        let branch = self.branch()?;
        let store = branch.context.store.as_ref();

        let fetched = store
            .child_branches(&branch.handle)
            .and_then(|branches| Ok((branches, store.leaf_results(&branch.handle)?)));

        match fetched {
            Ok((branches, leaves)) => Ok((
                branches
                    .into_iter()
                    .map(|handle| PreparedBranch::new(store, handle))
                    .collect(),
                leaves
                    .into_iter()
                    .map(|handle| PreparedLeaf::new(store, handle))
                    .collect(),
            )),
            Err(source) => Err(MirrorError::Backing {
                branch: branch.handle.logical_path(),
                source,
            }),
        }
    }

    pub fn child_count(&self) -> Result<usize, MirrorError> {
        match &self.kind {
            NodeKind::Branch(branch) => {
                self.ensure_materialized(branch)?;
                Ok(branch.lock().len())
            }
            NodeKind::Leaf(_) => Ok(0),
        }
    }

    pub fn child_at(&self, index: usize) -> Result<Arc<MirrorNode>, MirrorError> {
        let branch = self.branch()?;
        self.ensure_materialized(branch)?;

        let children = branch.lock();
        children
            .get(index)
            .cloned()
            .ok_or_else(|| MirrorError::IndexOutOfRange {
                branch: self.display_name.clone(),
                index,
                count: children.len(),
            })
    }

    /// A snapshot of the current children.
    pub fn children(&self) -> Result<Vec<Arc<MirrorNode>>, MirrorError> {
        match &self.kind {
            NodeKind::Branch(branch) => {
                self.ensure_materialized(branch)?;
                Ok(branch.lock().clone())
            }
            NodeKind::Leaf(_) => Ok(Vec::new()),
        }
    }

    /// The children loaded so far, without triggering a load.
    pub fn loaded_children(&self) -> Vec<Arc<MirrorNode>> {
        match &self.kind {
            NodeKind::Branch(branch) => branch.lock().clone(),
            NodeKind::Leaf(_) => Vec::new(),
        }
    }

    pub(crate) fn loaded_child_named(&self, name: &str) -> Option<Arc<MirrorNode>> {
        match &self.kind {
            NodeKind::Branch(branch) => branch
                .lock()
                .iter()
                .find(|child| child.display_name == name)
                .cloned(),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn find_by_display_name(&self, name: &str) -> Result<Option<Arc<MirrorNode>>, MirrorError> {
        let branch = self.branch()?;
        self.ensure_materialized(branch)?;

        Ok(branch
            .lock()
            .iter()
            .find(|child| child.display_name == name)
            .cloned())
    }

    /// Finds the leaf child with the same logical path as `leaf`, regardless
    /// of which outcome instance it currently wraps.
    pub fn find_by_leaf_identity(
        &self,
        leaf: &LeafHandle,
    ) -> Result<Option<(usize, Arc<MirrorNode>)>, MirrorError> {
        let branch = self.branch()?;
        self.ensure_materialized(branch)?;

        let logical_path = branch.context.store.logical_path(leaf);

        Ok(branch
            .lock()
            .iter()
            .enumerate()
            .find(|(_, child)| child.leaf_logical_path() == Some(logical_path.as_str()))
            .map(|(index, child)| (index, Arc::clone(child))))
    }

    /// Records a test outcome. An existing leaf with the same logical path
    /// keeps its position and starts wrapping `leaf`; otherwise a new leaf is
    /// placed in order.
    pub fn insert_or_update_leaf(&self, leaf: LeafHandle) -> Result<LeafChange, MirrorError> {
        let branch = self.branch()?;
        self.ensure_materialized(branch)?;

        let prepared = PreparedLeaf::new(branch.context.store.as_ref(), leaf);

        let mut children = branch.lock();
        let (kind, index, node) = self.place_leaf(branch, &mut children, prepared);
        self.publish(branch, kind, vec![index], vec![node.id]);

        Ok(match kind {
            ChangeKind::Inserted => LeafChange::Inserted(index),
            _ => LeafChange::Updated(index),
        })
    }

    /// Adds child branches, reusing children that already wrap the same
    /// backing branch. Returns the final position of each given branch, in
    /// input order; a branch displaced by a later name collision in the same
    /// batch has no position and is skipped.
    pub fn insert_branches<I>(&self, handles: I) -> Result<Vec<usize>, MirrorError>
    where
        I: IntoIterator<Item = BranchHandle>,
    {
        let branch = self.branch()?;
        self.ensure_materialized(branch)?;

        let store = branch.context.store.as_ref();
        let prepared: Vec<_> = handles
            .into_iter()
            .map(|handle| PreparedBranch::new(store, handle))
            .collect();

        let mut children = branch.lock();
        let mut placed = Vec::with_capacity(prepared.len());
        let mut created = HashSet::new();

        for prepared in prepared {
            let (node, is_new) = self.place_branch(branch, &mut children, prepared);
            if is_new {
                created.insert(node.id);
            }
            placed.push(node);
        }

        if cfg!(debug_assertions) {
            assert_unique_identities(self, &children);
        }

        let positions = placed
            .iter()
            .filter_map(|node| children.iter().position(|child| Arc::ptr_eq(child, node)))
            .collect();

        let (indices, nodes) = positions_of(&children, &created);
        self.publish(branch, ChangeKind::Inserted, indices, nodes);

        Ok(positions)
    }

    /// Removes the leaf child with the same logical path as `leaf`. Never
    /// loads the branch: an unloaded branch has nothing to remove.
    pub fn remove_leaf(&self, leaf: &LeafHandle) -> Option<usize> {
        let NodeKind::Branch(branch) = &self.kind else {
            return None;
        };
        let logical_path = branch.context.store.logical_path(leaf);
        self.remove_where(branch, |child| {
            child.leaf_logical_path() == Some(logical_path.as_str())
        })
    }

    pub fn remove_leaf_path(&self, logical_path: &str) -> Option<usize> {
        let NodeKind::Branch(branch) = &self.kind else {
            return None;
        };
        self.remove_where(branch, |child| child.leaf_logical_path() == Some(logical_path))
    }

    /// Removes `child` by reference. Surviving siblings keep their order.
    pub fn remove_child(&self, child: &MirrorNode) -> Option<usize> {
        let NodeKind::Branch(branch) = &self.kind else {
            return None;
        };
        self.remove_where(branch, |candidate| candidate.id == child.id)
    }

    fn remove_where<P>(&self, branch: &BranchNode, predicate: P) -> Option<usize>
    where
        P: Fn(&MirrorNode) -> bool,
    {
        let mut children = branch.lock();
        let index = children.iter().position(|child| predicate(child.as_ref()))?;
        let removed = children.remove(index);

        self.publish(branch, ChangeKind::Removed, vec![index], vec![removed.id]);
        Some(index)
    }

    /// Swaps the child branch called `name` for a fresh, unloaded branch
    /// wrapping `handle`. The old subtree is discarded as a whole.
    pub fn replace_subtree(&self, name: &str, handle: BranchHandle) -> Option<Arc<MirrorNode>> {
        let NodeKind::Branch(branch) = &self.kind else {
            return None;
        };
        let prepared = PreparedBranch::new(branch.context.store.as_ref(), handle);

        let mut children = branch.lock();
        let index = children
            .iter()
            .position(|child| child.is_branch() && child.display_name == name)?;

        let fresh = MirrorNode::new_branch(branch.this.clone(), prepared, branch.context.clone());
        children[index] = Arc::clone(&fresh);

        self.publish(
            branch,
            ChangeKind::StructureInvalidated,
            vec![index],
            vec![fresh.id],
        );

        Some(fresh)
    }

    /// Re-reads the child branch list and merges in anything new.
    pub(crate) fn resync_branches(&self) -> Result<(), MirrorError> {
        let branch = self.branch()?;
        let handles = branch
            .context
            .store
            .child_branches(&branch.handle)
            .map_err(|source| MirrorError::Backing {
                branch: branch.handle.logical_path(),
                source,
            })?;

        self.insert_branches(handles).map(|_| ())
    }

    /// Brings a loaded branch in line with the store: drops children the
    /// store no longer reports, adds new ones, and refreshes leaves whose
    /// outcome changed. Unloaded branches are left alone.
    ///
    /// The store is read without the child lock held. If a producer mutates
    /// the branch meanwhile, the snapshot may predate that mutation and is
    /// read again rather than applied.
    ///
    /// Returns whether anything changed.
    pub(crate) fn reconcile(&self) -> Result<bool, MirrorError> {
        let branch = self.branch()?;
        if branch.state() != MaterializationState::Materialized {
            return Ok(false);
        }

        let mut attempt = 0;
        let (mut children, branches, leaves) = loop {
            let seen = branch.revision.load(Ordering::Acquire);
            let (branches, leaves) = self.fetch_snapshot()?;

            let children = branch.lock();
            if branch.revision.load(Ordering::Acquire) == seen {
                break (children, branches, leaves);
            }
            drop(children);

            attempt += 1;
            if attempt == RECONCILE_ATTEMPTS {
                log::debug!(
                    "'/{}' kept changing during refresh; leaving it for the next one",
                    self.path().join("/")
                );
                return Ok(false);
            }
        };

        let mut removed_indices = Vec::new();
        let mut removed_nodes = Vec::new();
        let mut original_index = 0;

        children.retain(|child| {
            let keep = match &child.kind {
                NodeKind::Branch(existing) => branches
                    .iter()
                    .any(|prepared| prepared.handle.same_identity(&existing.handle)),
                NodeKind::Leaf(existing) => leaves
                    .iter()
                    .any(|prepared| prepared.logical_path == existing.logical_path),
            };

            if !keep {
                removed_indices.push(original_index);
                removed_nodes.push(child.id);
            }
            original_index += 1;

            keep
        });

        let any_removed = !removed_indices.is_empty();
        self.publish(
            branch,
            ChangeKind::Removed,
            removed_indices,
            removed_nodes,
        );

        let mut created = HashSet::new();
        let mut changed = HashSet::new();

        for prepared in branches {
            let (node, is_new) = self.place_branch(branch, &mut children, prepared);
            if is_new {
                created.insert(node.id);
            }
        }

        for prepared in leaves {
            let unchanged = children
                .iter()
                .find(|child| child.leaf_logical_path() == Some(prepared.logical_path.as_str()))
                .and_then(|child| child.leaf_handle())
                .is_some_and(|existing| {
                    existing.same_instance(&prepared.handle)
                        || existing.outcome() == prepared.handle.outcome()
                });

            if unchanged {
                continue;
            }

            let (kind, _, node) = self.place_leaf(branch, &mut children, prepared);
            match kind {
                ChangeKind::Inserted => created.insert(node.id),
                _ => changed.insert(node.id),
            };
        }

        let any_added = !created.is_empty() || !changed.is_empty();

        let (indices, nodes) = positions_of(&children, &created);
        self.publish(branch, ChangeKind::Inserted, indices, nodes);

        let (indices, nodes) = positions_of(&children, &changed);
        self.publish(branch, ChangeKind::Changed, indices, nodes);

        Ok(any_removed || any_added)
    }

    /// Totals for the loaded part of this subtree. Never triggers or waits
    /// for a load.
    pub fn stats(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();

        match &self.kind {
            NodeKind::Leaf(leaf) => {
                counts.add(leaf.handle().status());
                return counts;
            }
            NodeKind::Branch(branch) if branch.state() != MaterializationState::Materialized => {
                counts.unloaded_branches += 1;
                return counts;
            }
            NodeKind::Branch(_) => {}
        }

        let mut pending = self.loaded_children();

        while let Some(node) = pending.pop() {
            match &node.kind {
                NodeKind::Leaf(leaf) => counts.add(leaf.handle().status()),
                NodeKind::Branch(branch) => {
                    if branch.state() == MaterializationState::Materialized {
                        pending.extend(node.loaded_children());
                    } else {
                        counts.unloaded_branches += 1;
                    }
                }
            }
        }

        counts
    }

    fn place_branch(
        &self,
        branch: &BranchNode,
        children: &mut Vec<Arc<MirrorNode>>,
        prepared: PreparedBranch,
    ) -> (Arc<MirrorNode>, bool) {
        if let Some(existing) = children
            .iter()
            .find(|child| child.wraps_branch(&prepared.handle))
        {
            return (Arc::clone(existing), false);
        }

        let node = MirrorNode::new_branch(branch.this.clone(), prepared, branch.context.clone());

        let placement = insert_sorted(
            children,
            Arc::clone(&node),
            branch.context.comparator.as_ref(),
            display_name_of,
        );
        if let Placement::Replaced { previous, .. } = placement {
            self.warn_collision(&previous);
        }

        (node, true)
    }

    fn place_leaf(
        &self,
        branch: &BranchNode,
        children: &mut Vec<Arc<MirrorNode>>,
        prepared: PreparedLeaf,
    ) -> (ChangeKind, usize, Arc<MirrorNode>) {
        let existing = children
            .iter()
            .position(|child| child.leaf_logical_path() == Some(prepared.logical_path.as_str()));

        if let Some(index) = existing {
            let node = Arc::clone(&children[index]);
            if let NodeKind::Leaf(leaf) = &node.kind {
                *leaf.handle.write().unwrap() = prepared.handle;
            }
            return (ChangeKind::Changed, index, node);
        }

        let node = MirrorNode::new_leaf(branch.this.clone(), prepared);

        match insert_sorted(
            children,
            Arc::clone(&node),
            branch.context.comparator.as_ref(),
            display_name_of,
        ) {
            Placement::Inserted(index) => (ChangeKind::Inserted, index, node),
            Placement::Replaced { index, previous } => {
                self.warn_collision(&previous);
                (ChangeKind::Changed, index, node)
            }
        }
    }

    fn warn_collision(&self, previous: &MirrorNode) {
        log::warn!(
            "Display name collision under '/{}': '{}' replaced an entry with a different identity",
            self.path().join("/"),
            previous.display_name
        );
    }

    fn publish(
        &self,
        branch: &BranchNode,
        kind: ChangeKind,
        indices: Vec<usize>,
        nodes: Vec<NodeId>,
    ) {
        if indices.is_empty() {
            return;
        }

        branch.revision.fetch_add(1, Ordering::AcqRel);
        branch.context.notifier.publish(ChangeRecord {
            kind,
            path: self.id_path(),
            names: self.path(),
            indices,
            nodes,
        });
    }
}

impl fmt::Debug for MirrorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            NodeKind::Branch(branch) => format!("branch, {:?}", branch.state()),
            NodeKind::Leaf(leaf) => format!("leaf, {}", leaf.handle().status()),
        };
        write!(f, "MirrorNode({} {:?}: {})", self.id, self.display_name, kind)
    }
}

/// Indices and ids of the children whose ids are in `wanted`, ascending.
fn positions_of(
    children: &[Arc<MirrorNode>],
    wanted: &HashSet<NodeId>,
) -> (Vec<usize>, Vec<NodeId>) {
    if wanted.is_empty() {
        return (Vec::new(), Vec::new());
    }

    children
        .iter()
        .enumerate()
        .filter(|(_, child)| wanted.contains(&child.id))
        .map(|(index, child)| (index, child.id))
        .unzip()
}

/// Two children wrapping one backing branch means a producer bypassed the
/// identity check; the tree can no longer be trusted.
fn assert_unique_identities(owner: &MirrorNode, children: &[Arc<MirrorNode>]) {
    let handles: Vec<_> = children
        .iter()
        .filter_map(|child| child.branch_handle())
        .collect();

    for (index, handle) in handles.iter().enumerate() {
        if handles[index + 1..]
            .iter()
            .any(|other| other.same_identity(handle))
        {
            panic!(
                "duplicate backing identity {:?} under '/{}'",
                handle,
                owner.path().join("/")
            );
        }
    }
}
