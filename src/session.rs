use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use thiserror::Error;

use crate::{
    backing::{BackingStore, BranchHandle, FsStore, FsStoreError, LeafHandle, StoreEvent},
    change::{ChangeKind, ChangeNotifier, ChangeRecord},
    change_processor::{ChangeProcessor, FsFeed},
    config::MirrorConfig,
    filter::{ActiveFilterQuery, StatusFilter},
    mirror::{Comparator, MirrorError, MirrorNode, MirrorTree, NodeId, Routed},
};

/// How a session builds and maintains its tree.
#[derive(Clone, Default)]
pub struct SessionOptions {
    pub comparator: Option<Comparator>,

    /// `None` disables background polling.
    pub poll_interval: Option<Duration>,

    pub filter: Option<Arc<dyn ActiveFilterQuery>>,
}

impl SessionOptions {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            comparator: config.sort.comparator(),
            poll_interval: config.poll_interval(),
            filter: config
                .filter
                .as_ref()
                .map(|statuses| {
                    Arc::new(StatusFilter::new(statuses.iter().copied()))
                        as Arc<dyn ActiveFilterQuery>
                }),
        }
    }
}

/// The part of a session shared with its change processor.
///
/// The tree sits behind a coarse lock that is only ever held long enough to
/// clone or replace the `Arc`; all real synchronization happens per branch.
pub struct SharedMirror {
    tree: RwLock<Arc<MirrorTree>>,

    /// Bumped every time the tree is replaced. Selections from an older
    /// generation no longer resolve.
    generation: AtomicU64,

    notifier: Arc<ChangeNotifier>,
    comparator: Option<Comparator>,
}

impl SharedMirror {
    fn new(store: Arc<dyn BackingStore>, comparator: Option<Comparator>) -> Self {
        let notifier = Arc::new(ChangeNotifier::new());
        let tree = MirrorTree::new(store, comparator.clone(), Arc::clone(&notifier));

        Self {
            tree: RwLock::new(Arc::new(tree)),
            generation: AtomicU64::new(0),
            notifier,
            comparator,
        }
    }

    pub fn tree(&self) -> Arc<MirrorTree> {
        Arc::clone(&self.tree.read().unwrap())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    /// Replaces the whole tree with an unloaded one over `store`, or over the
    /// current store when `None`.
    fn rebuild(&self, store: Option<Arc<dyn BackingStore>>) -> Arc<MirrorTree> {
        let mut tree = self.tree.write().unwrap();

        let store = store.unwrap_or_else(|| Arc::clone(tree.store()));
        let fresh = Arc::new(MirrorTree::new(
            store,
            self.comparator.clone(),
            Arc::clone(&self.notifier),
        ));

        *tree = Arc::clone(&fresh);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Published under the tree lock so no record from the new tree can
        // precede it.
        self.notifier.publish(ChangeRecord {
            kind: ChangeKind::StructureInvalidated,
            path: Vec::new(),
            names: Vec::new(),
            indices: vec![0],
            nodes: vec![fresh.root().id()],
        });

        log::info!("Rebuilt mirror (generation {})", generation);
        fresh
    }

    pub fn apply(&self, event: StoreEvent) -> Result<Routed, MirrorError> {
        let routed = self.tree().apply(event)?;

        if routed == Routed::RebuildRequired {
            self.rebuild(None);
        }

        Ok(routed)
    }

    pub fn refresh(&self) -> usize {
        self.tree().refresh()
    }
}

/// A generation-checked reference to a node, for consumers that hold on to
/// nodes across updates (a selection, a scroll anchor).
#[derive(Debug, Clone)]
pub struct Selection {
    generation: u64,
    id: NodeId,
    node: Weak<MirrorNode>,
}

impl Selection {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Owns a live mirror: the tree, its notifier, and optionally a change
/// processor feeding it.
pub struct MirrorSession {
    /// Dropped first, so its thread is shut down while every channel it
    /// reads from is still open.
    #[allow(unused)]
    change_processor: Option<ChangeProcessor>,

    start_time: Instant,

    shared: Arc<SharedMirror>,

    filter: RwLock<Option<Arc<dyn ActiveFilterQuery>>>,

    /// `None` for sessions without a change processor.
    event_sender: Option<Sender<StoreEvent>>,
}

impl MirrorSession {
    /// Starts a session with a change processor over `store`.
    pub fn new(store: Arc<dyn BackingStore>, options: SessionOptions) -> Self {
        Self::start(store, options, None)
    }

    /// Starts a session over a results directory, watching it for changes.
    pub fn open(dir: &Path, config: &MirrorConfig) -> Result<Self, SessionError> {
        let store = Arc::new(FsStore::new(dir, config.result_suffix.clone())?);
        let receiver = store.watch()?;

        log::trace!("Watching {}", store.root_dir().display());

        let feed = FsFeed {
            receiver,
            store: Arc::clone(&store),
        };

        Ok(Self::start(
            store,
            SessionOptions::from_config(config),
            Some(feed),
        ))
    }

    /// A session without a change processor. Producers call the trigger
    /// methods directly.
    pub fn new_oneshot(store: Arc<dyn BackingStore>, options: SessionOptions) -> Self {
        Self {
            change_processor: None,
            start_time: Instant::now(),
            shared: Arc::new(SharedMirror::new(store, options.comparator)),
            filter: RwLock::new(options.filter),
            event_sender: None,
        }
    }

    fn start(
        store: Arc<dyn BackingStore>,
        options: SessionOptions,
        fs_feed: Option<FsFeed>,
    ) -> Self {
        let start_time = Instant::now();
        let shared = Arc::new(SharedMirror::new(store, options.comparator));

        let (event_sender, event_receiver) = crossbeam_channel::unbounded();

        log::trace!("Starting ChangeProcessor");
        let change_processor = ChangeProcessor::start(
            Arc::clone(&shared),
            event_receiver,
            fs_feed,
            options.poll_interval,
        );

        Self {
            change_processor: Some(change_processor),
            start_time,
            shared,
            filter: RwLock::new(options.filter),
            event_sender: Some(event_sender),
        }
    }

    pub fn tree(&self) -> Arc<MirrorTree> {
        self.shared.tree()
    }

    pub fn shared(&self) -> &Arc<SharedMirror> {
        &self.shared
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        self.shared.notifier()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Channel into the change processor, if there is one.
    pub fn event_sender(&self) -> Option<Sender<StoreEvent>> {
        self.event_sender.clone()
    }

    pub fn filter(&self) -> Option<Arc<dyn ActiveFilterQuery>> {
        self.filter.read().unwrap().clone()
    }

    /// Changes which leaves are displayed. The tree itself is untouched.
    pub fn set_filter(&self, filter: Option<Arc<dyn ActiveFilterQuery>>) {
        *self.filter.write().unwrap() = filter;
    }

    pub fn on_leaf_discovered(&self, leaf: LeafHandle) -> Result<Routed, MirrorError> {
        self.shared.apply(StoreEvent::LeafDiscovered(leaf))
    }

    pub fn on_leaf_updated(&self, leaf: LeafHandle) -> Result<Routed, MirrorError> {
        self.shared.apply(StoreEvent::LeafUpdated(leaf))
    }

    pub fn on_branch_discovered(
        &self,
        parent: BranchHandle,
        branch: BranchHandle,
    ) -> Result<Routed, MirrorError> {
        self.shared.apply(StoreEvent::BranchDiscovered { parent, branch })
    }

    pub fn on_subtree_invalidated(&self, branch: BranchHandle) -> Result<Routed, MirrorError> {
        self.shared.apply(StoreEvent::SubtreeInvalidated(branch))
    }

    /// Throws the current tree away and mirrors `store` instead.
    pub fn swap_store(&self, store: Arc<dyn BackingStore>) -> Arc<MirrorTree> {
        self.shared.rebuild(Some(store))
    }

    /// Rebuilds over the current store.
    pub fn rebuild(&self) -> Arc<MirrorTree> {
        self.shared.rebuild(None)
    }

    pub fn select(&self, node: &Arc<MirrorNode>) -> Selection {
        Selection {
            generation: self.generation(),
            id: node.id(),
            node: Arc::downgrade(node),
        }
    }

    /// The selected node, if it is still part of the current tree.
    pub fn resolve(&self, selection: &Selection) -> Option<Arc<MirrorNode>> {
        if selection.generation != self.generation() {
            return None;
        }

        let node = selection.node.upgrade()?;
        is_attached(&self.tree(), &node).then_some(node)
    }
}

/// Whether `node` is still reachable from the root of `tree`.
fn is_attached(tree: &MirrorTree, node: &Arc<MirrorNode>) -> bool {
    let mut current = Arc::clone(node);

    while let Some(parent) = current.parent() {
        let linked = parent
            .loaded_children()
            .iter()
            .any(|child| Arc::ptr_eq(child, &current));

        if !linked {
            return false;
        }
        current = parent;
    }

    Arc::ptr_eq(&current, tree.root())
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store {
        #[from]
        source: FsStoreError,
    },
}
