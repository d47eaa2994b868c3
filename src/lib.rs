//! A live, lazily loaded mirror of a test-result tree that keeps changing
//! underneath it.

pub mod backing;
pub mod change;
mod change_processor;
pub mod cli;
pub mod config;
pub mod filter;
pub mod logging;
mod message_queue;
pub mod mirror;
pub mod session;
pub mod view;

pub use backing::{
    BackingStore, BackingStoreFault, BranchHandle, FsStore, LeafHandle, MemoryStore, StoreEvent,
    TestOutcome, TestStatus,
};
pub use change::{ChangeKind, ChangeNotifier, ChangeRecord};
pub use config::{MirrorConfig, SortOrder};
pub use filter::{ActiveFilterQuery, FilterFault, PredicateFilter, StatusFilter};
pub use mirror::{
    Comparator, LeafChange, MaterializationState, MirrorError, MirrorNode, MirrorTree, NodeId,
    Routed,
};
pub use session::{MirrorSession, Selection, SessionError, SessionOptions, SharedMirror};
