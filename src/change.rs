//! Structural change records and their delivery.

use std::{fmt, sync::Mutex};

use crossbeam_channel::{Receiver, Sender};
use futures::channel::oneshot;
use serde::Serialize;

use crate::{message_queue::MessageQueue, mirror::NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Inserted,
    Removed,
    Changed,

    /// Everything below the affected children must be treated as new; cached
    /// positions under them are invalid.
    StructureInvalidated,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Inserted => "inserted",
            ChangeKind::Removed => "removed",
            ChangeKind::Changed => "changed",
            ChangeKind::StructureInvalidated => "structure-invalidated",
        }
    }
}

/// One mutation of one branch, shaped for a tree-view widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub kind: ChangeKind,

    /// Node ids from the root down to and including the mutated branch.
    pub path: Vec<NodeId>,

    /// Display names of the same path, exclusive of the root.
    pub names: Vec<String>,

    /// Child indices affected, ascending. For removals these are the
    /// positions the children had before they were removed.
    pub indices: Vec<usize>,

    /// Ids of the affected children, parallel to `indices`.
    pub nodes: Vec<NodeId>,
}

impl ChangeRecord {
    /// The branch this record is about.
    pub fn branch(&self) -> Option<NodeId> {
        self.path.last().copied()
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} /{} {:?}",
            self.kind.as_str(),
            self.names.join("/"),
            self.indices
        )
    }
}

/// How many records a notifier keeps for cursor-based subscribers.
pub const DEFAULT_HISTORY_LIMIT: usize = 4096;

/// Publishes change records to subscribers.
///
/// Callers publish while holding the lock of the branch they mutated, so
/// records about a single branch come out in the order its mutations
/// completed. Nothing here ever touches a mirror node.
///
/// History is bounded: a cursor subscriber that falls more than the limit
/// behind receives only the retained tail. Channel subscribers see every
/// record.
pub struct ChangeNotifier {
    queue: MessageQueue<ChangeRecord>,
    channels: Mutex<Vec<Sender<ChangeRecord>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            queue: MessageQueue::with_retention(limit),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, record: ChangeRecord) {
        log::trace!("Change: {}", record);

        let mut channels = self.channels.lock().unwrap();
        channels.retain(|sender| sender.send(record.clone()).is_ok());

        self.queue.push_messages(&[record]);
    }

    /// Cursor of the next record to be published.
    pub fn cursor(&self) -> u32 {
        self.queue.cursor()
    }

    /// Resolves with every record after `cursor`, waiting for the next
    /// publication if there are none yet.
    pub fn subscribe(&self, cursor: u32) -> oneshot::Receiver<(u32, Vec<ChangeRecord>)> {
        self.queue.subscribe(cursor)
    }

    pub fn records_since(&self, cursor: u32) -> (u32, Vec<ChangeRecord>) {
        self.queue.messages_since(cursor)
    }

    /// A channel receiving every record published from now on. The channel
    /// is dropped from the notifier once its receiver goes away.
    pub fn subscribe_channel(&self) -> Receiver<ChangeRecord> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.channels.lock().unwrap().push(sender);
        receiver
    }

    /// Forgets history that every subscriber has already consumed.
    pub fn discard_before(&self, cursor: u32) {
        self.queue.discard_before(cursor);
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
