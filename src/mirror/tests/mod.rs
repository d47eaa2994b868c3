mod mutation;

use std::sync::Arc;

use crate::{
    backing::{BackingStore, MemoryStore, TestOutcome, TestStatus},
    change::{ChangeKind, ChangeNotifier, ChangeRecord},
};

use super::{Comparator, MirrorNode, MirrorTree};

fn sorted_tree(store: &Arc<MemoryStore>) -> MirrorTree {
    let store: Arc<dyn BackingStore> = Arc::clone(store) as Arc<dyn BackingStore>;
    MirrorTree::new(store, Some(Comparator::lexical()), Arc::new(ChangeNotifier::new()))
}

fn passed(path: &str) -> TestOutcome {
    TestOutcome::new(path, TestStatus::Passed)
}

fn failed(path: &str) -> TestOutcome {
    TestOutcome::new(path, TestStatus::Failed)
}

/// Display names of `node`'s children, loading them if needed.
fn names(node: &MirrorNode) -> Vec<String> {
    node.children()
        .unwrap()
        .iter()
        .map(|child| child.display_name().to_owned())
        .collect()
}

fn records(tree: &MirrorTree) -> Vec<ChangeRecord> {
    tree.notifier().records_since(0).1
}

fn kinds(records: &[ChangeRecord]) -> Vec<ChangeKind> {
    records.iter().map(|record| record.kind).collect()
}
