use pretty_assertions::assert_eq;

use super::*;
use crate::{
    backing::LeafHandle,
    mirror::{LeafChange, MirrorError},
};

#[test]
fn leaves_are_kept_in_order() {
    let store = Arc::new(MemoryStore::new("results"));
    let unit = store.ensure_path("unit");

    let tree = sorted_tree(&store);
    let branch = tree.find_node_by_path(&["unit"]).unwrap().unwrap();
    assert_eq!(branch.branch_handle().map(|h| h.same_identity(&unit)), Some(true));

    for name in ["b", "a", "c"] {
        let leaf = store.record(passed(&format!("unit/{}", name)));
        branch.insert_or_update_leaf(leaf).unwrap();
    }

    assert_eq!(names(&branch), vec!["a", "b", "c"]);
}

#[test]
fn updating_a_leaf_keeps_its_position() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("unit/a"));
    store.record(passed("unit/b"));

    let tree = sorted_tree(&store);
    let branch = tree.find_node_by_path(&["unit"]).unwrap().unwrap();
    let before = branch.child_at(1).unwrap();
    let cursor = tree.notifier().cursor();

    let newer = store.record(failed("unit/b"));
    assert_eq!(
        branch.insert_or_update_leaf(newer.clone()).unwrap(),
        LeafChange::Updated(1)
    );

    let after = branch.child_at(1).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.leaf_handle().unwrap().same_instance(&newer));
    assert_eq!(after.status(), Some(TestStatus::Failed));
    assert_eq!(branch.child_count().unwrap(), 2);

    let (_, new_records) = tree.notifier().records_since(cursor);
    assert_eq!(kinds(&new_records), vec![ChangeKind::Changed]);
    assert_eq!(new_records[0].indices, vec![1]);
    assert_eq!(new_records[0].nodes, vec![after.id()]);
}

#[test]
fn repeated_updates_are_idempotent() {
    let store = Arc::new(MemoryStore::new("results"));
    let leaf = store.record(passed("unit/a"));

    let tree = sorted_tree(&store);
    let branch = tree.find_node_by_path(&["unit"]).unwrap().unwrap();

    for _ in 0..3 {
        assert_eq!(
            branch.insert_or_update_leaf(leaf.clone()).unwrap(),
            LeafChange::Updated(0)
        );
    }

    assert_eq!(branch.child_count().unwrap(), 1);
}

#[test]
fn find_by_leaf_identity_ignores_instance() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("unit/a"));

    let tree = sorted_tree(&store);
    let branch = tree.find_node_by_path(&["unit"]).unwrap().unwrap();

    let unrelated = LeafHandle::new(failed("unit/a"));
    let (index, node) = branch.find_by_leaf_identity(&unrelated).unwrap().unwrap();
    assert_eq!(index, 0);
    assert_eq!(node.display_name(), "a");

    let missing = LeafHandle::new(failed("unit/z"));
    assert!(branch.find_by_leaf_identity(&missing).unwrap().is_none());
}

#[test]
fn insert_branches_reuses_existing_children() {
    let store = Arc::new(MemoryStore::new("results"));
    let root = store.ensure_path("");
    let beta = store.add_branch(&root, "beta");

    let tree = sorted_tree(&store);
    tree.root().materialize().unwrap();
    let cursor = tree.notifier().cursor();

    let alpha = store.add_branch(&root, "alpha");
    let positions = tree
        .root()
        .insert_branches([alpha.clone(), beta.clone(), alpha.clone()])
        .unwrap();

    assert_eq!(positions, vec![0, 1, 0]);
    assert_eq!(names(tree.root()), vec!["alpha", "beta"]);

    let (_, new_records) = tree.notifier().records_since(cursor);
    assert_eq!(kinds(&new_records), vec![ChangeKind::Inserted]);
    assert_eq!(new_records[0].indices, vec![0]);

    // Nothing new: no record at all.
    tree.root().insert_branches([beta]).unwrap();
    assert_eq!(tree.notifier().records_since(cursor).1.len(), 1);
}

#[test]
fn removals_never_load() {
    let store = Arc::new(MemoryStore::new("results"));
    let leaf = store.record(passed("a"));

    let tree = sorted_tree(&store);
    assert_eq!(tree.root().remove_leaf(&leaf), None);
    assert_eq!(store.fetch_count(), 0);
    assert!(!tree.root().is_materialized());
}

#[test]
fn removal_reports_the_old_index() {
    let store = Arc::new(MemoryStore::new("results"));
    for name in ["a", "b", "c"] {
        store.record(passed(name));
    }

    let tree = sorted_tree(&store);
    let b = tree.root().child_at(1).unwrap();
    let cursor = tree.notifier().cursor();

    assert_eq!(tree.root().remove_child(&b), Some(1));
    assert_eq!(tree.root().remove_child(&b), None);
    assert_eq!(names(tree.root()), vec!["a", "c"]);

    assert_eq!(tree.root().remove_leaf_path("c"), Some(1));
    assert_eq!(names(tree.root()), vec!["a"]);

    let (_, new_records) = tree.notifier().records_since(cursor);
    assert_eq!(
        kinds(&new_records),
        vec![ChangeKind::Removed, ChangeKind::Removed]
    );
    assert_eq!(new_records[0].indices, vec![1]);
    assert_eq!(new_records[0].nodes, vec![b.id()]);
    assert_eq!(new_records[1].indices, vec![1]);
}

#[test]
fn leaves_have_no_children() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("a"));

    let tree = sorted_tree(&store);
    let leaf = tree.root().child_at(0).unwrap();

    assert_eq!(leaf.child_count().unwrap(), 0);
    assert!(leaf.children().unwrap().is_empty());
    assert!(matches!(leaf.child_at(0), Err(MirrorError::NotABranch { .. })));
    assert!(matches!(
        tree.root().child_at(5),
        Err(MirrorError::IndexOutOfRange { index: 5, count: 1, .. })
    ));
}

#[test]
fn paths_round_trip() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("unit/parser/tokens"));
    store.record(passed("unit/lexer"));

    let tree = sorted_tree(&store);
    tree.materialize_all(None);

    let mut pending = vec![Arc::clone(tree.root())];
    while let Some(node) = pending.pop() {
        let found = tree.find_node_by_path(node.path().as_slice()).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &node));
        assert_eq!(node.id_path().last(), Some(&node.id()));
        pending.extend(node.loaded_children());
    }

    let tokens = tree
        .find_node_by_path(&["unit", "parser", "tokens"])
        .unwrap()
        .unwrap();
    assert_eq!(tokens.path(), vec!["unit", "parser", "tokens"]);
    assert_eq!(tokens.backing_path(tree.store().as_ref()), tokens.path());
    assert_eq!(tokens.leaf_logical_path(), Some("unit/parser/tokens"));
}

#[test]
fn name_collisions_replace_in_place() {
    let store = Arc::new(MemoryStore::new("results"));
    let root = store.ensure_path("");
    store.add_branch(&root, "alpha");
    let apex = store.add_branch(&root, "apex");

    let by_initial = Comparator::custom("initial", |a: &str, b: &str| {
        a.chars().next().cmp(&b.chars().next())
    });
    let tree = MirrorTree::new(
        Arc::clone(&store) as Arc<dyn BackingStore>,
        Some(by_initial),
        Arc::new(ChangeNotifier::new()),
    );

    assert_eq!(names(tree.root()), vec!["apex"]);
    let survivor = tree.root().child_at(0).unwrap();
    assert_eq!(survivor.branch_handle().map(|h| h.same_identity(&apex)), Some(true));
}

#[test]
fn unsorted_trees_put_newest_first() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("first"));

    let tree = MirrorTree::new(
        Arc::clone(&store) as Arc<dyn BackingStore>,
        None,
        Arc::new(ChangeNotifier::new()),
    );
    tree.root().materialize().unwrap();

    let second = store.record(passed("second"));
    assert_eq!(
        tree.root().insert_or_update_leaf(second).unwrap(),
        LeafChange::Inserted(0)
    );
    assert_eq!(names(tree.root()), vec!["second", "first"]);
}

#[test]
fn filters_only_affect_display() {
    use crate::filter::StatusFilter;

    let store = Arc::new(MemoryStore::new("results"));
    store.record(passed("a"));
    store.record(failed("b"));

    let tree = sorted_tree(&store);
    let filter = StatusFilter::new([TestStatus::Failed]);

    let children = tree.root().children().unwrap();
    let accepted: Vec<_> = children
        .iter()
        .map(|child| child.is_accepted(Some(&filter)))
        .collect();

    assert_eq!(accepted, vec![false, true]);
    assert_eq!(children.len(), 2);
    assert!(tree.root().is_accepted(Some(&filter)));
}
