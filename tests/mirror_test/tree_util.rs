use std::{collections::HashSet, sync::Arc};

use libtestmirror::{
    BackingStore, ChangeNotifier, Comparator, FsStore, MirrorNode, MirrorTree,
};

use super::results_dir::{ResultDir, SUFFIX};

pub fn fs_tree(dir: &ResultDir) -> MirrorTree {
    let store = FsStore::new(dir.path(), SUFFIX).unwrap();

    MirrorTree::new(
        Arc::new(store) as Arc<dyn BackingStore>,
        Some(Comparator::lexical()),
        Arc::new(ChangeNotifier::new()),
    )
}

/// Display names of the loaded children of `node`.
pub fn loaded_names(node: &MirrorNode) -> Vec<String> {
    node.loaded_children()
        .iter()
        .map(|child| child.display_name().to_owned())
        .collect()
}

/// Checks ordering, uniqueness and parent links for every loaded branch
/// under `node`. Returns the number of leaves seen.
pub fn assert_well_formed(node: &Arc<MirrorNode>) -> usize {
    if node.is_leaf() {
        return 1;
    }

    let children = node.loaded_children();
    let names = loaded_names(node);

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted, "children of '/{}' out of order", node.path().join("/"));

    let unique: HashSet<_> = names.iter().collect();
    assert_eq!(
        unique.len(),
        names.len(),
        "duplicate children under '/{}'",
        node.path().join("/")
    );

    children
        .iter()
        .map(|child| {
            let parent = child.parent().expect("child without a parent");
            assert!(Arc::ptr_eq(&parent, node));
            assert_well_formed(child)
        })
        .sum()
}
