use insta::assert_snapshot;
use pretty_assertions::assert_eq;

use libtestmirror::{view::render_tree, ChangeKind, MirrorError, TestStatus};

use crate::mirror_test::{
    results_dir::ResultDir,
    tree_util::{assert_well_formed, fs_tree, loaded_names},
};

fn populated() -> ResultDir {
    let dir = ResultDir::new();
    dir.write_result("unit/parser/handles_eof", "passed");
    dir.write_result("unit/parser/rejects_garbage", "failed");
    dir.write_result("unit/lexer", "passed");
    dir.write_result("integration/db/migrations", "errored");
    dir.write_result("smoke", "skipped");
    dir
}

#[test]
fn mirrors_a_results_directory() {
    let dir = populated();
    dir.write_raw("unit/README.md", "not a result");
    dir.mkdir(".testmirror/logs");

    let tree = fs_tree(&dir);
    assert!(tree.materialize_all(None).is_empty());

    let unit = tree.find_node_by_path(&["unit"]).unwrap().unwrap();
    assert_snapshot!(render_tree(&unit, None, None), @r"
    unit/
      lexer [passed]
      parser/
        handles_eof [passed]
        rejects_garbage [failed]
    ");

    assert_eq!(loaded_names(tree.root()), ["integration", "smoke", "unit"]);
    assert_eq!(assert_well_formed(tree.root()), 5);

    let stats = tree.root().stats();
    assert_eq!(stats.passed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.unloaded_branches, 0);
}

#[test]
fn malformed_results_are_left_out() {
    let dir = populated();
    dir.write_raw("unit/broken.result.json", "{ not json");
    dir.write_raw("unit/unknown.result.json", r#"{ "status": "exploded" }"#);

    let tree = fs_tree(&dir);
    let unit = tree.find_node_by_path(&["unit"]).unwrap().unwrap();

    assert_eq!(loaded_names(&unit), Vec::<String>::new());
    assert_eq!(unit.child_count().unwrap(), 2);
    assert_eq!(loaded_names(&unit), ["lexer", "parser"]);
}

#[test]
fn lookups_load_only_the_path_taken() {
    let dir = populated();
    let tree = fs_tree(&dir);

    let eof = tree
        .find_node_by_path(&["unit", "parser", "handles_eof"])
        .unwrap()
        .unwrap();

    assert_eq!(eof.leaf_logical_path(), Some("unit/parser/handles_eof"));
    assert_eq!(eof.status(), Some(TestStatus::Passed));

    let integration = tree.find_node_by_path(&["integration"]);
    let integration = integration.unwrap().unwrap();
    assert!(!integration.is_materialized());
    assert_eq!(tree.root().stats().unloaded_branches, 1);
}

#[test]
fn refresh_picks_up_changes_on_disk() {
    let dir = populated();
    let tree = fs_tree(&dir);
    tree.materialize_all(None);
    let cursor = tree.notifier().cursor();

    dir.write_result("unit/lexer", "failed");
    dir.write_result("unit/formatter", "passed");
    dir.remove_result("unit/parser/rejects_garbage");
    dir.remove_dir("integration");

    assert_eq!(tree.refresh(), 3);

    assert_eq!(loaded_names(tree.root()), ["smoke", "unit"]);
    let unit = tree.find_node_by_path(&["unit"]).unwrap().unwrap();
    assert_eq!(loaded_names(&unit), ["formatter", "lexer", "parser"]);
    assert_eq!(unit.child_at(1).unwrap().status(), Some(TestStatus::Failed));

    let parser = unit.child_at(2).unwrap();
    assert_eq!(loaded_names(&parser), ["handles_eof"]);

    let (_, records) = tree.notifier().records_since(cursor);
    let kinds: Vec<_> = records.iter().map(|record| record.kind).collect();
    assert_eq!(
        kinds,
        [
            ChangeKind::Removed,
            ChangeKind::Inserted,
            ChangeKind::Changed,
            ChangeKind::Removed,
        ]
    );

    // Nothing changed since.
    assert_eq!(tree.refresh(), 0);
}

#[test]
fn deleted_directories_fault_until_refreshed() {
    let dir = populated();
    let tree = fs_tree(&dir);

    let integration = tree.find_node_by_path(&["integration"]).unwrap().unwrap();
    dir.remove_dir("integration");

    match integration.materialize() {
        Err(MirrorError::Backing { .. }) => {}
        other => panic!("expected a backing fault, got {:?}", other),
    }
    assert!(!integration.is_materialized());

    tree.refresh();
    assert_eq!(loaded_names(tree.root()), ["smoke", "unit"]);
}
