use std::time::Duration;

use pretty_assertions::assert_eq;

use libtestmirror::{ChangeKind, MirrorConfig, MirrorSession, SessionError, TestStatus};

use crate::mirror_test::{
    results_dir::{eventually, ResultDir},
    tree_util::{assert_well_formed, loaded_names},
};

fn open(dir: &ResultDir) -> MirrorSession {
    let config = MirrorConfig {
        poll_interval_ms: 50,
        ..Default::default()
    };

    let session = MirrorSession::open(dir.path(), &config).unwrap();
    assert!(session.tree().materialize_all(None).is_empty());
    session
}

fn unit_names(session: &MirrorSession) -> Vec<String> {
    match session.tree().find_node_by_path(&["unit"]) {
        Ok(Some(unit)) => loaded_names(&unit),
        _ => Vec::new(),
    }
}

#[test]
fn follows_new_and_removed_results() {
    let dir = ResultDir::new();
    dir.write_result("unit/lexer", "passed");

    let session = open(&dir);
    assert_eq!(unit_names(&session), ["lexer"]);

    dir.write_result("unit/formatter", "failed");
    assert!(eventually(|| unit_names(&session) == ["formatter", "lexer"]));

    dir.remove_result("unit/lexer");
    assert!(eventually(|| unit_names(&session) == ["formatter"]));

    assert_eq!(session.generation(), 0);
    assert_well_formed(session.tree().root());
}

#[test]
fn follows_status_changes() {
    let dir = ResultDir::new();
    dir.write_result("unit/lexer", "running");

    let session = open(&dir);
    let status = || {
        session
            .tree()
            .find_node_by_path(&["unit", "lexer"])
            .ok()
            .flatten()
            .and_then(|lexer| lexer.status())
    };
    assert_eq!(status(), Some(TestStatus::Running));

    dir.write_result("unit/lexer", "passed");
    assert!(eventually(|| status() == Some(TestStatus::Passed)));
}

#[test]
fn new_directories_appear_unloaded() {
    let dir = ResultDir::new();
    dir.write_result("unit/lexer", "passed");

    let session = open(&dir);

    dir.write_result("e2e/login", "passed");
    assert!(eventually(|| loaded_names(session.tree().root()) == ["e2e", "unit"]));

    let e2e = session.tree().find_node_by_path(&["e2e"]).unwrap().unwrap();
    assert!(eventually(|| {
        e2e.children()
            .map(|children| children.len() == 1)
            .unwrap_or(false)
    }));
}

#[test]
fn streams_records_for_changes() {
    let dir = ResultDir::new();
    dir.write_result("unit/lexer", "passed");

    let session = open(&dir);
    let records = session.notifier().subscribe_channel();

    dir.write_result("unit/formatter", "passed");

    let inserted = std::iter::from_fn(|| records.recv_timeout(Duration::from_secs(5)).ok())
        .find(|record| record.kind == ChangeKind::Inserted)
        .expect("no insertion was published");

    assert_eq!(inserted.names, ["unit"]);
    assert_eq!(inserted.indices, [0]);
}

#[test]
fn filter_comes_from_config() {
    let dir = ResultDir::new();
    dir.write_result("unit/lexer", "passed");
    dir.write_result("unit/parser", "failed");

    let config = MirrorConfig {
        poll_interval_ms: 0,
        filter: Some(vec![TestStatus::Failed]),
        ..Default::default()
    };
    let session = MirrorSession::open(dir.path(), &config).unwrap();
    let filter = session.filter().unwrap();

    let unit = session.tree().find_node_by_path(&["unit"]).unwrap().unwrap();
    let accepted: Vec<_> = unit
        .children()
        .unwrap()
        .iter()
        .map(|child| child.is_accepted(Some(filter.as_ref())))
        .collect();
    assert_eq!(accepted, [false, true]);

    session.set_filter(None);
    assert!(session.filter().is_none());
}

#[test]
fn opening_a_missing_directory_fails() {
    let dir = ResultDir::new();
    let missing = dir.path().join("nowhere");

    match MirrorSession::open(&missing, &MirrorConfig::default()) {
        Err(SessionError::Store { .. }) => {}
        Ok(_) => panic!("opened a directory that doesn't exist"),
    }
}
