use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
    time::Duration,
};

use pretty_assertions::assert_eq;
use rand::{seq::SliceRandom, thread_rng, Rng};

use libtestmirror::{
    BackingStore, ChangeNotifier, Comparator, MemoryStore, MirrorTree, Routed, TestOutcome,
    TestStatus,
};

use crate::mirror_test::tree_util::{assert_well_formed, loaded_names};

const BRANCHES: usize = 6;
const PRODUCERS: usize = 4;
const READERS: usize = 4;
const PER_PRODUCER: usize = 150;

fn tree_over(store: &Arc<MemoryStore>) -> Arc<MirrorTree> {
    Arc::new(MirrorTree::new(
        Arc::clone(store) as Arc<dyn BackingStore>,
        Some(Comparator::lexical()),
        Arc::new(ChangeNotifier::new()),
    ))
}

/// Producers record outcomes in random order while readers load and walk
/// the tree. Once everyone is done, every loaded branch must hold exactly
/// what the store holds, in order and without duplicates.
#[test]
fn producers_and_readers_agree() {
    let store = Arc::new(MemoryStore::new("results"));
    for branch in 0..BRANCHES {
        store.ensure_path(&format!("suite{}", branch));
    }
    store.set_fetch_delay(Some(Duration::from_millis(2)));

    let tree = tree_over(&store);
    let barrier = Arc::new(Barrier::new(PRODUCERS + READERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let store = Arc::clone(&store);
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                let mut rng = thread_rng();
                let mut order: Vec<usize> = (0..PER_PRODUCER).collect();
                order.shuffle(&mut rng);
                barrier.wait();

                for test in order {
                    let branch = rng.gen_range(0..BRANCHES);
                    let outcome = TestOutcome::new(
                        format!("suite{}/p{}_t{:03}", branch, producer, test),
                        TestStatus::Passed,
                    );
                    let leaf = store.record(outcome);

                    let routed = tree.on_leaf_discovered(leaf).unwrap();
                    assert!(matches!(routed, Routed::Applied | Routed::Absorbed));
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                let mut rng = thread_rng();
                barrier.wait();

                for _ in 0..40 {
                    let name = format!("suite{}", rng.gen_range(0..BRANCHES));
                    let branch = tree.find_node_by_path(&[name]).unwrap().unwrap();
                    let count = branch.child_count().unwrap();
                    if count > 0 {
                        branch.child_at(rng.gen_range(0..count)).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in producers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    assert!(tree.materialize_all(None).is_empty());
    assert_eq!(assert_well_formed(tree.root()), PRODUCERS * PER_PRODUCER);

    let root = store.root();
    for branch in store.child_branches(&root).unwrap() {
        let mut expected: Vec<String> = store
            .leaf_results(&branch)
            .unwrap()
            .iter()
            .map(|leaf| leaf.outcome().name().to_owned())
            .collect();
        expected.sort();

        let node = tree.find_node_by_path(&[branch.name()]).unwrap().unwrap();
        assert_eq!(loaded_names(&node), expected);
    }
}

#[test]
fn concurrent_first_access_loads_once() {
    let store = Arc::new(MemoryStore::new("results"));
    let mut names: Vec<String> = (0..64).map(|index| format!("t{:02}", index)).collect();
    names.shuffle(&mut thread_rng());
    for name in &names {
        store.record(TestOutcome::new(format!("suite/{}", name), TestStatus::Failed));
    }
    store.set_fetch_delay(Some(Duration::from_millis(30)));

    let tree = tree_over(&store);
    let suite = tree.find_node_by_path(&["suite"]).unwrap().unwrap();
    let fetches_before = store.fetch_count();

    let barrier = Arc::new(Barrier::new(8));
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let suite = Arc::clone(&suite);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();
                suite.child_count().unwrap()
            })
        })
        .collect();

    for handle in threads {
        assert_eq!(handle.join().unwrap(), 64);
    }

    assert_eq!(store.fetch_count() - fetches_before, 1);
    assert_eq!(assert_well_formed(&suite), 64);
}

/// A comparator that parks the first comparison involving a `slow_` name
/// until released, holding that branch's lock for as long as the test
/// wants.
fn parking_comparator(
    armed: Arc<AtomicBool>,
    entered: crossbeam_channel::Sender<()>,
    release: crossbeam_channel::Receiver<()>,
) -> Comparator {
    Comparator::custom("parking", move |a, b| {
        let slow = a.starts_with("slow_") || b.starts_with("slow_");
        if slow && armed.swap(false, Ordering::SeqCst) {
            let _ = entered.send(());
            let _ = release.recv();
        }
        a.cmp(b)
    })
}

#[test]
fn a_busy_branch_does_not_block_its_neighbours() {
    let store = Arc::new(MemoryStore::new("results"));
    store.record(TestOutcome::new("a/slow_0", TestStatus::Passed));
    store.record(TestOutcome::new("b/fast_0", TestStatus::Passed));

    let armed = Arc::new(AtomicBool::new(false));
    let (entered_sender, entered) = crossbeam_channel::unbounded();
    let (release, release_receiver) = crossbeam_channel::unbounded();

    let tree = Arc::new(MirrorTree::new(
        Arc::clone(&store) as Arc<dyn BackingStore>,
        Some(parking_comparator(
            Arc::clone(&armed),
            entered_sender,
            release_receiver,
        )),
        Arc::new(ChangeNotifier::new()),
    ));
    assert!(tree.materialize_all(None).is_empty());

    armed.store(true, Ordering::SeqCst);
    let busy = {
        let tree = Arc::clone(&tree);
        let leaf = store.record(TestOutcome::new("a/slow_1", TestStatus::Failed));
        thread::spawn(move || tree.on_leaf_discovered(leaf).unwrap())
    };
    entered
        .recv_timeout(Duration::from_secs(5))
        .expect("the insertion under 'a' never reached the comparator");

    // 'a' is locked mid-insertion from here until released.
    let (done_sender, done) = crossbeam_channel::bounded(1);
    let neighbour = {
        let tree = Arc::clone(&tree);
        let leaf = store.record(TestOutcome::new("b/fast_1", TestStatus::Failed));
        thread::spawn(move || {
            let routed = tree.on_leaf_discovered(leaf).unwrap();
            let _ = done_sender.send(routed);
        })
    };

    let routed = done.recv_timeout(Duration::from_secs(5));
    let finished_while_busy = !busy.is_finished();

    release.send(()).unwrap();
    assert_eq!(busy.join().unwrap(), Routed::Applied);
    neighbour.join().unwrap();

    assert_eq!(routed, Ok(Routed::Applied));
    assert!(finished_while_busy);

    let b = tree.find_node_by_path(&["b"]).unwrap().unwrap();
    assert_eq!(loaded_names(&b), ["fast_0", "fast_1"]);
    let a = tree.find_node_by_path(&["a"]).unwrap().unwrap();
    assert_eq!(loaded_names(&a), ["slow_0", "slow_1"]);
}
