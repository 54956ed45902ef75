//! Randomized structural checks of the R-tree on both storages.

mod common;

use common::{brute_force, init_logging, random_entries, random_windows, sorted_payloads};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_cache::{
    Entry, IndexConfig, IndexStorage, Node, NodeId, NodeVisitor, PagedOptions, RTreeIndex, Region,
    SplitPolicy, VisitFlow,
};
use tempfile::tempdir;

/// Records occupancy and level violations without touching the tree.
struct ShapeChecker {
    min: usize,
    max: usize,
    problems: Vec<String>,
    entries: u64,
}

impl ShapeChecker {
    fn new(config: &IndexConfig) -> Self {
        Self {
            min: config.min_node_entries,
            max: config.max_node_entries,
            problems: Vec::new(),
            entries: 0,
        }
    }
}

impl NodeVisitor for ShapeChecker {
    fn is_data_visitor(&self) -> bool {
        true
    }

    fn visit_node(&mut self, node: &mut Node) -> VisitFlow {
        let tree = match node.as_tree() {
            Ok(tree) => tree,
            Err(e) => {
                self.problems.push(e.to_string());
                return VisitFlow::Prune;
            }
        };
        if tree.len() > self.max {
            self.problems.push(format!("node {} holds {} > {}", tree.id, tree.len(), self.max));
        }
        if tree.parent.is_some() && tree.len() < self.min {
            self.problems.push(format!("node {} holds {} < {}", tree.id, tree.len(), self.min));
        }
        if tree.is_leaf() != (tree.level == 0) {
            self.problems.push(format!("node {} is at level {}", tree.id, tree.level));
        }
        VisitFlow::Continue
    }

    fn visit_data(&mut self, _node: NodeId, _entry: &Entry) {
        self.entries += 1;
    }
}

fn assert_consistent<S: IndexStorage>(index: &mut RTreeIndex<S>, live: &[(Region, u64)]) {
    assert_eq!(index.len(), live.len() as u64);
    assert_eq!(
        index.bounds().unwrap(),
        Region::combine_all(live.iter().map(|(b, _)| b))
    );

    let mut checker = ShapeChecker::new(index.config());
    index.visit(&mut checker).unwrap();
    assert!(checker.problems.is_empty(), "{:?}", checker.problems);
    assert_eq!(checker.entries, live.len() as u64);

    let stats = index.stats();
    assert_eq!(stats.live_nodes + stats.free_pages, stats.high_water_mark);
}

/// Random inserts and deletes, checking the structure every few steps.
fn churn<S: IndexStorage>(index: &mut RTreeIndex<S>, seed: u64) -> Vec<(Region, u64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = random_entries(seed, 600, 1000.0);
    let mut live: Vec<(Region, u64)> = Vec::new();

    for (step, (bounds, payload)) in pool.into_iter().enumerate() {
        index.insert(bounds.clone(), payload).unwrap();
        live.push((bounds, payload));

        if rng.gen_bool(0.4) {
            let (bounds, payload) = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(index.delete(&bounds, payload).unwrap());
        }
        if step % 50 == 0 {
            assert_consistent(index, &live);
        }
    }
    assert_consistent(index, &live);
    live
}

#[test]
fn test_invariants_hold_under_churn() {
    init_logging();
    let configs = [
        IndexConfig::new(2, 4, 2),
        IndexConfig::new(2, 8, 3),
        IndexConfig::new(2, 16, 8).with_split_policy(SplitPolicy::Linear),
        IndexConfig::new(2, 6, 2).with_split_policy(SplitPolicy::Linear),
    ];
    for (seed, config) in configs.into_iter().enumerate() {
        let mut index = RTreeIndex::in_memory(config).unwrap();
        let live = churn(&mut index, seed as u64);

        for (bounds, payload) in &live {
            let found = sorted_payloads(index.query(bounds).unwrap());
            assert!(found.contains(payload), "{:?}: lost entry {}", config, payload);
        }
        for window in random_windows(seed as u64 + 100, 30, 1000.0) {
            assert_eq!(sorted_payloads(index.query(&window).unwrap()), brute_force(&live, &window));
        }
    }
}

#[test]
fn test_three_dimensional_tree() {
    let mut rng = StdRng::seed_from_u64(77);
    let mut index = RTreeIndex::in_memory(IndexConfig::new(3, 8, 3)).unwrap();
    let mut live = Vec::new();
    for i in 0..200u64 {
        let p: Vec<f64> = (0..3).map(|_| rng.gen_range(0.0..100.0)).collect();
        let q: Vec<f64> = p.iter().map(|v| v + rng.gen_range(0.0..3.0)).collect();
        let bounds = Region::new(&p, &q).unwrap();
        index.insert(bounds.clone(), i).unwrap();
        live.push((bounds, i));
    }
    let window = Region::new(&[20.0, 20.0, 20.0], &[60.0, 60.0, 60.0]).unwrap();
    let mut expected: Vec<u64> = live
        .iter()
        .filter(|(b, _)| window.intersects(b))
        .map(|(_, i)| *i)
        .collect();
    expected.sort_unstable();
    assert_eq!(sorted_payloads(index.query(&window).unwrap()), expected);
    assert!(index.query(&Region::rect(0.0, 0.0, 1.0, 1.0)).is_err());
}

#[test]
fn test_paged_tree_matches_memory_tree() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = IndexConfig::new(2, 8, 3);
    let options = PagedOptions::default().with_page_size(2048).with_cache_pages(6);

    let mut memory = RTreeIndex::in_memory(config).unwrap();
    let mut paged = RTreeIndex::create_paged(dir.path().join("tree.scix"), config, options).unwrap();
    let live_memory = churn(&mut memory, 42);
    let live_paged = churn(&mut paged, 42);
    assert_eq!(live_memory, live_paged);

    for window in random_windows(7, 40, 1000.0) {
        assert_eq!(
            sorted_payloads(memory.query(&window).unwrap()),
            sorted_payloads(paged.query(&window).unwrap())
        );
    }
    assert_eq!(memory.bounds().unwrap(), paged.bounds().unwrap());
    assert_eq!(memory.height(), paged.height());

    let stats = paged.stats();
    assert!(stats.cached_pages <= 6);
    assert!(stats.disk_reads > 0);
    assert!(paged.check_integrity().unwrap().is_valid());
}

#[test]
fn test_nearest_agrees_with_scan() {
    let live = random_entries(5, 300, 100.0);
    let mut index = RTreeIndex::in_memory(IndexConfig::new(2, 8, 3)).unwrap();
    for (bounds, payload) in &live {
        index.insert(bounds.clone(), *payload).unwrap();
    }

    let point = [50.0, 50.0];
    let nearest = index.nearest(&point, 10).unwrap();
    let mut distances: Vec<f64> = live.iter().map(|(b, _)| b.min_distance(&point)).collect();
    distances.sort_by(|a, b| a.total_cmp(b));
    let got: Vec<f64> = nearest.iter().map(|(_, d)| *d).collect();
    assert_eq!(got, distances[..10].to_vec());
}
