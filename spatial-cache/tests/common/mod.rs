//! Helpers shared by the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spatial_cache::{Entry, IndexResult, Region};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `count` small boxes with distinct payloads, scattered over
/// `[0, extent]^2` (a few may poke out of it).
pub fn random_entries(seed: u64, count: u64, extent: f64) -> Vec<(Region, u64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let x = rng.gen_range(0.0..extent);
            let y = rng.gen_range(0.0..extent);
            let w = rng.gen_range(0.0..extent / 50.0);
            let h = rng.gen_range(0.0..extent / 50.0);
            (Region::rect(x, y, x + w, y + h), i)
        })
        .collect()
}

pub fn random_windows(seed: u64, count: usize, extent: f64) -> Vec<Region> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let x = rng.gen_range(-extent / 10.0..extent);
            let y = rng.gen_range(-extent / 10.0..extent);
            let size = rng.gen_range(0.0..extent / 3.0);
            Region::rect(x, y, x + size, y + size)
        })
        .collect()
}

/// Payloads of the entries a correct index must report for `window`.
pub fn brute_force(entries: &[(Region, u64)], window: &Region) -> Vec<u64> {
    let mut expected: Vec<u64> = entries
        .iter()
        .filter(|(bounds, _)| window.intersects(bounds))
        .map(|(_, payload)| *payload)
        .collect();
    expected.sort_unstable();
    expected
}

/// Drains a query result into sorted payloads.
pub fn sorted_payloads<I>(results: I) -> Vec<u64>
where
    I: IntoIterator<Item = IndexResult<Entry>>,
{
    let mut payloads: Vec<u64> = results
        .into_iter()
        .map(|r| r.expect("query failed").payload.value())
        .collect();
    payloads.sort_unstable();
    payloads
}
