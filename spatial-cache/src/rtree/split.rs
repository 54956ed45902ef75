//! Node split policies.
//!
//! Both policies pick two seeds, then hand out the remaining items one at a
//! time to the group whose bounds grow least. Ties go to the smaller group,
//! then to the group with the smaller area. Once a group can only reach the
//! minimum occupancy by taking every remaining item, it takes them all.

use crate::config::SplitPolicy;
use crate::region::Region;

/// Splits `items` into two groups of at least `min` items each.
///
/// The first group keeps the first seed; callers leave it in the node being
/// split and move the second group into a new sibling.
pub(crate) fn partition<T>(
    items: Vec<T>,
    bounds_of: impl Fn(&T) -> &Region,
    min: usize,
    policy: SplitPolicy,
) -> (Vec<T>, Vec<T>) {
    let regions: Vec<Region> = items.iter().map(|item| bounds_of(item).clone()).collect();
    let (seed_a, seed_b) = match policy {
        SplitPolicy::Quadratic => quadratic_seeds(&regions),
        SplitPolicy::Linear => linear_seeds(&regions),
    };

    let mut group_a = vec![seed_a];
    let mut group_b = vec![seed_b];
    let mut bounds_a = regions[seed_a].clone();
    let mut bounds_b = regions[seed_b].clone();
    let mut remaining: Vec<usize> = (0..regions.len())
        .filter(|&i| i != seed_a && i != seed_b)
        .collect();

    while !remaining.is_empty() {
        if group_a.len() + remaining.len() <= min {
            group_a.append(&mut remaining);
            break;
        }
        if group_b.len() + remaining.len() <= min {
            group_b.append(&mut remaining);
            break;
        }

        let pos = match policy {
            SplitPolicy::Quadratic => pick_next(&remaining, &regions, &bounds_a, &bounds_b),
            SplitPolicy::Linear => 0,
        };
        let i = remaining.remove(pos);
        let grow_a = bounds_a.enlargement(&regions[i]);
        let grow_b = bounds_b.enlargement(&regions[i]);

        let to_a = if grow_a != grow_b {
            grow_a < grow_b
        } else if group_a.len() != group_b.len() {
            group_a.len() < group_b.len()
        } else {
            bounds_a.area() <= bounds_b.area()
        };

        if to_a {
            bounds_a = bounds_a.combine(&regions[i]);
            group_a.push(i);
        } else {
            bounds_b = bounds_b.combine(&regions[i]);
            group_b.push(i);
        }
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    let take = |slots: &mut Vec<Option<T>>, group: Vec<usize>| -> Vec<T> {
        group.into_iter().filter_map(|i| slots[i].take()).collect()
    };
    let first = take(&mut slots, group_a);
    let second = take(&mut slots, group_b);
    (first, second)
}

/// The pair whose combined bounds waste the most area.
fn quadratic_seeds(regions: &[Region]) -> (usize, usize) {
    let mut best = (0, 1);
    let mut worst_waste = f64::NEG_INFINITY;
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            let waste = regions[i].combine(&regions[j]).area() - regions[i].area() - regions[j].area();
            if waste > worst_waste {
                worst_waste = waste;
                best = (i, j);
            }
        }
    }
    best
}

/// The pair with the greatest separation along any axis, normalized by the
/// total extent on that axis.
fn linear_seeds(regions: &[Region]) -> (usize, usize) {
    let dims = regions[0].dimension();
    let mut best = (0, 1);
    let mut best_separation = f64::NEG_INFINITY;

    for axis in 0..dims {
        let mut highest_low = 0;
        let mut lowest_high = 0;
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for (i, r) in regions.iter().enumerate() {
            if r.min()[axis] > regions[highest_low].min()[axis] {
                highest_low = i;
            }
            if r.max()[axis] < regions[lowest_high].max()[axis] {
                lowest_high = i;
            }
            lo = lo.min(r.min()[axis]);
            hi = hi.max(r.max()[axis]);
        }
        if highest_low == lowest_high {
            lowest_high = if highest_low == 0 { 1 } else { 0 };
        }
        let width = if hi > lo { hi - lo } else { 1.0 };
        let separation =
            (regions[highest_low].min()[axis] - regions[lowest_high].max()[axis]) / width;
        if separation > best_separation {
            best_separation = separation;
            best = (lowest_high.min(highest_low), lowest_high.max(highest_low));
        }
    }
    best
}

/// Position in `remaining` of the item with the strongest group preference.
fn pick_next(remaining: &[usize], regions: &[Region], bounds_a: &Region, bounds_b: &Region) -> usize {
    let mut best = 0;
    let mut best_diff = f64::NEG_INFINITY;
    for (pos, &i) in remaining.iter().enumerate() {
        let diff = (bounds_a.enlargement(&regions[i]) - bounds_b.enlargement(&regions[i])).abs();
        if diff > best_diff {
            best_diff = diff;
            best = pos;
        }
    }
    best
}
