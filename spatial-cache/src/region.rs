use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::types::{IndexError, IndexResult};

/// Per-axis coordinates. Two axes stay inline.
pub type Coords = SmallVec<[f64; 2]>;

/// An axis-aligned bounding region in `D` dimensions.
///
/// `Region` is the only geometric primitive the indexes reason about. It is
/// an immutable value: every operation returns a new region. The invariant
/// `min[i] <= max[i]` holds for every axis, and degenerate regions (points,
/// segments) are legal with an area of 0.
///
/// # Examples
///
/// ```rust
/// use spatial_cache::Region;
///
/// let a = Region::rect(0.0, 0.0, 2.0, 2.0);
/// let b = Region::rect(1.0, 1.0, 3.0, 3.0);
///
/// assert!(a.intersects(&b));
/// assert_eq!(a.combine(&b), Region::rect(0.0, 0.0, 3.0, 3.0));
/// assert_eq!(a.area(), 4.0);
/// ```
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Region {
    min: Coords,
    max: Coords,
}

impl Eq for Region {}

impl Hash for Region {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for v in self.min.iter().chain(self.max.iter()) {
            v.to_bits().hash(state);
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({:?} - {:?})", self.min.as_slice(), self.max.as_slice())
    }
}

impl Region {
    /// Creates a region from its low and high corners.
    ///
    /// Fails when the corners have different (or zero) dimensions, when a
    /// coordinate is NaN, or when `min[i] > max[i]` on some axis.
    pub fn new(min: &[f64], max: &[f64]) -> IndexResult<Region> {
        if min.is_empty() {
            return Err(IndexError::InvalidRegion("region needs at least one axis".into()));
        }
        if min.len() != max.len() {
            return Err(IndexError::InvalidRegion(format!(
                "corner dimensions differ ({} vs {})",
                min.len(),
                max.len()
            )));
        }
        for (axis, (lo, hi)) in min.iter().zip(max.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() {
                return Err(IndexError::InvalidRegion(format!("NaN coordinate on axis {}", axis)));
            }
            if lo > hi {
                return Err(IndexError::InvalidRegion(format!(
                    "min {} exceeds max {} on axis {}",
                    lo, hi, axis
                )));
            }
        }
        Ok(Region {
            min: Coords::from_slice(min),
            max: Coords::from_slice(max),
        })
    }

    /// Creates a 2D region. Corner order is normalized, so the arguments may
    /// name any two opposite corners.
    ///
    /// # Panics
    ///
    /// Panics if a coordinate is NaN. Use [`Region::try_rect`] for
    /// coordinates that are not known to be valid.
    pub fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> Region {
        match Region::try_rect(x1, y1, x2, y2) {
            Ok(region) => region,
            Err(e) => panic!("{}", e),
        }
    }

    /// Fallible form of [`Region::rect`]; rejects NaN coordinates.
    pub fn try_rect(x1: f64, y1: f64, x2: f64, y2: f64) -> IndexResult<Region> {
        // f64::min skips NaN, so normalizing first would hide it
        if [x1, y1, x2, y2].iter().any(|c| c.is_nan()) {
            return Err(IndexError::InvalidRegion(format!(
                "NaN corner in ({}, {}) - ({}, {})",
                x1, y1, x2, y2
            )));
        }
        Region::new(&[x1.min(x2), y1.min(y2)], &[x1.max(x2), y1.max(y2)])
    }

    /// Creates a degenerate region covering a single point.
    pub fn point(coords: &[f64]) -> IndexResult<Region> {
        Region::new(coords, coords)
    }

    /// True when no coordinate is infinite.
    pub fn is_finite(&self) -> bool {
        self.min.iter().chain(self.max.iter()).all(|c| c.is_finite())
    }

    /// Number of axes.
    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    /// Low corner.
    pub fn min(&self) -> &[f64] {
        &self.min
    }

    /// High corner.
    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// Length of the region along `axis`.
    pub fn extent(&self, axis: usize) -> f64 {
        self.max[axis] - self.min[axis]
    }

    /// Returns the product of the per-axis extents; 0 for degenerate regions.
    pub fn area(&self) -> f64 {
        (0..self.dimension()).map(|axis| self.extent(axis)).product()
    }

    /// Returns the center point.
    pub fn center(&self) -> Coords {
        self.min
            .iter()
            .zip(self.max.iter())
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    /// Checks if this region fully contains another one (boundaries included).
    pub fn contains(&self, other: &Region) -> bool {
        self.axes(other)
            .all(|(a_lo, a_hi, b_lo, b_hi)| a_lo <= b_lo && b_hi <= a_hi)
    }

    /// Checks if the closed regions share at least one point.
    ///
    /// Used to prune descent: any region intersecting a child also touches
    /// the child's bounds.
    pub fn touches(&self, other: &Region) -> bool {
        self.axes(other)
            .all(|(a_lo, a_hi, b_lo, b_hi)| a_lo <= b_hi && b_lo <= a_hi)
    }

    /// Checks if this region intersects another one.
    ///
    /// Regions that only share a boundary face do not intersect. On an axis
    /// where either region is degenerate the comparison is closed, so a
    /// point lying on a boundary still intersects.
    pub fn intersects(&self, other: &Region) -> bool {
        self.axes(other).all(|(a_lo, a_hi, b_lo, b_hi)| {
            let lo = a_lo.max(b_lo);
            let hi = a_hi.min(b_hi);
            if lo < hi {
                true
            } else if lo == hi {
                a_lo == a_hi || b_lo == b_hi
            } else {
                false
            }
        })
    }

    /// Returns the minimum bounding region of both regions.
    pub fn combine(&self, other: &Region) -> Region {
        Region {
            min: self
                .min
                .iter()
                .zip(other.min.iter())
                .map(|(a, b)| a.min(*b))
                .collect(),
            max: self
                .max
                .iter()
                .zip(other.max.iter())
                .map(|(a, b)| a.max(*b))
                .collect(),
        }
    }

    /// Combines every region of the iterator; `None` when it is empty.
    pub fn combine_all<'a, I>(regions: I) -> Option<Region>
    where
        I: IntoIterator<Item = &'a Region>,
    {
        let mut iter = regions.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, r| acc.combine(r)))
    }

    /// Area growth needed for this region to also cover `other`.
    pub fn enlargement(&self, other: &Region) -> f64 {
        self.combine(other).area() - self.area()
    }

    /// Euclidean distance from `point` to the closest point of the region;
    /// 0 when the point lies inside.
    pub fn min_distance(&self, point: &[f64]) -> f64 {
        self.min
            .iter()
            .zip(self.max.iter())
            .zip(point.iter())
            .map(|((lo, hi), p)| {
                let d = p - p.clamp(*lo, *hi);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    fn axes<'a>(&'a self, other: &'a Region) -> impl Iterator<Item = (f64, f64, f64, f64)> + 'a {
        self.min
            .iter()
            .zip(self.max.iter())
            .zip(other.min.iter().zip(other.max.iter()))
            .map(|((a_lo, a_hi), (b_lo, b_hi))| (*a_lo, *a_hi, *b_lo, *b_hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_inverted_axis() {
        assert!(Region::new(&[0.0, 5.0], &[1.0, 4.0]).is_err());
        assert!(Region::new(&[0.0], &[1.0, 4.0]).is_err());
        assert!(Region::new(&[], &[]).is_err());
        assert!(Region::new(&[f64::NAN], &[1.0]).is_err());
        assert!(Region::new(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]).is_ok());
    }

    #[test]
    fn test_rect_normalizes_corners() {
        let r = Region::rect(3.0, 1.0, 0.0, 2.0);
        assert_eq!(r.min(), &[0.0, 1.0]);
        assert_eq!(r.max(), &[3.0, 2.0]);
        assert_eq!(r.dimension(), 2);
    }

    #[test]
    fn test_try_rect_rejects_nan() {
        assert!(matches!(
            Region::try_rect(f64::NAN, 0.0, 1.0, 1.0),
            Err(IndexError::InvalidRegion(_))
        ));
        assert!(Region::try_rect(0.0, 0.0, 1.0, f64::NAN).is_err());
        assert_eq!(
            Region::try_rect(3.0, 1.0, 0.0, 2.0).unwrap(),
            Region::rect(0.0, 1.0, 3.0, 2.0)
        );
    }

    #[test]
    #[should_panic]
    fn test_rect_panics_on_nan() {
        Region::rect(0.0, f64::NAN, 1.0, 1.0);
    }

    #[test]
    fn test_area_and_degenerate() {
        assert_eq!(Region::rect(0.0, 0.0, 2.0, 3.0).area(), 6.0);
        let p = Region::point(&[1.0, 1.0]).unwrap();
        assert_eq!(p.area(), 0.0);
        assert_eq!(Region::rect(0.0, 0.0, 5.0, 0.0).area(), 0.0);
    }

    #[test]
    fn test_contains_is_closed() {
        let outer = Region::rect(0.0, 0.0, 10.0, 10.0);
        assert!(outer.contains(&Region::rect(0.0, 0.0, 10.0, 10.0)));
        assert!(outer.contains(&Region::rect(2.0, 2.0, 3.0, 3.0)));
        assert!(!outer.contains(&Region::rect(9.0, 9.0, 11.0, 10.0)));
        assert!(!Region::rect(2.0, 2.0, 3.0, 3.0).contains(&outer));
    }

    #[test]
    fn test_intersects_excludes_shared_faces() {
        let window = Region::rect(0.0, 0.0, 2.0, 2.0);
        assert!(window.intersects(&Region::rect(1.0, 1.0, 3.0, 3.0)));
        // corner contact only
        assert!(!window.intersects(&Region::rect(2.0, 2.0, 3.0, 3.0)));
        // edge contact only
        assert!(!window.intersects(&Region::rect(2.0, 0.0, 3.0, 2.0)));
        assert!(!window.intersects(&Region::rect(5.0, 5.0, 6.0, 6.0)));
        // but the closed test sees the contact
        assert!(window.touches(&Region::rect(2.0, 2.0, 3.0, 3.0)));
    }

    #[test]
    fn test_intersects_degenerate_on_boundary() {
        let window = Region::rect(0.0, 0.0, 2.0, 2.0);
        let corner = Region::point(&[2.0, 2.0]).unwrap();
        assert!(window.intersects(&corner));
        assert!(corner.intersects(&corner));
        let segment = Region::rect(2.0, 0.5, 2.0, 1.5);
        assert!(window.intersects(&segment));
    }

    #[test]
    fn test_combine_commutative_and_associative() {
        let a = Region::rect(0.0, 0.0, 1.0, 1.0);
        let b = Region::rect(2.0, -1.0, 3.0, 0.5);
        let c = Region::rect(-4.0, 2.0, -3.0, 8.0);
        assert_eq!(a.combine(&b), b.combine(&a));
        assert_eq!(a.combine(&b).combine(&c), a.combine(&b.combine(&c)));
        assert_eq!(a.combine(&b), Region::rect(0.0, -1.0, 3.0, 1.0));
    }

    #[test]
    fn test_combine_all() {
        let regions = vec![
            Region::rect(0.0, 0.0, 1.0, 1.0),
            Region::rect(4.0, 4.0, 5.0, 5.0),
        ];
        assert_eq!(
            Region::combine_all(&regions),
            Some(Region::rect(0.0, 0.0, 5.0, 5.0))
        );
        assert_eq!(Region::combine_all(Vec::<Region>::new().iter()), None);
    }

    #[test]
    fn test_enlargement() {
        let a = Region::rect(0.0, 0.0, 2.0, 2.0);
        assert_eq!(a.enlargement(&Region::rect(1.0, 1.0, 2.0, 2.0)), 0.0);
        assert_eq!(a.enlargement(&Region::rect(0.0, 0.0, 4.0, 2.0)), 4.0);
    }

    #[test]
    fn test_min_distance() {
        let r = Region::rect(0.0, 0.0, 1.0, 1.0);
        assert_eq!(r.min_distance(&[0.5, 0.5]), 0.0);
        assert_eq!(r.min_distance(&[4.0, 1.0]), 3.0);
        assert_eq!(r.min_distance(&[4.0, 5.0]), 5.0);
    }

    #[test]
    fn test_center() {
        let r = Region::rect(0.0, 2.0, 4.0, 6.0);
        assert_eq!(r.center().as_slice(), &[2.0, 4.0]);
    }
}
