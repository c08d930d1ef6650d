//! Core-grid geometry: coordinates, inclusive rectangles, and sets of them.

use std::fmt;

use crate::error::{CclError, Result};

/// A compute-core coordinate on one chip's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreCoord {
    pub x: usize,
    pub y: usize,
}

impl CoreCoord {
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An inclusive rectangle of cores, `start` to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRange {
    start: CoreCoord,
    end: CoreCoord,
}

impl CoreRange {
    /// Builds the rectangle spanned by two corners, in either order.
    pub fn new(a: CoreCoord, b: CoreCoord) -> Self {
        Self {
            start: CoreCoord::new(a.x.min(b.x), a.y.min(b.y)),
            end: CoreCoord::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// A range covering exactly one core.
    pub fn single(core: CoreCoord) -> Self {
        Self::new(core, core)
    }

    pub const fn start(&self) -> CoreCoord {
        self.start
    }

    pub const fn end(&self) -> CoreCoord {
        self.end
    }

    pub fn num_cores(&self) -> usize {
        (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        (self.start.x..=self.end.x).contains(&core.x) && (self.start.y..=self.end.y).contains(&core.y)
    }

    pub fn intersects(&self, other: &CoreRange) -> bool {
        self.start.x <= other.end.x
            && other.start.x <= self.end.x
            && self.start.y <= other.end.y
            && other.start.y <= self.end.y
    }

    /// Whether the range lies inside a grid of `grid.x` by `grid.y` cores.
    pub fn fits_in(&self, grid: CoreCoord) -> bool {
        self.end.x < grid.x && self.end.y < grid.y
    }

    /// Cores in row-major order (y outer, x inner).
    pub fn cores(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        (self.start.y..=self.end.y)
            .flat_map(move |y| (self.start.x..=self.end.x).map(move |x| CoreCoord::new(x, y)))
    }
}

impl fmt::Display for CoreRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {}]", self.start, self.end)
    }
}

/// A set of pairwise-disjoint core ranges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    /// Builds a set, rejecting ranges that overlap each other.
    pub fn new(ranges: impl IntoIterator<Item = CoreRange>) -> Result<Self> {
        let ranges: Vec<CoreRange> = ranges.into_iter().collect();
        for (i, a) in ranges.iter().enumerate() {
            if let Some(b) = ranges[i + 1..].iter().find(|b| a.intersects(b)) {
                return Err(CclError::OverlappingCoreRanges {
                    first: *a,
                    second: *b,
                });
            }
        }
        Ok(Self { ranges })
    }

    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    pub fn num_cores(&self) -> usize {
        self.ranges.iter().map(CoreRange::num_cores).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }

    /// The first pair of ranges (one from each set) that overlap, if any.
    pub fn overlap(&self, other: &CoreRangeSet) -> Option<(CoreRange, CoreRange)> {
        self.ranges.iter().find_map(|a| {
            other
                .ranges
                .iter()
                .find(|b| a.intersects(b))
                .map(|b| (*a, *b))
        })
    }

    /// Every core in the set, sorted row-major.
    pub fn cores(&self) -> Vec<CoreCoord> {
        let mut cores: Vec<CoreCoord> = self.ranges.iter().flat_map(|r| r.cores()).collect();
        cores.sort_by_key(|c| (c.y, c.x));
        cores
    }

    /// Checks every range fits inside `grid`.
    pub fn check_fits(&self, grid: CoreCoord) -> Result<()> {
        match self.ranges.iter().find(|r| !r.fits_in(grid)) {
            Some(range) => Err(CclError::CoreRangeOutOfGrid { range: *range, grid }),
            None => Ok(()),
        }
    }
}

impl From<CoreRange> for CoreRangeSet {
    fn from(range: CoreRange) -> Self {
        Self {
            ranges: vec![range],
        }
    }
}

impl fmt::Display for CoreRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{r}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(x0: usize, y0: usize, x1: usize, y1: usize) -> CoreRange {
        CoreRange::new(CoreCoord::new(x0, y0), CoreCoord::new(x1, y1))
    }

    #[test]
    fn test_range_geometry() {
        let r = range(3, 3, 0, 0);
        assert_eq!(r.start(), CoreCoord::new(0, 0));
        assert_eq!(r.num_cores(), 16);
        assert!(r.contains(CoreCoord::new(2, 1)));
        assert!(!r.contains(CoreCoord::new(4, 1)));
        assert!(r.fits_in(CoreCoord::new(4, 4)));
        assert!(!r.fits_in(CoreCoord::new(3, 8)));
    }

    #[test]
    fn test_range_cores_row_major() {
        let cores: Vec<_> = range(0, 0, 1, 1).cores().collect();
        assert_eq!(
            cores,
            vec![
                CoreCoord::new(0, 0),
                CoreCoord::new(1, 0),
                CoreCoord::new(0, 1),
                CoreCoord::new(1, 1)
            ]
        );
    }

    #[test]
    fn test_set_rejects_overlap() {
        let err = CoreRangeSet::new([range(0, 0, 3, 3), range(3, 3, 4, 4)]);
        assert!(matches!(err, Err(CclError::OverlappingCoreRanges { .. })));

        let ok = CoreRangeSet::new([range(0, 0, 3, 3), range(4, 4, 4, 4)]).unwrap();
        assert_eq!(ok.num_cores(), 17);
    }

    #[test]
    fn test_set_overlap_between_sets() {
        let a = CoreRangeSet::from(range(0, 0, 1, 1));
        let b = CoreRangeSet::from(range(1, 1, 2, 2));
        let c = CoreRangeSet::from(range(5, 5, 5, 5));
        assert!(a.overlap(&b).is_some());
        assert!(a.overlap(&c).is_none());
    }

    #[test]
    fn test_check_fits() {
        let set = CoreRangeSet::from(range(0, 0, 7, 7));
        assert!(set.check_fits(CoreCoord::new(8, 8)).is_ok());
        assert!(matches!(
            set.check_fits(CoreCoord::new(8, 7)),
            Err(CclError::CoreRangeOutOfGrid { .. })
        ));
    }

    #[test]
    fn test_display() {
        let set = CoreRangeSet::new([range(0, 0, 1, 1), range(4, 4, 4, 4)]).unwrap();
        assert_eq!(set.to_string(), "{[(0, 0) - (1, 1)], [(4, 4) - (4, 4)]}");
    }
}
