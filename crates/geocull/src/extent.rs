//! Axis-aligned extents and an R-tree over many of them.
//!
//! Extents are the cheapest overlap test available and are only ever used
//! to discard candidates. A reported overlap says nothing about a true
//! intersection; a reported miss is final.

use crate::point::{Coord, Point};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    /// Build from two corners in any order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            xmin: x0.min(x1),
            ymin: y0.min(y1),
            xmax: x0.max(x1),
            ymax: y0.max(y1),
        }
    }

    /// Extent of all finite coordinates, or `None` if there are none.
    pub fn of_coords<I>(coords: I) -> Option<Self>
    where
        I: IntoIterator<Item = Coord>,
    {
        let (mut xmin, mut ymin) = (f64::INFINITY, f64::INFINITY);
        let (mut xmax, mut ymax) = (f64::NEG_INFINITY, f64::NEG_INFINITY);

        for [x, y] in coords {
            if x.is_finite() && y.is_finite() {
                xmin = xmin.min(x);
                xmax = xmax.max(x);
                ymin = ymin.min(y);
                ymax = ymax.max(y);
            }
        }

        if xmin > xmax {
            return None;
        }

        Some(Self {
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    pub fn of_points(points: &[Point]) -> Option<Self> {
        Self::of_coords(points.iter().map(Point::xy))
    }

    /// Standard AABB test; touching edges count as overlap.
    #[inline]
    pub fn overlaps(&self, other: &Extent) -> bool {
        !(self.xmax < other.xmin
            || other.xmax < self.xmin
            || self.ymax < other.ymin
            || other.ymax < self.ymin)
    }

    /// Component-wise min/max.
    #[inline]
    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    /// Union of many extents.
    pub fn reduce<I>(extents: I) -> Option<Extent>
    where
        I: IntoIterator<Item = Extent>,
    {
        extents.into_iter().reduce(|a, b| a.union(&b))
    }

    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    /// Points inside (or on the boundary of) this extent, in input order.
    pub fn crop(&self, points: &[Point]) -> Vec<Point> {
        points
            .iter()
            .filter(|p| self.contains(p.x, p.y))
            .copied()
            .collect()
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    #[inline]
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    #[inline]
    fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.xmin, self.ymin], [self.xmax, self.ymax])
    }
}

#[derive(Clone)]
struct IndexedExtent {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedExtent {
    type Envelope = AABB<[f64; 2]>;

    #[inline]
    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// R-tree over extents tagged with a caller-chosen index.
pub struct ExtentIndex {
    tree: RTree<IndexedExtent>,
}

impl ExtentIndex {
    pub fn new<I>(extents: I) -> Self
    where
        I: IntoIterator<Item = (usize, Extent)>,
    {
        let items: Vec<IndexedExtent> = extents
            .into_iter()
            .map(|(idx, e)| IndexedExtent {
                idx,
                env: e.envelope(),
            })
            .collect();

        Self {
            tree: RTree::bulk_load(items),
        }
    }

    /// Indices whose extent overlaps `extent`, ascending.
    pub fn overlapping(&self, extent: &Extent) -> SmallVec<[usize; 8]> {
        let mut hits: SmallVec<[usize; 8]> = self
            .tree
            .locate_in_envelope_intersecting(&extent.envelope())
            .map(|e| e.idx)
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Indices whose extent contains the point, ascending.
    pub fn containing(&self, x: f64, y: f64) -> SmallVec<[usize; 8]> {
        let mut hits: SmallVec<[usize; 8]> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point([x, y]))
            .map(|e| e.idx)
            .collect();
        hits.sort_unstable();
        hits
    }

    /// Cheaper than [`Self::containing`] when only membership matters.
    pub fn any_containing(&self, x: f64, y: f64) -> bool {
        self.tree
            .locate_in_envelope_intersecting(&AABB::from_point([x, y]))
            .next()
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}
