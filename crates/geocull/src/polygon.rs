use crate::extent::Extent;
use crate::hull::{cross, on_segment};
use crate::point::Coord;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed boundary. The closing vertex is implicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ring {
    coords: Vec<Coord>,
}

impl Ring {
    /// Accepts explicitly closed (first == last) or open vertex lists.
    pub fn new(mut coords: Vec<Coord>) -> Self {
        while coords.len() > 1 && coords.first() == coords.last() {
            coords.pop();
        }
        Self { coords }
    }

    #[inline]
    pub fn coords(&self) -> &[Coord] {
        &self.coords
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.coords.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// Shoelace area; positive for counter-clockwise traversal.
    pub fn signed_area(&self) -> f64 {
        let n = self.coords.len();
        if n < 3 {
            return 0.0;
        }

        // Shift by the first vertex to keep products small for geographic coordinates.
        let [ox, oy] = self.coords[0];
        let twice: f64 = (0..n)
            .map(|i| {
                let [x0, y0] = self.coords[i];
                let [x1, y1] = self.coords[(i + 1) % n];
                (x0 - ox) * (y1 - oy) - (x1 - ox) * (y0 - oy)
            })
            .sum();

        0.5 * twice
    }

    pub fn extent(&self) -> Option<Extent> {
        Extent::of_coords(self.coords.iter().copied())
    }

    /// Fewer than three distinct vertices, or no measurable area.
    pub fn is_degenerate(&self) -> bool {
        if self.coords.len() < 3 {
            return true;
        }
        let Some(e) = self.extent() else {
            return true;
        };
        let box_area = e.width() * e.height();
        box_area.is_nan() || box_area <= 0.0 || self.signed_area().abs() <= 1e-12 * box_area
    }

    #[inline]
    fn edge(&self, i: usize) -> (Coord, Coord) {
        (self.coords[i], self.coords[(i + 1) % self.coords.len()])
    }

    /// Even-odd crossing test, closed: points on an edge are inside.
    /// Orientation does not matter.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.coords.len();
        if n < 3 {
            return false;
        }

        let p = [x, y];
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.coords[i];
            let [xj, yj] = self.coords[j];

            if on_segment(self.coords[j], self.coords[i], p) {
                return true;
            }

            // Edge straddles the horizontal line through y?
            if (yi > y) != (yj > y) {
                let x_inter = (xj - xi) * ((y - yi) / (yj - yi)) + xi;
                if x < x_inter {
                    inside = !inside;
                }
            }
            j = i;
        }

        inside
    }

    /// True if two non-adjacent edges properly cross.
    ///
    /// Edge boxes go into an R-tree and each edge is tested only against the
    /// edges whose boxes it touches. Rings with non-finite vertices report false.
    pub fn self_intersects(&self) -> bool {
        let n = self.coords.len();
        if n < 4 || !self.coords.iter().flatten().all(|v| v.is_finite()) {
            return false;
        }

        let edges: Vec<GeomWithData<Rectangle<Coord>, usize>> = (0..n)
            .map(|i| {
                let (a, b) = self.edge(i);
                GeomWithData::new(Rectangle::from_corners(a, b), i)
            })
            .collect();
        let tree = RTree::bulk_load(edges);

        (0..n).any(|i| {
            let (a, b) = self.edge(i);
            tree.locate_in_envelope_intersecting(&AABB::from_corners(a, b))
                .any(|e| {
                    let k = e.data;
                    // Each pair once; neighbours share a vertex, as do the first and last edges.
                    if k <= i + 1 || (i == 0 && k == n - 1) {
                        return false;
                    }
                    let (c, d) = self.edge(k);
                    segments_cross(a, b, c, d)
                })
        })
    }

    pub fn reversed(&self) -> Ring {
        let mut coords = self.coords.clone();
        coords.reverse();
        Ring { coords }
    }
}

#[inline]
fn segments_cross(a: Coord, b: Coord, c: Coord, d: Coord) -> bool {
    let d1 = cross(a, b, c);
    let d2 = cross(a, b, d);
    let d3 = cross(c, d, a);
    let d4 = cross(c, d, b);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

/// One vector record: an outer ring, optional inner rings and its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    /// Stable per-shape identifier from the vector source.
    pub id: String,
    /// Position of the record in its source.
    pub source_index: usize,
    pub outer: Ring,
    #[serde(default)]
    pub holes: Vec<Ring>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Polygon {
    pub fn new(id: impl Into<String>, source_index: usize, outer: Ring) -> Self {
        Self {
            id: id.into(),
            source_index,
            outer,
            holes: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_hole(mut self, hole: Ring) -> Self {
        self.holes.push(hole);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Signed area of the outer ring. Negative marks an island/hole record.
    pub fn signed_area(&self) -> f64 {
        self.outer.signed_area()
    }

    pub fn is_island(&self) -> bool {
        self.signed_area() < 0.0
    }

    pub fn extent(&self) -> Option<Extent> {
        self.outer.extent()
    }

    /// Inside the outer ring and outside every hole. Degenerate rings contain nothing.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.contains_ignoring_holes(x, y)
            && !self
                .holes
                .iter()
                .any(|h| !h.is_degenerate() && h.contains(x, y))
    }

    pub fn contains_ignoring_holes(&self, x: f64, y: f64) -> bool {
        !self.outer.is_degenerate() && self.outer.contains(x, y)
    }
}

/// Keep records whose attribute equals a value, e.g. `LAND == "n"` for water shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrFilter {
    pub key: String,
    pub equals: String,
}

impl AttrFilter {
    pub fn new(key: impl Into<String>, equals: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            equals: equals.into(),
        }
    }

    pub fn matches(&self, polygon: &Polygon) -> bool {
        polygon.attribute(&self.key) == Some(self.equals.as_str())
    }
}
