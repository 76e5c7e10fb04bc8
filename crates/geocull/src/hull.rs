//! Planar convex hulls: construction, union and overlap.

use crate::extent::Extent;
use crate::point::{Coord, Point};
use crate::polygon::Polygon;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Relative tolerance for on-boundary tests.
const EPS: f64 = 1e-9;

/// Twice the signed area of triangle `o, a, b`; positive when `b` is left of `o -> a`.
#[inline]
pub(crate) fn cross(o: Coord, a: Coord, b: Coord) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

#[inline]
fn cmp_xy(a: &Coord, b: &Coord) -> Ordering {
    a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1]))
}

/// Convex boundary of a point set.
///
/// Vertices are a subset of the inputs, counter-clockwise, with interior
/// collinear points dropped. Fewer than three vertices is a degenerate hull
/// (a point or a segment) with zero area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvexHull {
    vertices: Vec<Coord>,
}

impl ConvexHull {
    /// Monotone chain over all finite coordinates.
    pub fn of_coords<I>(coords: I) -> Self
    where
        I: IntoIterator<Item = Coord>,
    {
        let mut pts: Vec<Coord> = coords
            .into_iter()
            .filter(|[x, y]| x.is_finite() && y.is_finite())
            .collect();

        pts.sort_unstable_by(cmp_xy);
        pts.dedup_by(|a, b| cmp_xy(a, b) == Ordering::Equal);

        if pts.len() <= 2 {
            return Self { vertices: pts };
        }

        let mut lower: Vec<Coord> = Vec::with_capacity(pts.len());
        for &p in &pts {
            while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0
            {
                lower.pop();
            }
            lower.push(p);
        }

        let mut upper: Vec<Coord> = Vec::with_capacity(pts.len());
        for &p in pts.iter().rev() {
            while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0
            {
                upper.pop();
            }
            upper.push(p);
        }

        // Each chain ends where the other starts.
        lower.pop();
        upper.pop();
        lower.extend(upper);

        Self { vertices: lower }
    }

    pub fn of_points(points: &[Point]) -> Self {
        Self::of_coords(points.iter().map(Point::xy))
    }

    /// Hull of a polygon's outer ring. Holes never extend it.
    pub fn of_polygon(polygon: &Polygon) -> Self {
        Self::of_coords(polygon.outer.coords().iter().copied())
    }

    /// One hull enclosing every input hull.
    pub fn union<'a, I>(hulls: I) -> Self
    where
        I: IntoIterator<Item = &'a ConvexHull>,
    {
        Self::of_coords(hulls.into_iter().flat_map(|h| h.vertices.iter().copied()))
    }

    #[inline]
    pub fn vertices(&self) -> &[Coord] {
        &self.vertices
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.vertices.len() < 3
    }

    pub fn area(&self) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        let n = self.vertices.len();
        let twice: f64 = (0..n)
            .map(|i| {
                let [x0, y0] = self.vertices[i];
                let [x1, y1] = self.vertices[(i + 1) % n];
                x0 * y1 - x1 * y0
            })
            .sum();
        0.5 * twice
    }

    pub fn extent(&self) -> Option<Extent> {
        Extent::of_coords(self.vertices.iter().copied())
    }

    /// True when `(x, y)` lies inside or on the boundary, within a relative tolerance.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let p = [x, y];
        match self.vertices.len() {
            0 => false,
            1 => near(self.vertices[0], p),
            2 => on_segment(self.vertices[0], self.vertices[1], p),
            n => (0..n).all(|i| {
                let a = self.vertices[i];
                let b = self.vertices[(i + 1) % n];
                cross(a, b, p) >= -tolerance(a, b)
            }),
        }
    }

    /// Separating-axis test. Touching hulls overlap; the result is symmetric.
    pub fn overlaps(&self, other: &ConvexHull) -> bool {
        let (Some(ea), Some(eb)) = (self.extent(), other.extent()) else {
            return false;
        };
        if !ea.overlaps(&eb) {
            return false;
        }

        let mut axes = self.axes();
        axes.extend(other.axes());

        axes.iter().all(|&axis| {
            let (amin, amax) = project(&self.vertices, axis);
            let (bmin, bmax) = project(&other.vertices, axis);
            let slack = EPS * (amax.abs().max(bmax.abs()).max(1.0));
            !(amax < bmin - slack || bmax < amin - slack)
        })
    }

    /// Candidate separating axes: edge normals, plus the edge direction for
    /// a segment and both coordinate axes for a single point.
    fn axes(&self) -> Vec<Coord> {
        let v = &self.vertices;
        match v.len() {
            0 => Vec::new(),
            1 => vec![[1.0, 0.0], [0.0, 1.0]],
            2 => {
                let d = [v[1][0] - v[0][0], v[1][1] - v[0][1]];
                vec![[-d[1], d[0]], d]
            }
            n => (0..n)
                .map(|i| {
                    let a = v[i];
                    let b = v[(i + 1) % n];
                    [a[1] - b[1], b[0] - a[0]]
                })
                .collect(),
        }
    }
}

#[inline]
fn project(vertices: &[Coord], axis: Coord) -> (f64, f64) {
    vertices
        .iter()
        .map(|v| v[0] * axis[0] + v[1] * axis[1])
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| (lo.min(d), hi.max(d)))
}

#[inline]
fn tolerance(a: Coord, b: Coord) -> f64 {
    let len = (b[0] - a[0]).abs() + (b[1] - a[1]).abs();
    let scale = 1.0 + a[0].abs().max(a[1].abs()).max(b[0].abs()).max(b[1].abs());
    EPS * len * scale
}

#[inline]
fn near(a: Coord, p: Coord) -> bool {
    let scale = 1.0 + a[0].abs().max(a[1].abs());
    (a[0] - p[0]).abs() <= EPS * scale && (a[1] - p[1]).abs() <= EPS * scale
}

pub(crate) fn on_segment(a: Coord, b: Coord, p: Coord) -> bool {
    if cross(a, b, p).abs() > tolerance(a, b) {
        return false;
    }
    let e = Extent::new(a[0], a[1], b[0], b[1]);
    let pad = EPS * (1.0 + e.xmax.abs().max(e.ymax.abs()).max(e.xmin.abs()).max(e.ymin.abs()));
    p[0] >= e.xmin - pad && p[0] <= e.xmax + pad && p[1] >= e.ymin - pad && p[1] <= e.ymax + pad
}
