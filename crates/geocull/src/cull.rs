//! Exact containment culling against polygon records.
//!
//! Every point goes through three tiers, cheapest first: the R-tree of
//! polygon extents, the polygon's convex hull, then the ring test itself.

use crate::extent::{Extent, ExtentIndex};
use crate::hull::ConvexHull;
use crate::point::Point;
use crate::polygon::{Polygon, Ring};
use rayon::prelude::*;
use smallvec::SmallVec;

/// Inputs smaller than this are filtered on the calling thread.
const PAR_THRESHOLD: usize = 4096;

/// Shoelace signed area of a ring; positive for counter-clockwise.
pub fn signed_area(ring: &Ring) -> f64 {
    ring.signed_area()
}

/// Inside the outer ring and outside every hole.
pub fn point_in_polygon(point: &Point, polygon: &Polygon) -> bool {
    polygon.contains(point.x, point.y)
}

/// Records with negative signed area: islands and holes rather than regions.
pub fn island_select(polygons: &[Polygon]) -> Vec<Polygon> {
    polygons.iter().filter(|p| p.is_island()).cloned().collect()
}

/// Points contained in at least one polygon.
pub fn crop_to_polygons(points: &[Point], polygons: &[Polygon]) -> Vec<Point> {
    PolygonSet::new(polygons.iter().cloned()).crop(points)
}

/// Points contained in no polygon.
pub fn cull_by_polygons(points: &[Point], polygons: &[Polygon]) -> Vec<Point> {
    PolygonSet::new(polygons.iter().cloned()).cull(points)
}

/// A polygon with its cached screening results.
#[derive(Debug, Clone)]
pub struct PreparedPolygon {
    pub polygon: Polygon,
    pub extent: Extent,
    pub hull: ConvexHull,
    /// Holes that survived screening.
    holes: Vec<usize>,
}

impl PreparedPolygon {
    /// `None` when the outer ring is degenerate.
    fn prepare(polygon: Polygon) -> Option<Self> {
        if polygon.outer.is_degenerate() {
            tracing::debug!(
                polygon = %polygon.id,
                source_index = polygon.source_index,
                "Skipping degenerate ring"
            );
            return None;
        }

        let outer = &polygon.outer;
        if outer.self_intersects() {
            tracing::warn!(
                polygon = %polygon.id,
                source_index = polygon.source_index,
                vertices = outer.len(),
                "Self-intersecting outer ring; containment is best-effort"
            );
        }

        let extent = outer.extent()?;
        let hull = ConvexHull::of_polygon(&polygon);
        let holes = polygon
            .holes
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                if h.is_degenerate() {
                    tracing::debug!(polygon = %polygon.id, hole = i, "Skipping degenerate hole");
                    return None;
                }
                if h.self_intersects() {
                    tracing::warn!(
                        polygon = %polygon.id,
                        source_index = polygon.source_index,
                        hole = i,
                        vertices = h.len(),
                        "Self-intersecting hole; containment is best-effort"
                    );
                }
                Some(i)
            })
            .collect();

        Some(Self {
            polygon,
            extent,
            hull,
            holes,
        })
    }

    /// Hull tier, then the exact ring test.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.hull.contains(x, y)
            && self.polygon.outer.contains(x, y)
            && !self
                .holes
                .iter()
                .any(|&i| self.polygon.holes[i].contains(x, y))
    }
}

/// Read-only set of prepared polygons, shared across workers of a stage.
pub struct PolygonSet {
    prepared: Vec<PreparedPolygon>,
    index: ExtentIndex,
    envelope: ConvexHull,
    skipped: usize,
}

impl std::fmt::Debug for PolygonSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonSet")
            .field("polygons", &self.prepared.len())
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl PolygonSet {
    /// Screens and prepares polygons in parallel. Degenerate records are dropped.
    pub fn new<I>(polygons: I) -> Self
    where
        I: IntoIterator<Item = Polygon>,
    {
        let input: Vec<Polygon> = polygons.into_iter().collect();
        let total = input.len();

        let prepared: Vec<PreparedPolygon> = input
            .into_par_iter()
            .filter_map(PreparedPolygon::prepare)
            .collect();

        let skipped = total - prepared.len();
        if skipped > 0 {
            tracing::info!(total, skipped, "Degenerate polygons excluded from containment");
        }

        let index = ExtentIndex::new(prepared.iter().enumerate().map(|(i, p)| (i, p.extent)));
        let envelope = ConvexHull::union(prepared.iter().map(|p| &p.hull));

        Self {
            prepared,
            index,
            envelope,
            skipped,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.prepared.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
    }

    /// Number of input records dropped as degenerate.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn hulls(&self) -> Vec<ConvexHull> {
        self.prepared.iter().map(|p| p.hull.clone()).collect()
    }

    /// Union of every polygon hull.
    pub fn envelope(&self) -> &ConvexHull {
        &self.envelope
    }

    pub fn extent(&self) -> Option<Extent> {
        Extent::reduce(self.prepared.iter().map(|p| p.extent))
    }

    /// Polygons whose extent overlaps `extent`.
    pub fn candidates_for_extent(&self, extent: &Extent) -> SmallVec<[usize; 8]> {
        self.index.overlapping(extent)
    }

    /// Polygons whose hull truly overlaps `hull`.
    pub fn candidates_for_hull(&self, hull: &ConvexHull) -> Vec<usize> {
        let Some(extent) = hull.extent() else {
            return Vec::new();
        };
        self.index
            .overlapping(&extent)
            .into_iter()
            .filter(|&i| self.prepared[i].hull.overlaps(hull))
            .collect()
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.index
            .containing(x, y)
            .into_iter()
            .any(|i| self.prepared[i].contains(x, y))
    }

    /// Points inside at least one polygon extent.
    pub fn extent_prune(&self, points: &[Point]) -> Vec<Point> {
        filter_points(points, |p| self.index.any_containing(p.x, p.y))
    }

    /// Points inside the outer envelope and inside a hull that overlaps the
    /// points' own hull.
    pub fn hull_prune(&self, points: &[Point]) -> Vec<Point> {
        let own = ConvexHull::of_points(points);
        let candidates = self.candidates_for_hull(&own);
        if candidates.is_empty() {
            return Vec::new();
        }

        filter_points(points, |p| {
            self.envelope.contains(p.x, p.y)
                && candidates.iter().any(|&i| {
                    let pp = &self.prepared[i];
                    pp.extent.contains(p.x, p.y) && pp.hull.contains(p.x, p.y)
                })
        })
    }

    /// Points contained in at least one polygon.
    pub fn crop(&self, points: &[Point]) -> Vec<Point> {
        filter_points(points, |p| self.contains(p.x, p.y))
    }

    /// Points contained in no polygon.
    pub fn cull(&self, points: &[Point]) -> Vec<Point> {
        filter_points(points, |p| !self.contains(p.x, p.y))
    }
}

/// Order-preserving filter; parallel for large inputs.
fn filter_points<F>(points: &[Point], keep: F) -> Vec<Point>
where
    F: Fn(&Point) -> bool + Sync,
{
    if points.len() < PAR_THRESHOLD {
        points.iter().filter(|p| keep(p)).copied().collect()
    } else {
        points.par_iter().filter(|p| keep(p)).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Ring {
        Ring::new(vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1]])
    }

    fn unit_cloud(n: usize, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| Point::new(rng.gen::<f64>(), rng.gen::<f64>(), i as f64))
            .collect()
    }

    #[test]
    fn crop_to_inner_square() {
        let pts = unit_cloud(100, 42);
        let inner = Polygon::new("inner", 0, square(0.25, 0.25, 0.75, 0.75));

        let kept = crop_to_polygons(&pts, &[inner]);
        let expected: Vec<Point> = pts
            .iter()
            .filter(|p| (0.25..=0.75).contains(&p.x) && (0.25..=0.75).contains(&p.y))
            .copied()
            .collect();

        assert_eq!(kept, expected);
        assert!(!kept.is_empty());
    }

    #[test]
    fn crop_is_idempotent() {
        let pts = unit_cloud(5_000, 1);
        let polys = [
            Polygon::new("a", 0, Ring::new(vec![[0.1, 0.1], [0.6, 0.2], [0.3, 0.7]])),
            Polygon::new("b", 1, square(0.5, 0.5, 0.9, 0.8)),
        ];

        let once = crop_to_polygons(&pts, &polys);
        let twice = crop_to_polygons(&once, &polys);
        assert_eq!(once, twice);
    }

    #[test]
    fn cull_is_the_complement_of_crop() {
        let pts = unit_cloud(10_000, 9);
        let polys = [Polygon::new("closure", 0, square(0.0, 0.0, 0.5, 0.5))];

        let kept = crop_to_polygons(&pts, &polys);
        let culled = cull_by_polygons(&pts, &polys);

        assert_eq!(kept.len() + culled.len(), pts.len());
        assert!(culled.iter().all(|p| !(p.x < 0.5 && p.y < 0.5)));
    }

    #[test]
    fn holes_are_excluded_from_crop() {
        let region = Polygon::new("bay", 0, square(0.0, 0.0, 10.0, 10.0))
            .with_hole(square(4.0, 4.0, 6.0, 6.0).reversed());
        let in_hole = Point::new(5.0, 5.0, 1.0);
        let in_water = Point::new(1.0, 1.0, 2.0);

        assert!(!point_in_polygon(&in_hole, &region));
        assert!(point_in_polygon(&in_water, &region));
        assert_eq!(crop_to_polygons(&[in_hole, in_water], &[region]), vec![in_water]);
    }

    #[test]
    fn island_records_are_selected_by_sign() {
        let polys = vec![
            Polygon::new("water", 0, square(0.0, 0.0, 10.0, 10.0)),
            Polygon::new("isle", 1, square(2.0, 2.0, 3.0, 3.0).reversed()),
        ];
        assert!(signed_area(&polys[0].outer) > 0.0);

        let islands = island_select(&polys);
        assert_eq!(islands.len(), 1);
        assert_eq!(islands[0].id, "isle");

        let pts = [Point::new(2.5, 2.5, 0.0), Point::new(5.0, 5.0, 0.0)];
        assert_eq!(cull_by_polygons(&pts, &islands), vec![pts[1]]);
    }

    #[test]
    fn cell_centres_on_edges_are_kept() {
        let grid: Vec<Point> = (0..10)
            .flat_map(|j| (0..10).map(move |i| Point::new((i as f64 + 0.5) / 10.0, (j as f64 + 0.5) / 10.0, 0.0)))
            .collect();
        let inner = [Polygon::new("inner", 0, square(0.25, 0.25, 0.75, 0.75))];

        let kept = crop_to_polygons(&grid, &inner);
        let expected: Vec<Point> = grid
            .iter()
            .filter(|p| (0.25..=0.75).contains(&p.x) && (0.25..=0.75).contains(&p.y))
            .copied()
            .collect();
        assert_eq!(expected.len(), 36);
        assert_eq!(kept, expected);

        // Every tier agrees on edge points.
        let set = PolygonSet::new(inner.clone());
        assert_eq!(set.hull_prune(&set.extent_prune(&grid)).len(), 36);
        assert_eq!(cull_by_polygons(&grid, &inner).len(), 64);
    }

    #[test]
    fn self_intersecting_polygon_is_tested_best_effort() {
        // The last edge dips below the first one and crosses it.
        let notched = Ring::new(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [5.0, -2.0]]);
        assert!(notched.self_intersects());
        assert!(!notched.is_degenerate());

        let set = PolygonSet::new([Polygon::new("notched", 0, notched)]);
        assert_eq!((set.len(), set.skipped()), (1, 0));
        assert!(set.contains(8.0, 5.0));
        assert!(!set.contains(1.0, 5.0));
        assert_eq!(set.crop(&[Point::new(8.0, 5.0, 1.0)]).len(), 1);
    }

    #[test]
    fn degenerate_polygons_contain_nothing() {
        let set = PolygonSet::new([
            Polygon::new("line", 0, Ring::new(vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]])),
            Polygon::new("ok", 1, square(5.0, 5.0, 6.0, 6.0)),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.skipped(), 1);
        assert!(!set.contains(1.0, 1.0));
        assert!(set.contains(5.5, 5.5));
    }

    #[test]
    fn pruning_tiers_never_drop_contained_points() {
        let pts = unit_cloud(8_000, 5);
        let set = PolygonSet::new([
            Polygon::new("tri", 0, Ring::new(vec![[0.05, 0.05], [0.45, 0.1], [0.2, 0.5]])),
            Polygon::new("sq", 1, square(0.6, 0.6, 0.95, 0.9)),
        ]);

        let exact = set.crop(&pts);
        let after_extent = set.extent_prune(&pts);
        let after_hull = set.hull_prune(&after_extent);

        assert!(after_extent.len() <= pts.len());
        assert!(after_hull.len() <= after_extent.len());
        assert_eq!(set.crop(&after_hull), exact);
    }

    #[test]
    fn hull_candidates_skip_distant_polygons() {
        let set = PolygonSet::new([
            Polygon::new("near", 0, square(0.0, 0.0, 1.0, 1.0)),
            Polygon::new("far", 1, square(50.0, 50.0, 51.0, 51.0)),
        ]);
        let chunk = ConvexHull::of_coords([[0.5, 0.5], [2.0, 0.5], [2.0, 2.0]]);
        assert_eq!(set.candidates_for_hull(&chunk), vec![0]);
        assert!(set.hull_prune(&[Point::new(20.0, 20.0, 0.0)]).is_empty());
    }
}
