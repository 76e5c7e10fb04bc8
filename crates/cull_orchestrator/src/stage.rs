//! Pipeline stages and the per-chunk reductions they apply.

use crate::config::{ConstraintMode, PipelinePlan};
use geocull::{Extent, Point, PolygonSet};
use std::fmt;
use std::sync::Arc;

/// Names constraint stages may not take.
pub const RESERVED_STAGE_NAMES: &[&str] = &["raw", "extent", "hull", "exact", "final", "region"];

pub const RAW_STAGE: &str = "raw";
pub const FINAL_STAGE: &str = "final";

/// Stage artifacts holding the region geometry.
pub const REGION_SHAPES_STAGE: &str = "region";
pub const REGION_HULLS_STAGE: &str = "hull";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    RawLoaded,
    ExtentPruned,
    HullPruned,
    ExactCulled,
    /// One configured exclusion, e.g. closures or islands.
    Constraint { index: usize, name: String, mode: ConstraintMode },
    /// Compaction of the last stage's survivors into budget-sized parts.
    Final,
}

impl Stage {
    /// Key segment for the stage's chunks.
    pub fn name(&self) -> &str {
        match self {
            Stage::RawLoaded => RAW_STAGE,
            Stage::ExtentPruned => "extent",
            Stage::HullPruned => "hull",
            Stage::ExactCulled => "exact",
            Stage::Constraint { name, .. } => name,
            Stage::Final => FINAL_STAGE,
        }
    }

    /// Every stage of `plan`, in execution order.
    pub fn sequence(plan: &PipelinePlan) -> Vec<Stage> {
        let mut stages = vec![
            Stage::RawLoaded,
            Stage::ExtentPruned,
            Stage::HullPruned,
            Stage::ExactCulled,
        ];
        stages.extend(plan.constraints.iter().enumerate().map(|(index, c)| Stage::Constraint {
            index,
            name: c.name.clone(),
            mode: c.mode,
        }));
        stages.push(Stage::Final);
        stages
    }

    pub fn names(plan: &PipelinePlan) -> Vec<String> {
        Self::sequence(plan)
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The pure reduction a per-chunk stage applies. Polygon data is shared read-only.
#[derive(Debug, Clone)]
pub enum Kernel {
    /// Keep points inside some region extent.
    ExtentPrune(Arc<PolygonSet>),
    /// Keep points inside the region envelope and a candidate polygon hull.
    HullPrune(Arc<PolygonSet>),
    /// Keep points inside some region polygon.
    Crop(Arc<PolygonSet>),
    /// Drop points inside any polygon of the set.
    Cull(Arc<PolygonSet>),
}

impl Kernel {
    pub fn apply(&self, points: &[Point]) -> Vec<Point> {
        match self {
            Kernel::ExtentPrune(region) => {
                // Whole-chunk rejection before any per-point work.
                let Some(chunk) = Extent::of_points(points) else {
                    return Vec::new();
                };
                if region.candidates_for_extent(&chunk).is_empty() {
                    return Vec::new();
                }
                region.extent_prune(points)
            }
            Kernel::HullPrune(region) => region.hull_prune(points),
            Kernel::Crop(region) => region.crop(points),
            Kernel::Cull(shapes) => {
                if shapes.is_empty() {
                    return points.to_vec();
                }
                shapes.cull(points)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstraintSpec, RegionSpec};
    use geocull::{Polygon, Ring};

    fn plan() -> PipelinePlan {
        PipelinePlan {
            dataset: "gom".into(),
            region: RegionSpec {
                path: "water.geojson".into(),
                filter: None,
                id_property: None,
            },
            constraints: vec![
                ConstraintSpec {
                    name: "closures".into(),
                    mode: ConstraintMode::Cull,
                    path: Some("closures.geojson".into()),
                    filter: None,
                },
                ConstraintSpec {
                    name: "islands".into(),
                    mode: ConstraintMode::Islands,
                    path: None,
                    filter: None,
                },
            ],
        }
    }

    #[test]
    fn stage_order() {
        assert_eq!(
            Stage::names(&plan()),
            vec!["raw", "extent", "hull", "exact", "closures", "islands", "final"]
        );
    }

    #[test]
    fn kernels_narrow_monotonically() {
        let region = Arc::new(PolygonSet::new([Polygon::new(
            "tri",
            0,
            Ring::new(vec![[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]]),
        )]));
        let pts: Vec<Point> = (0..25)
            .map(|i| Point::new((i % 5) as f64 * 1.1, (i / 5) as f64 * 1.1, i as f64))
            .collect();

        let a = Kernel::ExtentPrune(region.clone()).apply(&pts);
        let b = Kernel::HullPrune(region.clone()).apply(&a);
        let c = Kernel::Crop(region.clone()).apply(&b);

        assert!(a.len() < pts.len());
        assert!(c.len() <= b.len() && b.len() <= a.len());
        assert!(c.iter().all(|p| p.x + p.y <= 4.0));
        assert_eq!(c, Kernel::Crop(region).apply(&pts));
    }

    #[test]
    fn disjoint_chunk_is_rejected_whole() {
        let region = Arc::new(PolygonSet::new([Polygon::new(
            "sq",
            0,
            Ring::new(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]),
        )]));
        let far = [Point::new(5.0, 5.0, 0.0), Point::new(6.0, 6.0, 0.0)];
        assert!(Kernel::ExtentPrune(region).apply(&far).is_empty());
        assert_eq!(Kernel::Cull(Arc::new(PolygonSet::new([]))).apply(&far).len(), 2);
    }
}
