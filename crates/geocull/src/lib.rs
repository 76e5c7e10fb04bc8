//! Geometry for reducing point clouds to a region of interest.
//!
//! Screening runs in three tiers of increasing cost:
//!
//! 1. [`Extent`] overlap, backed by an R-tree in [`ExtentIndex`],
//! 2. [`ConvexHull`] containment and overlap,
//! 3. exact ring containment through [`PolygonSet`].
//!
//! The first two only ever discard candidates; the third decides.

pub mod cull;
pub mod extent;
pub mod hull;
pub mod point;
pub mod polygon;

pub use cull::{
    crop_to_polygons, cull_by_polygons, island_select, point_in_polygon, signed_area,
    PolygonSet, PreparedPolygon,
};
pub use extent::{Extent, ExtentIndex};
pub use hull::ConvexHull;
pub use point::{Coord, Point};
pub use polygon::{AttrFilter, Polygon, Ring};
