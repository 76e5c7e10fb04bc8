use serde::{Deserialize, Serialize};

/// Planar coordinate pair `[x, y]`; the internal representation for rings and hulls.
pub type Coord = [f64; 2];

/// One sample of the source raster: position plus the sampled value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub value: f64,
}

impl Point {
    #[inline]
    pub fn new(x: f64, y: f64, value: f64) -> Self {
        Self {
            x,
            y,
            z: None,
            value,
        }
    }

    #[inline]
    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    #[inline]
    pub fn xy(&self) -> Coord {
        [self.x, self.y]
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}
