//! Per-frame view state supplied by the host renderer

use crate::projection::MapProjection;
use geo::{Point, Rect};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Side of the antimeridian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Hemisphere {
    East,
    West,
}

impl Hemisphere {
    #[inline]
    pub fn of_longitude(lng: f64) -> Self {
        if lng >= 0.0 {
            Hemisphere::East
        } else {
            Hemisphere::West
        }
    }
}

/// What the camera sees this frame
///
/// Bounds are in degrees. A view crossing the antimeridian has
/// `west > east` (e.g. west = 170, east = -170).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MapView {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
    /// Focus point of the camera, `(lng, lat)`
    pub center: Point<f64>,
    /// Nominal map resolution, meters per pixel
    pub resolution: f64,
    pub projection: MapProjection,
    /// Incremented once per rendered frame
    pub draw_version: u64,
    /// Time since the previous frame, milliseconds
    pub animation_delta_ms: u64,
    /// Hit-testing pass; no refinement work is scheduled
    pub targeting: bool,
    /// Camera tilt in degrees; distant tiles get coarser resolution estimates
    pub tilt: f64,
}

impl MapView {
    /// A north-up view of `bounds` centered on the bounds' center
    pub fn new(bounds: Rect<f64>, resolution: f64) -> Self {
        let center = bounds.center();
        Self {
            west: bounds.min().x,
            south: bounds.min().y,
            east: bounds.max().x,
            north: bounds.max().y,
            center: Point::new(center.x, center.y),
            resolution,
            projection: MapProjection::default(),
            draw_version: 0,
            animation_delta_ms: 0,
            targeting: false,
            tilt: 0.0,
        }
    }

    #[inline]
    pub fn crosses_idl(&self) -> bool {
        self.west > self.east
    }

    #[inline]
    pub fn primary_hemisphere(&self) -> Hemisphere {
        Hemisphere::of_longitude(self.center.x())
    }

    /// Advance to the next frame
    pub fn next_frame(&mut self, animation_delta_ms: u64) {
        self.draw_version += 1;
        self.animation_delta_ms = animation_delta_ms;
    }

    /// Expected rendered resolution of a region, meters per pixel
    ///
    /// Without tilt the whole view shares one resolution. With tilt, regions
    /// further from the focus point are estimated coarser.
    pub fn estimate_resolution(&self, bounds: &Rect<f64>) -> f64 {
        if self.tilt <= 0.0 {
            return self.resolution;
        }
        let half_height = ((self.north - self.south) / 2.0).abs().max(f64::EPSILON);
        let center = bounds.center();
        let dist = (center.x - self.center.x()).hypot(center.y - self.center.y());
        let factor = 1.0 + self.tilt.min(85.0).to_radians().tan() * (dist / half_height);
        self.resolution * factor
    }
}
