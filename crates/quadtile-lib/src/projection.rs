//! Image <-> ground transforms and scene projections
//!
//! Every dataset has a cheap approximate transform ([`AffineProjection`],
//! built from its corner coordinates) and may have a precise one (a sensor
//! model, for example). [`GeoTransform`] combines both and rejects precise
//! answers that stray too far from the approximate ones.

use crate::utils;
use geo::{Coord, Point, Rect};
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pixel <-> lon/lat mapping for a raster
///
/// Points are `(x = longitude, y = latitude)` in degrees.
pub trait ImageProjection: Send + Sync {
    fn image_to_ground(&self, image: Coord<f64>) -> Option<Point<f64>>;
    fn ground_to_image(&self, ground: Point<f64>) -> Option<Coord<f64>>;
}

/// Affine transform spanned by the upper-left, upper-right and lower-left corners
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AffineProjection {
    width: f64,
    height: f64,
    origin: Point<f64>,
    /// Ground delta per pixel step in x
    step_x: Coord<f64>,
    /// Ground delta per pixel step in y
    step_y: Coord<f64>,
}

impl AffineProjection {
    pub fn from_corners(
        width: i64,
        height: i64,
        upper_left: Point<f64>,
        upper_right: Point<f64>,
        lower_left: Point<f64>,
    ) -> Self {
        let w = width.max(1) as f64;
        let h = height.max(1) as f64;
        Self {
            width: width as f64,
            height: height as f64,
            origin: upper_left,
            step_x: Coord {
                x: (upper_right.x() - upper_left.x()) / w,
                y: (upper_right.y() - upper_left.y()) / w,
            },
            step_y: Coord {
                x: (lower_left.x() - upper_left.x()) / h,
                y: (lower_left.y() - upper_left.y()) / h,
            },
        }
    }

    /// North-up raster covering `bounds` (min = south-west, max = north-east)
    pub fn from_bounds(width: i64, height: i64, bounds: Rect<f64>) -> Self {
        let (min, max) = (bounds.min(), bounds.max());
        Self::from_corners(
            width,
            height,
            Point::new(min.x, max.y),
            Point::new(max.x, max.y),
            Point::new(min.x, min.y),
        )
    }

    #[inline]
    pub fn project(&self, x: f64, y: f64) -> Point<f64> {
        Point::new(
            self.origin.x() + self.step_x.x * x + self.step_y.x * y,
            self.origin.y() + self.step_x.y * x + self.step_y.y * y,
        )
    }

    #[inline]
    pub fn unproject(&self, ground: Point<f64>) -> Option<Coord<f64>> {
        let det = self.step_x.x * self.step_y.y - self.step_y.x * self.step_x.y;
        if det == 0.0 || det.is_nan() {
            return None;
        }
        let dx = ground.x() - self.origin.x();
        let dy = ground.y() - self.origin.y();
        Some(Coord {
            x: (dx * self.step_y.y - self.step_y.x * dy) / det,
            y: (self.step_x.x * dy - dx * self.step_x.y) / det,
        })
    }

    /// Ground position of the four image corners: UL, UR, LR, LL
    pub fn corners(&self) -> [Point<f64>; 4] {
        [
            self.project(0.0, 0.0),
            self.project(self.width, 0.0),
            self.project(self.width, self.height),
            self.project(0.0, self.height),
        ]
    }
}

impl ImageProjection for AffineProjection {
    fn image_to_ground(&self, image: Coord<f64>) -> Option<Point<f64>> {
        Some(self.project(image.x, image.y))
    }

    fn ground_to_image(&self, ground: Point<f64>) -> Option<Coord<f64>> {
        self.unproject(ground)
    }
}

/// Approximate plus optional precise transform of one dataset
#[derive(Clone)]
pub struct GeoTransform {
    approximate: AffineProjection,
    precise: Option<Arc<dyn ImageProjection>>,
    gsd: f64,
    max_error_px: f64,
}

impl std::fmt::Debug for GeoTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTransform")
            .field("approximate", &self.approximate)
            .field("precise", &self.precise.is_some())
            .field("gsd", &self.gsd)
            .field("max_error_px", &self.max_error_px)
            .finish()
    }
}

impl GeoTransform {
    /// `tile_width`/`tile_height` set the discrepancy bound: precise answers
    /// more than a tile diagonal / 8 pixels away from the approximate ones are
    /// rejected.
    pub fn new(
        approximate: AffineProjection,
        precise: Option<Arc<dyn ImageProjection>>,
        tile_width: u32,
        tile_height: u32,
    ) -> Self {
        let [ul, ur, _, ll] = approximate.corners();
        let gsd_x = utils::haversine_distance(ul, ur) / approximate.width.max(1.0);
        let gsd_y = utils::haversine_distance(ul, ll) / approximate.height.max(1.0);
        Self {
            approximate,
            precise,
            gsd: (gsd_x + gsd_y) / 2.0,
            max_error_px: (tile_width as f64).hypot(tile_height as f64) / 8.0,
        }
    }

    #[inline]
    pub fn approximate(&self) -> &AffineProjection {
        &self.approximate
    }

    #[inline]
    pub fn has_precise(&self) -> bool {
        self.precise.is_some()
    }

    /// Nominal full resolution ground sample distance, meters per pixel
    #[inline]
    pub fn gsd(&self) -> f64 {
        self.gsd
    }

    #[inline]
    pub fn max_error_px(&self) -> f64 {
        self.max_error_px
    }

    /// Lon/lat bounds of the dataset footprint
    pub fn bounds(&self) -> Rect<f64> {
        let corners = self.approximate.corners();
        let mut min = Coord {
            x: f64::INFINITY,
            y: f64::INFINITY,
        };
        let mut max = Coord {
            x: f64::NEG_INFINITY,
            y: f64::NEG_INFINITY,
        };
        for c in corners {
            min.x = min.x.min(c.x());
            min.y = min.y.min(c.y());
            max.x = max.x.max(c.x());
            max.y = max.y.max(c.y());
        }
        Rect::new(min, max)
    }

    /// Image to ground; the flag reports whether the precise model answered
    pub fn image_to_ground(&self, image: Coord<f64>, precise: bool) -> (Point<f64>, bool) {
        let approximate = self.approximate.project(image.x, image.y);
        if !precise {
            return (approximate, false);
        }
        let Some(model) = &self.precise else {
            return (approximate, false);
        };
        match model.image_to_ground(image) {
            Some(ground) => {
                let err_px = utils::haversine_distance(ground, approximate) / self.gsd;
                if err_px.is_nan() || err_px > self.max_error_px {
                    tracing::warn!(
                        "precise image to ground discrepancy {err_px:.1}px at ({:.0}, {:.0}) exceeds {:.1}px, using approximate",
                        image.x,
                        image.y,
                        self.max_error_px
                    );
                    (approximate, false)
                } else {
                    (ground, true)
                }
            }
            None => (approximate, false),
        }
    }

    /// Ground to image; `None` when no transform answers or the precise and
    /// approximate answers disagree by more than the error bound
    pub fn ground_to_image(&self, ground: Point<f64>, precise: bool) -> Option<(Coord<f64>, bool)> {
        let approximate = self.approximate.unproject(ground)?;
        if !precise {
            return Some((approximate, false));
        }
        let Some(model) = &self.precise else {
            return Some((approximate, false));
        };
        match model.ground_to_image(ground) {
            Some(image) => {
                let err_px = (image.x - approximate.x).hypot(image.y - approximate.y);
                if err_px.is_nan() || err_px > self.max_error_px {
                    tracing::warn!(
                        "precise ground to image discrepancy {err_px:.1}px exceeds {:.1}px",
                        self.max_error_px
                    );
                    None
                } else {
                    Some((image, true))
                }
            }
            None => Some((approximate, false)),
        }
    }
}

/// Projection of the scene the tiles are drawn into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MapProjection {
    /// Plate carrée, EPSG:4326
    #[default]
    Equirectangular,
    /// Web Mercator, EPSG:3857
    WebMercator,
}

impl MapProjection {
    #[inline]
    pub fn srid(self) -> u32 {
        match self {
            MapProjection::Equirectangular => 4326,
            MapProjection::WebMercator => 3857,
        }
    }

    #[inline]
    pub fn forward(self, ground: Point<f64>) -> [f64; 3] {
        match self {
            MapProjection::Equirectangular => [ground.x(), ground.y(), 0.0],
            MapProjection::WebMercator => {
                let p = utils::wgs84_to_mercator(ground.y(), ground.x());
                [p.x(), p.y(), 0.0]
            }
        }
    }
}
