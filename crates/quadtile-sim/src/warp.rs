//! Stand-in for a sensor model: the affine footprint plus a smooth warp

use geo::{Coord, Point};
use quadtile_lib::{AffineProjection, ImageProjection};
use std::f64::consts::TAU;

#[derive(Debug, Clone, Copy)]
pub struct WarpedProjection {
    affine: AffineProjection,
    amplitude: f64,
    width: f64,
    height: f64,
}

impl WarpedProjection {
    pub fn new(affine: AffineProjection, width: i64, height: i64, amplitude_px: f64) -> Self {
        Self {
            affine,
            amplitude: amplitude_px,
            width: width.max(1) as f64,
            height: height.max(1) as f64,
        }
    }

    /// Pixel offset applied at `image`
    fn offset(&self, image: Coord<f64>) -> Coord<f64> {
        Coord {
            x: self.amplitude * (TAU * image.y / self.height).sin(),
            y: self.amplitude * (TAU * image.x / self.width).cos(),
        }
    }
}

impl ImageProjection for WarpedProjection {
    fn image_to_ground(&self, image: Coord<f64>) -> Option<Point<f64>> {
        let offset = self.offset(image);
        let ground = self.affine.project(image.x + offset.x, image.y + offset.y);
        (ground.x().is_finite() && ground.y().is_finite()).then_some(ground)
    }

    fn ground_to_image(&self, ground: Point<f64>) -> Option<Coord<f64>> {
        let target = self.affine.unproject(ground)?;
        // the warp is small and smooth; fixed-point iteration converges fast
        let mut image = target;
        for _ in 0..8 {
            let offset = self.offset(image);
            image = Coord {
                x: target.x - offset.x,
                y: target.y - offset.y,
            };
        }
        Some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Rect;

    #[test]
    fn test_round_trip_within_a_pixel() {
        let affine = AffineProjection::from_bounds(
            4096,
            4096,
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
        );
        let warp = WarpedProjection::new(affine, 4096, 4096, 2.0);
        let image = Coord { x: 1000.0, y: 3000.0 };
        let ground = warp.image_to_ground(image).unwrap();
        let back = warp.ground_to_image(ground).unwrap();
        assert!((back.x - image.x).abs() < 0.01);
        assert!((back.y - image.y).abs() < 0.01);

        // never further than the amplitude from the affine footprint
        let straight = affine.project(image.x, image.y);
        let warped_px = affine.unproject(ground).unwrap();
        let straight_px = affine.unproject(straight).unwrap();
        assert!((warped_px.x - straight_px.x).hypot(warped_px.y - straight_px.y) <= 2.0 * 2f64.sqrt() + 1e-9);
    }
}
