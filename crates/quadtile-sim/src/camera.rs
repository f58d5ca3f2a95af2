//! Scripted camera: zoom in on the raster centre, pan east, zoom back out

use geo::{Coord, Point, Rect};
use quadtile_lib::MapView;
use quadtile_lib::utils::EARTH_RADIUS_METERS;

const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

#[derive(Debug, Clone)]
pub struct Camera {
    focus: Point<f64>,
    /// Pan distance, degrees of longitude
    pan: f64,
    coarse_resolution: f64,
    fine_resolution: f64,
    frames: u64,
    frame_ms: u64,
    viewport: (u32, u32),
}

impl Camera {
    /// Script over `frames` frames between the coarsest level and full resolution
    pub fn new(
        bounds: Rect<f64>,
        gsd: f64,
        levels: u32,
        frames: u64,
        frame_ms: u64,
        viewport: (u32, u32),
    ) -> Self {
        let center = bounds.center();
        Self {
            focus: Point::new(center.x, center.y),
            pan: bounds.width() * 0.2,
            coarse_resolution: gsd * f64::from(1u32 << levels.saturating_sub(1).min(31)),
            fine_resolution: gsd,
            frames: frames.max(1),
            frame_ms,
            viewport,
        }
    }

    /// The view for `frame`; frames past the script hold the final view
    pub fn view(&self, frame: u64) -> MapView {
        let t = (frame.min(self.frames) as f64 / self.frames as f64).clamp(0.0, 1.0);
        let (zoom, pan) = if t < 0.4 {
            (t / 0.4, 0.0)
        } else if t < 0.7 {
            (1.0, (t - 0.4) / 0.3)
        } else {
            (1.0 - (t - 0.7) / 0.3, 1.0)
        };
        let resolution =
            self.coarse_resolution * (self.fine_resolution / self.coarse_resolution).powf(zoom);
        let center = Point::new(self.focus.x() + pan * self.pan, self.focus.y());

        let (width, height) = self.viewport;
        let lat_scale = center.y().to_radians().cos().max(0.01);
        let half_lng = resolution * f64::from(width) / 2.0 / (METERS_PER_DEGREE * lat_scale);
        let half_lat = resolution * f64::from(height) / 2.0 / METERS_PER_DEGREE;
        let bounds = Rect::new(
            Coord {
                x: (center.x() - half_lng).max(-180.0),
                y: (center.y() - half_lat).max(-90.0),
            },
            Coord {
                x: (center.x() + half_lng).min(180.0),
                y: (center.y() + half_lat).min(90.0),
            },
        );

        let mut view = MapView::new(bounds, resolution);
        view.draw_version = frame + 1;
        view.animation_delta_ms = self.frame_ms;
        view
    }
}
