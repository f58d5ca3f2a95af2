//! Visible source regions
//!
//! The view is intersected with the dataset footprint and mapped into
//! unscaled source pixel space. A view spanning the antimeridian yields up to
//! two regions, eastern hemisphere first.

use crate::projection::GeoTransform;
use crate::view::{Hemisphere, MapView};
use geo::Point;
use smallvec::SmallVec;

/// Rectangle in unscaled (full resolution) source pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRect {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl SourceRect {
    pub const fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn right(&self) -> i64 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y + self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Edges inclusive
    #[inline]
    pub fn contains(&self, px: i64, py: i64) -> bool {
        px >= self.x && px <= self.right() && py >= self.y && py <= self.bottom()
    }
}

/// One region to traverse this frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub rect: SourceRect,
    pub hemisphere: Hemisphere,
    /// Camera focus in source pixels, used to order child traversal
    pub poi: Option<(i64, i64)>,
}

/// Regions of the `width` x `height` raster visible in `view`
pub fn visible_regions(
    view: &MapView,
    transform: &GeoTransform,
    width: i64,
    height: i64,
) -> SmallVec<[Region; 2]> {
    let mut spans: SmallVec<[(f64, f64, Hemisphere); 2]> = SmallVec::new();
    if view.crosses_idl() {
        spans.push((view.west, 180.0, Hemisphere::East));
        spans.push((-180.0, view.east, Hemisphere::West));
    } else {
        spans.push((
            view.west,
            view.east,
            Hemisphere::of_longitude((view.west + view.east) / 2.0),
        ));
    }

    let bounds = transform.bounds();
    let mut regions: SmallVec<[Region; 2]> = SmallVec::new();
    for (west, east, hemisphere) in spans {
        let min_lng = bounds.min().x.max(west);
        let max_lng = bounds.max().x.min(east);
        let min_lat = bounds.min().y.max(view.south);
        let max_lat = bounds.max().y.min(view.north);
        if !(min_lng < max_lng && min_lat < max_lat) {
            continue;
        }

        let corners = [
            Point::new(min_lng, max_lat),
            Point::new(max_lng, max_lat),
            Point::new(max_lng, min_lat),
            Point::new(min_lng, min_lat),
        ];
        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        let mut projected = true;
        for corner in corners {
            match transform.ground_to_image(corner, false) {
                Some((image, _)) => {
                    min_x = min_x.min(image.x);
                    min_y = min_y.min(image.y);
                    max_x = max_x.max(image.x);
                    max_y = max_y.max(image.y);
                }
                None => {
                    projected = false;
                    break;
                }
            }
        }
        if !projected {
            continue;
        }

        // one pixel of slack on every side, clamped to the raster
        let min_x = (min_x - 1.0).clamp(0.0, width as f64);
        let min_y = (min_y - 1.0).clamp(0.0, height as f64);
        let max_x = (max_x + 1.0).clamp(0.0, width as f64);
        let max_y = (max_y + 1.0).clamp(0.0, height as f64);

        let x = min_x.floor() as i64;
        let y = min_y.floor() as i64;
        let rect = SourceRect::new(x, y, max_x.ceil() as i64 - x, max_y.ceil() as i64 - y);
        if rect.is_empty() {
            continue;
        }
        regions.push(Region {
            rect,
            hemisphere,
            poi: None,
        });
    }

    let count = regions.len();
    for (i, region) in regions.iter_mut().enumerate() {
        let mut lng = view.center.x();
        if i == 0 && view.crosses_idl() && count > 1 && lng < 0.0 {
            lng += 360.0;
        } else if i > 0 && lng > 0.0 {
            lng -= 360.0;
        }
        region.poi = transform
            .ground_to_image(Point::new(lng, view.center.y()), false)
            .map(|(image, _)| (image.x as i64, image.y as i64));
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::AffineProjection;
    use geo::{Coord, Rect};

    /// Power-of-two pixel steps keep the arithmetic exact
    fn transform(west: f64, south: f64, east: f64, north: f64, width: i64, height: i64) -> GeoTransform {
        let approx = AffineProjection::from_bounds(
            width,
            height,
            Rect::new(Coord { x: west, y: south }, Coord { x: east, y: north }),
        );
        GeoTransform::new(approx, None, 256, 256)
    }

    fn view(west: f64, south: f64, east: f64, north: f64) -> MapView {
        MapView::new(
            Rect::new(Coord { x: west, y: south }, Coord { x: east, y: north }),
            100.0,
        )
    }

    #[test]
    fn test_source_rect() {
        let r = SourceRect::new(10, 20, 30, 40);
        assert_eq!(r.right(), 40);
        assert_eq!(r.bottom(), 60);
        assert!(r.contains(10, 20));
        assert!(r.contains(40, 60));
        assert!(!r.contains(41, 20));
        assert!(SourceRect::new(0, 0, 0, 5).is_empty());
    }

    #[test]
    fn test_single_region_inside_dataset() {
        // 64 px per degree east-west, 32 px per degree north-south
        let t = transform(0.0, -32.0, 64.0, 32.0, 4096, 2048);
        let regions = visible_regions(&view(16.0, -8.0, 32.0, 8.0), &t, 4096, 2048);
        assert_eq!(regions.len(), 1);
        let rect = regions[0].rect;
        assert_eq!(rect.x, 1023);
        assert_eq!(rect.right(), 2049);
        assert_eq!(rect.y, 767);
        assert_eq!(rect.bottom(), 1281);
        assert_eq!(regions[0].hemisphere, Hemisphere::East);
        assert_eq!(regions[0].poi, Some((1536, 1024)));
    }

    #[test]
    fn test_view_clamped_to_raster() {
        let t = transform(0.0, -32.0, 64.0, 32.0, 4096, 2048);
        let regions = visible_regions(&view(-50.0, -80.0, 100.0, 80.0), &t, 4096, 2048);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].rect, SourceRect::new(0, 0, 4096, 2048));
    }

    #[test]
    fn test_disjoint_view_has_no_regions() {
        let t = transform(0.0, -32.0, 64.0, 32.0, 4096, 2048);
        assert!(visible_regions(&view(70.0, -5.0, 80.0, 5.0), &t, 4096, 2048).is_empty());
    }

    #[test]
    fn test_antimeridian_split() {
        // Whole world at 16 px per degree
        let t = transform(-180.0, -90.0, 180.0, 90.0, 5760, 2880);
        let mut v = view(-10.0, -5.0, 10.0, 5.0);
        v.west = 170.0;
        v.east = -170.0;
        v.center = Point::new(175.0, 0.0);
        let regions = visible_regions(&v, &t, 5760, 2880);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].hemisphere, Hemisphere::East);
        assert_eq!(regions[1].hemisphere, Hemisphere::West);
        // East region hugs the right edge, west region the left edge
        assert_eq!(regions[0].rect.x, 350 * 16 - 1);
        assert_eq!(regions[0].rect.right(), 5760);
        assert_eq!(regions[1].rect.x, 0);
        assert_eq!(regions[1].rect.right(), 10 * 16 + 1);
        // Focus is east of the line; the west region sees it wrapped off raster
        assert_eq!(regions[0].poi, Some((355 * 16, 90 * 16)));
        let (wx, _) = regions[1].poi.unwrap();
        assert!(wx < 0);
    }
}
