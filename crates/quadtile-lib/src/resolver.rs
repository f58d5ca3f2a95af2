//! Mesh vertex resolution
//!
//! A [`VertexResolver`] turns source pixel positions of a tile's grid into
//! geographic positions. The tree brackets every frame with
//! `begin_draw`/`end_draw` and every node whose mesh is rebuilt with
//! `begin_node`/`end_node`.

use crate::NodeId;
use crate::cache::CacheEntry;
use crate::projection::{GeoTransform, MapProjection};
use crate::region::SourceRect;
use crate::view::MapView;
use geo::{Coord, Point};
use std::sync::Arc;

/// A mesh sample point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridVertex {
    /// `(lng, lat)` in degrees
    pub value: Point<f64>,
    /// No better answer will arrive for this vertex
    pub resolved: bool,
    projected: [f64; 3],
    projected_srid: Option<u32>,
}

impl GridVertex {
    pub fn new(value: Point<f64>, resolved: bool) -> Self {
        Self {
            value,
            resolved,
            projected: [0.0; 3],
            projected_srid: None,
        }
    }

    /// Position in `projection`, cached until the projection changes
    pub fn projected(&mut self, projection: MapProjection) -> [f64; 3] {
        if self.projected_srid != Some(projection.srid()) {
            self.projected = projection.forward(self.value);
            self.projected_srid = Some(projection.srid());
        }
        self.projected
    }
}

/// Geometry of the node whose mesh is being rebuilt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeGrid {
    pub node: NodeId,
    pub level: u32,
    pub src: SourceRect,
    pub grid_width: u32,
    pub grid_height: u32,
}

pub trait VertexResolver: Send {
    fn begin_draw(&mut self, _view: &MapView) {}

    fn begin_node(&mut self, _grid: &NodeGrid) {}

    /// Ground position of source pixel `(x, y)`
    fn project(&mut self, view: &MapView, x: i64, y: i64) -> GridVertex;

    fn end_node(&mut self, _grid: &NodeGrid) {}

    fn end_draw(&mut self, _view: &MapView) {}

    /// Stop background work and persist whatever is worth keeping
    ///
    /// Returns cache entries displaced while persisting; the caller releases
    /// their textures.
    fn release(&mut self) -> Vec<CacheEntry> {
        Vec::new()
    }
}

/// Resolves vertices through the approximate dataset transform
pub struct ApproximateVertexResolver {
    transform: Arc<GeoTransform>,
}

impl ApproximateVertexResolver {
    pub fn new(transform: Arc<GeoTransform>) -> Self {
        Self { transform }
    }
}

impl VertexResolver for ApproximateVertexResolver {
    fn project(&mut self, _view: &MapView, x: i64, y: i64) -> GridVertex {
        let (ground, _) = self.transform.image_to_ground(
            Coord {
                x: x as f64,
                y: y as f64,
            },
            false,
        );
        GridVertex::new(ground, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::AffineProjection;
    use geo::Rect;

    #[test]
    fn test_projected_is_cached_per_srid() {
        let mut vertex = GridVertex::new(Point::new(10.0, 20.0), true);
        assert_eq!(
            vertex.projected(MapProjection::Equirectangular),
            [10.0, 20.0, 0.0]
        );
        let mercator = vertex.projected(MapProjection::WebMercator);
        assert!(mercator[0] > 1_000_000.0);
        assert_eq!(
            vertex.projected(MapProjection::Equirectangular),
            [10.0, 20.0, 0.0]
        );
    }

    #[test]
    fn test_approximate_resolver() {
        let approx = AffineProjection::from_bounds(
            1024,
            1024,
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
        );
        let transform = Arc::new(GeoTransform::new(approx, None, 256, 256));
        let mut resolver = ApproximateVertexResolver::new(transform);
        let view = MapView::new(
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
            10.0,
        );
        let vertex = resolver.project(&view, 512, 512);
        assert!(vertex.resolved);
        assert!((vertex.value.x() - 0.5).abs() < 1e-12);
        assert!((vertex.value.y() - 0.5).abs() < 1e-12);
    }
}
