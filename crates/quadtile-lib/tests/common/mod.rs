//! Shared fixtures: a manually answered tile source and a recording backend

#![allow(dead_code)]

use geo::{Coord, Rect};
use quadtile_lib::{
    AffineProjection, CompositePart, DrawCommand, DrawTexture, EngineError, GeoTransform,
    MapView, OffscreenTarget, Options, PixelRect, ReadRequest, ReadSink, RenderBackend, Result,
    SharedTextureCache, Texture, TextureFormat, TextureId, TileData, TileIndex, TileSource,
    TileTree,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// 1024x1024 pixels, 256 pixel tiles, three levels over a one degree square
pub struct MockSource {
    versions: Mutex<HashMap<TileIndex, u64>>,
    reads: Mutex<Vec<(ReadRequest, ReadSink)>>,
    pub multi_resolution: bool,
}

impl Default for MockSource {
    fn default() -> Self {
        Self {
            versions: Mutex::new(HashMap::new()),
            reads: Mutex::new(Vec::new()),
            multi_resolution: true,
        }
    }
}

impl TileSource for MockSource {
    fn uri(&self) -> &str {
        "mock://pyramid"
    }
    fn width(&self) -> i64 {
        1024
    }
    fn height(&self) -> i64 {
        1024
    }
    fn tile_width(&self) -> u32 {
        256
    }
    fn tile_height(&self) -> u32 {
        256
    }
    fn num_levels(&self) -> u32 {
        3
    }
    fn is_multi_resolution(&self) -> bool {
        self.multi_resolution
    }
    fn tile_version(&self, tile: TileIndex) -> u64 {
        self.versions.lock().unwrap().get(&tile).copied().unwrap_or(0)
    }
    fn async_read(&self, request: ReadRequest, sink: ReadSink) {
        self.reads.lock().unwrap().push((request, sink));
    }
}

impl MockSource {
    pub fn bump_version(&self, tile: TileIndex) {
        *self.versions.lock().unwrap().entry(tile).or_insert(0) += 1;
    }

    /// Tiles with a read waiting for an answer
    pub fn pending(&self) -> Vec<TileIndex> {
        self.reads.lock().unwrap().iter().map(|(r, _)| r.tile).collect()
    }

    /// Take the outstanding reads without answering them
    pub fn take_reads(&self) -> Vec<(ReadRequest, ReadSink)> {
        self.reads.lock().unwrap().drain(..).collect()
    }

    /// Deliver one full update plus completion for every outstanding read
    pub fn answer_all(&self) -> Vec<TileIndex> {
        self.take_reads()
            .into_iter()
            .map(|(request, sink)| {
                answer(&sink);
                request.tile
            })
            .collect()
    }

    pub fn fail_all(&self, cause: &str) -> Vec<TileIndex> {
        self.take_reads()
            .into_iter()
            .map(|(request, sink)| {
                sink.error(cause);
                request.tile
            })
            .collect()
    }
}

pub fn answer(sink: &ReadSink) {
    let data = TileData {
        width: 256,
        height: 256,
        format: TextureFormat::Rgba8,
        pixels: Arc::from(vec![0u8; 256 * 256 * 4]),
    };
    sink.update(data, PixelRect::new(0, 0, 256, 256));
    sink.completed();
}

#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub tile: TileIndex,
    /// `None` for the placeholder
    pub texture: Option<TextureId>,
}

/// Hands out texture ids and records every call
#[derive(Debug, Default)]
pub struct Backend {
    next_id: u64,
    pub live: HashSet<TextureId>,
    pub uploads: usize,
    pub composites: usize,
    pub offscreen_live: usize,
    pub fail_offscreen: bool,
    pub fail_composite: bool,
    pub draws: Vec<Draw>,
}

impl RenderBackend for Backend {
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
        self.next_id += 1;
        let id = TextureId(self.next_id);
        self.live.insert(id);
        Ok(Texture {
            id,
            width,
            height,
            format,
        })
    }

    fn upload(&mut self, _texture: &Texture, _dst: PixelRect, _data: &TileData) -> Result<()> {
        self.uploads += 1;
        Ok(())
    }

    fn release_texture(&mut self, texture: Texture) {
        assert!(self.live.remove(&texture.id), "double release of {:?}", texture.id);
    }

    fn create_offscreen_target(&mut self) -> Result<OffscreenTarget> {
        if self.fail_offscreen {
            return Err(EngineError::Offscreen("framebuffer incomplete".into()));
        }
        self.offscreen_live += 1;
        Ok(OffscreenTarget(7))
    }

    fn release_offscreen_target(&mut self, _target: OffscreenTarget) {
        self.offscreen_live -= 1;
    }

    fn composite(
        &mut self,
        _target: OffscreenTarget,
        _dst: &Texture,
        parts: &[CompositePart<'_>],
    ) -> Result<()> {
        if self.fail_composite {
            return Err(EngineError::Backend("copy failed".into()));
        }
        assert!(parts.len() <= 4);
        self.composites += 1;
        Ok(())
    }

    fn draw(&mut self, command: &DrawCommand<'_>) {
        assert_eq!(command.tex_coords.len(), command.vertices.len());
        self.draws.push(Draw {
            tile: command.tile,
            texture: match command.texture {
                DrawTexture::Tile(texture) => Some(texture.id),
                DrawTexture::Placeholder => None,
            },
        });
    }
}

pub fn unit_square() -> Rect<f64> {
    Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 })
}

pub fn tree_with(
    source: Arc<MockSource>,
    options: Options,
    cache: Option<SharedTextureCache>,
) -> TileTree {
    let transform = GeoTransform::new(
        AffineProjection::from_bounds(1024, 1024, unit_square()),
        None,
        256,
        256,
    );
    TileTree::new(source, transform, options, cache).unwrap()
}

/// A view of the whole dataset that selects `level`
pub fn view_at_level(tree: &TileTree, level: u32, draw_version: u64) -> MapView {
    let mut view = MapView::new(unit_square(), tree.transform().gsd() * f64::from(1u32 << level));
    view.draw_version = draw_version;
    view.animation_delta_ms = 16;
    view
}
