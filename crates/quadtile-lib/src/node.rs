//! Quadtree node data
//!
//! Nodes live in the tree's [`SlotMap`](slotmap::SlotMap) and refer to
//! each other by [`NodeId`]. All mutation happens through
//! [`TileTree`](crate::TileTree) on the render thread; this module only holds
//! the per-node data and read-only accessors.

use crate::mesh::MeshBuffers;
use crate::region::SourceRect;
use crate::resolver::GridVertex;
use crate::source::{ReadRequest, TileIndex};
use crate::state::State;
use crate::texture::{Texture, TextureFormat};
use crate::view::Hemisphere;
use geo::{Coord, Point, Rect};
use smallvec::SmallVec;
use std::time::Instant;

slotmap::new_key_type! {
    /// Generation-checked handle of a node; ids of released nodes stop resolving
    pub struct NodeId;
}

/// What a node showed the last time it was drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawSource {
    /// Its own texture (complete or partially updated)
    Texture,
    /// A cropped view of an ancestor's texture
    Borrowed { from: NodeId },
    /// The backend's generic loading image
    Placeholder,
}

/// One tile of the quadtree
#[derive(Debug)]
pub struct TileNode {
    pub(crate) index: TileIndex,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: [Option<NodeId>; 4],
    pub(crate) state: State,

    pub(crate) texture: Option<Texture>,
    pub(crate) format: TextureFormat,
    pub(crate) mesh: Option<MeshBuffers>,
    pub(crate) grid_width: u32,
    pub(crate) grid_height: u32,
    pub(crate) grid_vertices: Vec<Option<GridVertex>>,
    pub(crate) tex_coords_valid: bool,
    pub(crate) vertex_coords_valid: bool,
    pub(crate) vertex_srid: Option<u32>,
    /// Set when new precise vertices arrived; children inherit it during descent
    pub(crate) vertices_invalid: bool,
    pub(crate) loading_tex_coords: Vec<[f32; 2]>,
    pub(crate) loading_vert_count: usize,

    /// Unscaled source rectangle covered by the tile
    pub(crate) src: SourceRect,
    /// Pixel size of the tile at its own level
    pub(crate) tile_width: u32,
    pub(crate) tile_height: u32,
    pub(crate) bounds: Rect<f64>,
    pub(crate) centroid: Point<f64>,
    pub(crate) centroid_proj: [f64; 3],
    pub(crate) centroid_proj_hemi2: [f64; 3],
    pub(crate) primary_hemi: Option<Hemisphere>,

    pub(crate) borrowers: SmallVec<[NodeId; 4]>,
    pub(crate) lend_from: Option<NodeId>,
    pub(crate) should_borrow: bool,
    pub(crate) received_update: bool,
    pub(crate) derived_unresolvable_data: bool,

    pub(crate) request: Option<ReadRequest>,
    pub(crate) read_started: Option<Instant>,
    pub(crate) read_elapsed_ms: u64,
    pub(crate) fade_timer_ms: u64,
    pub(crate) tile_version: Option<u64>,
    /// Forces a re-read on the next draw regardless of the version
    pub(crate) stale: bool,
    pub(crate) touched: bool,
    pub(crate) last_touch: Option<u64>,
    pub(crate) is_overdraw: bool,
    pub(crate) draw_source: Option<DrawSource>,
}

impl TileNode {
    /// A node with no geometry yet; the tree lays it out right after insertion
    pub(crate) fn new(parent: Option<NodeId>, index: TileIndex) -> Self {
        let origin = Coord { x: 0.0, y: 0.0 };
        Self {
            index,
            parent,
            children: [None; 4],
            state: State::Unresolved,
            texture: None,
            format: TextureFormat::default(),
            mesh: None,
            grid_width: 1,
            grid_height: 1,
            grid_vertices: Vec::new(),
            tex_coords_valid: false,
            vertex_coords_valid: false,
            vertex_srid: None,
            vertices_invalid: false,
            loading_tex_coords: Vec::new(),
            loading_vert_count: 0,
            src: SourceRect::default(),
            tile_width: 0,
            tile_height: 0,
            bounds: Rect::new(origin, origin),
            centroid: Point::from(origin),
            centroid_proj: [0.0; 3],
            centroid_proj_hemi2: [0.0; 3],
            primary_hemi: None,
            borrowers: SmallVec::new(),
            lend_from: None,
            should_borrow: false,
            received_update: false,
            derived_unresolvable_data: false,
            request: None,
            read_started: None,
            read_elapsed_ms: 0,
            fade_timer_ms: 0,
            tile_version: None,
            stale: false,
            touched: false,
            last_touch: None,
            is_overdraw: false,
            draw_source: None,
        }
    }

    #[inline]
    pub fn index(&self) -> TileIndex {
        self.index
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.index.level
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Child slots: 0 upper-left, 1 upper-right, 2 lower-left, 3 lower-right
    #[inline]
    pub fn children(&self) -> [Option<NodeId>; 4] {
        self.children
    }

    #[inline]
    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    #[inline]
    pub fn mesh(&self) -> Option<&MeshBuffers> {
        self.mesh.as_ref()
    }

    /// Mesh subdivisions `(width, height)`
    #[inline]
    pub fn grid_size(&self) -> (u32, u32) {
        (self.grid_width, self.grid_height)
    }

    #[inline]
    pub fn source_rect(&self) -> SourceRect {
        self.src
    }

    #[inline]
    pub fn tile_size(&self) -> (u32, u32) {
        (self.tile_width, self.tile_height)
    }

    /// Geographic footprint, `(lng, lat)` degrees
    #[inline]
    pub fn bounds(&self) -> Rect<f64> {
        self.bounds
    }

    #[inline]
    pub fn centroid(&self) -> Point<f64> {
        self.centroid
    }

    /// Nodes currently displaying part of this node's texture
    #[inline]
    pub fn borrowers(&self) -> &[NodeId] {
        &self.borrowers
    }

    /// The ancestor this node is borrowing from
    #[inline]
    pub fn lend_from(&self) -> Option<NodeId> {
        self.lend_from
    }

    #[inline]
    pub fn received_update(&self) -> bool {
        self.received_update
    }

    /// Whether a read is in flight
    #[inline]
    pub fn is_reading(&self) -> bool {
        self.request.is_some()
    }

    #[inline]
    pub fn tile_version(&self) -> Option<u64> {
        self.tile_version
    }

    /// Remaining fade-in time, milliseconds
    #[inline]
    pub fn fade_timer_ms(&self) -> u64 {
        self.fade_timer_ms
    }

    /// Texture coordinates used for the borrowed or placeholder texture
    #[inline]
    pub fn loading_tex_coords(&self) -> &[[f32; 2]] {
        &self.loading_tex_coords
    }

    #[inline]
    pub fn draw_source(&self) -> Option<DrawSource> {
        self.draw_source
    }

    /// Holds complete or partial pixels of its own
    #[inline]
    pub(crate) fn has_data(&self) -> bool {
        self.state == State::Resolved || self.received_update
    }

    /// Position of child slot `idx` inside this tile: `(column, row)` offsets
    #[inline]
    pub(crate) fn quadrant(idx: usize) -> (u32, u32) {
        ((idx % 2) as u32, (idx / 2) as u32)
    }
}
