//! Quadtile Library - Tiled Raster Level-of-Detail Engine
//!
//! This library streams very large raster datasets onto a map view. The image
//! is organised as a pyramid of fixed-size tiles and rendered through a
//! quadtree that only materialises the nodes the current view needs.
//!
//! # Architecture
//!
//! - **[`TileTree`]**: Root of one dataset's quadtree; owns the nodes, the
//!   render queue and the per-dataset transforms
//! - **[`TileSource`]**: Asynchronous producer of tile pixels
//! - **[`RenderBackend`]**: GPU-facing seam for textures, compositing and draws
//! - **[`TextureCache`]**: Byte-budgeted LRU of released textures and
//!   precise-coordinate snapshots, shareable between trees
//! - **[`VertexResolver`]**: Maps image pixels to ground coordinates for the
//!   tile meshes, approximately or precisely
//!
//! # Threading
//!
//! Tile sources may run on any thread; they report through a [`ReadSink`]
//! which posts onto the tree's queue. Everything else (node state, textures,
//! the cache) is touched only from the thread calling [`TileTree::draw`].

mod cache;
mod config;
mod event;
mod mesh;
mod node;
mod precise;
mod projection;
mod region;
mod resolve;
mod resolver;
mod source;
mod state;
mod texture;
mod traversal;
mod tree;
pub mod utils;
mod view;

// Public API exports
pub use cache::{CacheEntry, CacheKey, DEFAULT_CACHE_BUDGET_BYTES, SharedTextureCache, TextureCache};
pub use config::Options;
pub use event::EngineEvent;
pub use mesh::MeshBuffers;
pub use node::{DrawSource, NodeId, TileNode};
pub use precise::PreciseVertexResolver;
pub use projection::{AffineProjection, GeoTransform, ImageProjection, MapProjection};
pub use region::{Region, SourceRect, visible_regions};
pub use resolver::{ApproximateVertexResolver, GridVertex, NodeGrid, VertexResolver};
pub use source::{PixelRect, ReadEvent, ReadRequest, ReadSink, TileData, TileIndex, TileSource};
pub use state::{CacheHints, State, StateMask};
pub use texture::{
    CompositePart, DrawCommand, DrawTexture, OffscreenTarget, RenderBackend, Texture, TextureFormat,
    TextureId,
};
pub use tree::{FrameStats, TileTree};
pub use view::{Hemisphere, MapView};

/// Error types for the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid tile source: {0}")]
    InvalidSource(String),

    #[error("Draw must start at the root node, got {0:?}")]
    NotRoot(NodeId),

    #[error("Tile tree has been disposed")]
    Disposed,

    #[error("Render backend error: {0}")]
    Backend(String),

    #[error("Offscreen compositing unavailable: {0}")]
    Offscreen(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
