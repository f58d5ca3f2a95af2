//! Tile source contract
//!
//! A [`TileSource`] delivers tile pixels asynchronously. Each read request is
//! answered through a [`ReadSink`] with a stream of [`ReadEvent`]s:
//! `Created`, `Started`, zero or more `Update`s, then exactly one of
//! `Completed`, `Canceled` or `Error`. The sink forwards events onto the
//! tree's render queue; sources never touch node state directly.

use crate::NodeId;
use crate::event::{EngineEvent, EventSender};
use crate::texture::TextureFormat;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Address of a tile: `level` 0 is full resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TileIndex {
    pub level: u32,
    pub column: i64,
    pub row: i64,
}

impl TileIndex {
    pub const fn new(level: u32, column: i64, row: i64) -> Self {
        Self { level, column, row }
    }

    /// Child `idx` (0 UL, 1 UR, 2 LL, 3 LR) one level finer
    ///
    /// Returns `None` at full resolution.
    #[inline]
    pub fn child(self, idx: usize) -> Option<TileIndex> {
        let level = self.level.checked_sub(1)?;
        Some(TileIndex {
            level,
            column: self.column * 2 + (idx % 2) as i64,
            row: self.row * 2 + (idx / 2) as i64,
        })
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.column, self.row)
    }
}

/// Axis-aligned pixel rectangle inside a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Decoded pixels for (part of) a tile
#[derive(Clone, PartialEq)]
pub struct TileData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub pixels: Arc<[u8]>,
}

impl fmt::Debug for TileData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileData")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// One event of a read request's lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    Created,
    Started,
    /// Pixels for the `dst` sub-rectangle of the tile
    Update { data: TileData, dst: PixelRect },
    Completed,
    Canceled,
    Error(String),
}

/// An in-flight read, shared between the node and the source
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub id: u64,
    pub tile: TileIndex,
    canceled: Arc<AtomicBool>,
}

impl ReadRequest {
    pub(crate) fn new(id: u64, tile: TileIndex) -> Self {
        Self {
            id,
            tile,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sources should check this before and during expensive work
    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// Delivers [`ReadEvent`]s for one request to the owning tree
#[derive(Clone)]
pub struct ReadSink {
    node: NodeId,
    request: u64,
    tx: EventSender,
}

impl ReadSink {
    pub(crate) fn new(node: NodeId, request: u64, tx: EventSender) -> Self {
        Self { node, request, tx }
    }

    /// Post an event; returns `false` once the tree is gone
    pub fn send(&self, event: ReadEvent) -> bool {
        self.tx
            .send(EngineEvent::Read {
                node: self.node,
                request: self.request,
                event,
            })
            .is_ok()
    }

    pub fn update(&self, data: TileData, dst: PixelRect) -> bool {
        self.send(ReadEvent::Update { data, dst })
    }

    pub fn completed(&self) -> bool {
        self.send(ReadEvent::Completed)
    }

    pub fn canceled(&self) -> bool {
        self.send(ReadEvent::Canceled)
    }

    pub fn error(&self, cause: impl Into<String>) -> bool {
        self.send(ReadEvent::Error(cause.into()))
    }
}

/// Asynchronous provider of tile pixels for one raster dataset
///
/// Levels run from 0 (full resolution) to `num_levels() - 1`. Tile geometry
/// helpers have default implementations for a regular power-of-two pyramid.
pub trait TileSource: Send + Sync {
    /// Stable identifier of the dataset, used for cache keys
    fn uri(&self) -> &str;

    /// Full resolution width in pixels
    fn width(&self) -> i64;

    /// Full resolution height in pixels
    fn height(&self) -> i64;

    /// Nominal tile width in pixels
    fn tile_width(&self) -> u32;

    /// Nominal tile height in pixels
    fn tile_height(&self) -> u32;

    fn num_levels(&self) -> u32;

    fn format(&self) -> TextureFormat {
        TextureFormat::Rgba8
    }

    /// Whether coarser levels are read directly instead of derived from finer ones
    fn is_multi_resolution(&self) -> bool {
        true
    }

    /// Comparable token; a change means cached pixels are stale
    fn tile_version(&self, tile: TileIndex) -> u64;

    /// Start reading `request.tile`, reporting progress through `sink`
    fn async_read(&self, request: ReadRequest, sink: ReadSink);

    fn tile_source_x(&self, level: u32, column: i64) -> i64 {
        column * ((self.tile_width() as i64) << level)
    }

    fn tile_source_y(&self, level: u32, row: i64) -> i64 {
        row * ((self.tile_height() as i64) << level)
    }

    fn tile_source_width(&self, level: u32, column: i64) -> i64 {
        let full = (self.tile_width() as i64) << level;
        let x = self.tile_source_x(level, column);
        full.min(self.width() - x).max(0)
    }

    fn tile_source_height(&self, level: u32, row: i64) -> i64 {
        let full = (self.tile_height() as i64) << level;
        let y = self.tile_source_y(level, row);
        full.min(self.height() - y).max(0)
    }

    /// Pixel width of the tile at its own level
    fn tile_pixel_width(&self, level: u32, column: i64) -> u32 {
        let src = self.tile_source_width(level, column);
        let scale = 1i64 << level;
        ((src + scale - 1) / scale) as u32
    }

    /// Pixel height of the tile at its own level
    fn tile_pixel_height(&self, level: u32, row: i64) -> u32 {
        let src = self.tile_source_height(level, row);
        let scale = 1i64 << level;
        ((src + scale - 1) / scale) as u32
    }

    fn num_tiles_x(&self, level: u32) -> i64 {
        let span = (self.tile_width() as i64) << level;
        (self.width() + span - 1) / span
    }

    fn num_tiles_y(&self, level: u32) -> i64 {
        let span = (self.tile_height() as i64) << level;
        (self.height() + span - 1) / span
    }
}
