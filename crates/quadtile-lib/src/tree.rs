//! The tile tree: root and session object of the engine
//!
//! A [`TileTree`] owns every node of one dataset's quadtree together with the
//! per-dataset state the nodes share: the tile source, the transforms, the
//! vertex resolver, the offscreen compositing target and a handle on the
//! (possibly shared) texture cache. Structural operations (layout, adopt,
//! orphan, release) live here; the per-frame walk is in `traversal.rs` and
//! the resolve machinery in `resolve.rs`.

use crate::cache::{CacheEntry, CacheKey, SharedTextureCache};
use crate::config::Options;
use crate::event::{EngineEvent, EventReceiver, EventSender};
use crate::mesh;
use crate::node::TileNode;
use crate::precise::PreciseVertexResolver;
use crate::projection::GeoTransform;
use crate::region::SourceRect;
use crate::resolver::{ApproximateVertexResolver, VertexResolver};
use crate::source::{TileIndex, TileSource};
use crate::state::{State, StateMask};
use crate::texture::{OffscreenTarget, RenderBackend, TextureFormat};
use crate::{EngineError, NodeId, Result};
use geo::{Coord, Point, Rect};
use slotmap::SlotMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::mpsc::unbounded_channel;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Deepest pyramid accepted; keeps `tile_size << level` inside `i64`
const MAX_LEVELS: u32 = 40;

/// Counters for one [`TileTree::draw`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FrameStats {
    /// Target level selected for the frame
    pub level: u32,
    /// Visible source regions (2 when the view crosses the antimeridian)
    pub regions: usize,
    pub tiles_drawn: usize,
    pub borrowed: usize,
    pub placeholders: usize,
    pub reads_issued: usize,
    pub composites: usize,
    /// A progressively loaded level finished; the host should draw again soon
    pub refresh_requested: bool,
}

/// Quadtree of tiles over one raster dataset
pub struct TileTree {
    pub(crate) source: Arc<dyn TileSource>,
    pub(crate) transform: Arc<GeoTransform>,
    pub(crate) options: Options,
    pub(crate) cache: Option<SharedTextureCache>,
    pub(crate) uri: Arc<str>,
    pub(crate) nodes: SlotMap<NodeId, TileNode>,
    pub(crate) root: NodeId,
    pub(crate) resolver: Box<dyn VertexResolver>,
    pub(crate) events_tx: EventSender,
    events_rx: EventReceiver,
    pub(crate) offscreen: Option<OffscreenTarget>,
    /// Set once creating or using the offscreen target failed; never cleared
    pub(crate) offscreen_failed: bool,
    pub(crate) next_request_id: u64,
    pub(crate) draw_pump_level: u32,
    pub(crate) progressive_loading: bool,
    pub(crate) stats: FrameStats,
    disposed: bool,
}

impl std::fmt::Debug for TileTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileTree")
            .field("uri", &self.uri)
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .field("offscreen_failed", &self.offscreen_failed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TileTree {
    /// Build the tree for `source`, with the root at its coarsest level
    ///
    /// The coarsest level must fit in a single tile.
    pub fn new(
        source: Arc<dyn TileSource>,
        transform: GeoTransform,
        options: Options,
        cache: Option<SharedTextureCache>,
    ) -> Result<Self> {
        let (width, height) = (source.width(), source.height());
        let levels = source.num_levels();
        if width <= 0 || height <= 0 {
            return Err(EngineError::InvalidSource(format!(
                "{}: empty raster {width}x{height}",
                source.uri()
            )));
        }
        if source.tile_width() == 0 || source.tile_height() == 0 {
            return Err(EngineError::InvalidSource(format!(
                "{}: zero tile size",
                source.uri()
            )));
        }
        if levels == 0 || levels > MAX_LEVELS {
            return Err(EngineError::InvalidSource(format!(
                "{}: unsupported level count {levels}",
                source.uri()
            )));
        }
        let root_level = levels - 1;
        if source.num_tiles_x(root_level) != 1 || source.num_tiles_y(root_level) != 1 {
            return Err(EngineError::InvalidSource(format!(
                "{}: level {root_level} does not fit in a single tile",
                source.uri()
            )));
        }

        let transform = Arc::new(transform);
        let uri: Arc<str> = Arc::from(source.uri());
        let (events_tx, events_rx) = unbounded_channel();
        let resolver: Box<dyn VertexResolver> =
            if options.precise_vertices && transform.has_precise() {
                Box::new(PreciseVertexResolver::new(
                    Arc::clone(&transform),
                    width,
                    height,
                    Arc::clone(&uri),
                    cache.clone(),
                    events_tx.clone(),
                ))
            } else {
                Box::new(ApproximateVertexResolver::new(Arc::clone(&transform)))
            };

        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(TileNode::new(None, TileIndex::new(root_level, 0, 0)));
        let mut tree = Self {
            source,
            transform,
            options,
            cache,
            uri,
            nodes,
            root,
            resolver,
            events_tx,
            events_rx,
            offscreen: None,
            offscreen_failed: false,
            next_request_id: 0,
            draw_pump_level: root_level,
            progressive_loading: false,
            stats: FrameStats::default(),
            disposed: false,
        };
        tree.layout(root);
        tracing::debug!(
            "created tile tree for {} ({width}x{height}, {levels} levels)",
            tree.uri
        );
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&TileNode> {
        self.nodes.get(id)
    }

    /// Ids of every live node
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    /// Number of live nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    #[inline]
    pub fn width(&self) -> i64 {
        self.source.width()
    }

    #[inline]
    pub fn height(&self) -> i64 {
        self.source.height()
    }

    #[inline]
    pub fn has_precise_coordinates(&self) -> bool {
        self.transform.has_precise()
    }

    /// Compositing children into parents is still possible this session
    #[inline]
    pub fn texture_copy_available(&self) -> bool {
        self.options.texture_copy_enabled && !self.offscreen_failed
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Image to ground; the flag reports whether the precise model answered
    pub fn image_to_ground(&self, image: Coord<f64>, precise: bool) -> (Point<f64>, bool) {
        self.transform.image_to_ground(image, precise)
    }

    /// Ground to image; `None` when the transforms disagree beyond the error bound
    pub fn ground_to_image(&self, ground: Point<f64>, precise: bool) -> Option<(Coord<f64>, bool)> {
        self.transform.ground_to_image(ground, precise)
    }

    /// Aggregate resolve state of the whole tree
    pub fn state(&self) -> State {
        self.subtree_state(self.root)
    }

    /// Aggregate resolve state of the subtree rooted at `id`
    ///
    /// Anything still loading (or fading in) reports `Resolving`. Otherwise
    /// an unresolvable or suspended node (the subtree root included)
    /// dominates, then the least resolved child.
    pub fn subtree_state(&self, id: NodeId) -> State {
        if !self.nodes.contains_key(id) {
            return State::Unresolved;
        }
        if self.state_mask(id).contains(StateMask::RESOLVING) || self.progressive_loading {
            return State::Resolving;
        }
        let node = &self.nodes[id];
        if matches!(node.state, State::Unresolvable | State::Suspended) {
            return node.state;
        }
        let mut aggregate = None;
        for child in node.children.iter().flatten() {
            let child_state = self.subtree_state(*child);
            match child_state {
                State::Unresolvable | State::Suspended => return child_state,
                _ => {
                    if aggregate.is_none() || child_state != State::Resolved {
                        aggregate = Some(child_state);
                    }
                }
            }
        }
        aggregate.unwrap_or(node.state)
    }

    fn state_mask(&self, id: NodeId) -> StateMask {
        let node = &self.nodes[id];
        let mut mask = match node.state {
            State::Resolved if node.fade_timer_ms > 0 => StateMask::RESOLVING,
            state => state.mask(),
        };
        for child in node.children.iter().flatten() {
            mask |= self.state_mask(*child);
        }
        mask
    }

    /// Apply queued read and resolver events; returns how many were handled
    ///
    /// [`draw`](Self::draw) calls this first, hosts may call it between frames.
    pub fn pump_events(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            handled += 1;
            match event {
                EngineEvent::Read {
                    node,
                    request,
                    event,
                } => self.apply_read_event(node, request, event, backend),
                EngineEvent::VerticesInvalid => {
                    if let Some(root) = self.nodes.get_mut(self.root) {
                        root.vertices_invalid = true;
                    }
                }
                EngineEvent::ExpandGrid { node, target } => self.expand_grid(node, target),
            }
        }
        handled
    }

    fn expand_grid(&mut self, id: NodeId, target: u32) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.grid_width >= target {
            return;
        }
        node.grid_width *= 2;
        node.grid_height *= 2;
        node.grid_vertices = vec![None; mesh::num_vertices(node.grid_width, node.grid_height)];
        node.tex_coords_valid = false;
        node.vertex_coords_valid = false;
        tracing::trace!(
            "expanded grid of {} to {}x{}",
            node.index,
            node.grid_width,
            node.grid_height
        );
    }

    /// Cancel in-flight reads; their nodes become `Suspended`
    pub fn suspend(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().collect();
        for id in ids {
            let node = &mut self.nodes[id];
            if node.state == State::Resolving
                && let Some(request) = node.request.take()
            {
                request.cancel();
                node.state = State::Suspended;
            }
        }
    }

    /// Re-enable loading of suspended nodes
    pub fn resume(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().collect();
        for id in ids {
            let node = &mut self.nodes[id];
            if node.state == State::Suspended {
                node.state = State::Unresolved;
            }
        }
    }

    /// Re-read every resolved or unresolvable tile the next time it is drawn
    pub fn refresh(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().collect();
        for id in ids {
            self.nodes[id].stale = true;
        }
    }

    /// Release a node and everything below it
    ///
    /// Non-root nodes are removed from the tree. Releasing the root keeps it
    /// but drops its children, texture and resolver state. Releasing a stale
    /// id does nothing.
    pub fn release(&mut self, id: NodeId, backend: &mut dyn RenderBackend) {
        if !self.nodes.contains_key(id) {
            return;
        }
        self.abandon(id, backend);
        self.unborrow(id);
        self.release_borrowers(id);
        if id == self.root {
            let displaced = self.resolver.release();
            Self::release_entries(displaced, backend);
            self.progressive_loading = false;
        } else if let Some(parent) = self.nodes[id].parent.take()
            && let Some(parent) = self.nodes.get_mut(parent)
        {
            for slot in parent.children.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }

        let node = &mut self.nodes[id];
        node.loading_vert_count = 0;
        node.fade_timer_ms = 0;
        if let Some(request) = node.request.take() {
            request.cancel();
        }
        if node.texture.is_some() {
            self.release_texture(id, backend);
        }
        let node = &mut self.nodes[id];
        node.loading_tex_coords.clear();
        node.state = State::Unresolved;
        node.received_update = false;
        node.draw_source = None;

        if id != self.root {
            self.nodes.remove(id);
        }
    }

    /// Tear down everything the tree owns
    ///
    /// Releases all nodes, the resolver thread, the offscreen target and this
    /// dataset's tiles in the texture cache. Later draws fail with
    /// [`EngineError::Disposed`].
    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        if self.disposed {
            return;
        }
        let root = self.root;
        self.release(root, backend);
        if let Some(target) = self.offscreen.take() {
            backend.release_offscreen_target(target);
        }
        if let Some(cache) = &self.cache {
            let entries = cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove_dataset(&self.uri);
            Self::release_entries(entries, backend);
        }
        self.nodes.remove(root);
        self.disposed = true;
        tracing::debug!("disposed tile tree for {}", self.uri);
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Recompute the geometry of `id` from its tile index
    pub(crate) fn layout(&mut self, id: NodeId) {
        let source = &self.source;
        let approx = *self.transform.approximate();
        let node = &mut self.nodes[id];
        let TileIndex { level, column, row } = node.index;

        node.src = SourceRect::new(
            source.tile_source_x(level, column),
            source.tile_source_y(level, row),
            source.tile_source_width(level, column),
            source.tile_source_height(level, row),
        );
        node.tile_width = source.tile_pixel_width(level, column);
        node.tile_height = source.tile_pixel_height(level, row);

        node.format = source.format();
        if node.format != TextureFormat::Rgba8
            && !(node.tile_width.is_power_of_two() && node.tile_height.is_power_of_two())
        {
            node.format = TextureFormat::Rgba8;
        }

        let src = node.src;
        let mut min = Coord {
            x: f64::INFINITY,
            y: f64::INFINITY,
        };
        let mut max = Coord {
            x: f64::NEG_INFINITY,
            y: f64::NEG_INFINITY,
        };
        for (x, y) in [
            (src.x, src.y),
            (src.right(), src.y),
            (src.right(), src.bottom()),
            (src.x, src.bottom()),
        ] {
            let p = approx.project(x as f64, y as f64);
            min.x = min.x.min(p.x());
            min.y = min.y.min(p.y());
            max.x = max.x.max(p.x());
            max.y = max.y.max(p.y());
        }
        node.bounds = Rect::new(min, max);
        node.centroid = Point::new((min.x + max.x) / 2.0, (min.y + max.y) / 2.0);

        // square grids only
        let grid = self
            .options
            .grid_size_for_span((max.y - min.y).max(max.x - min.x));
        node.grid_width = grid;
        node.grid_height = grid;
        node.grid_vertices = vec![None; mesh::num_vertices(grid, grid)];

        node.tex_coords_valid = false;
        node.vertex_coords_valid = false;
        node.vertex_srid = None;
        node.primary_hemi = None;
        node.tile_version = None;
        node.stale = false;
    }

    /// Point `id` at a new tile, carrying its children along
    pub(crate) fn set(&mut self, id: NodeId, index: TileIndex, backend: &mut dyn RenderBackend) {
        if self.nodes[id].index == index {
            return;
        }
        self.unborrow(id);
        let children = self.nodes[id].children;
        for (i, child) in children.into_iter().enumerate() {
            let Some(child) = child else {
                continue;
            };
            match index.child(i) {
                Some(child_index) => self.set(child, child_index, backend),
                None => self.release(child, backend),
            }
        }

        let node = &mut self.nodes[id];
        if let Some(request) = node.request.take() {
            request.cancel();
        }
        if self.cache.is_some() && node.texture.is_some() && node.has_data() {
            self.release_texture(id, backend);
        }
        self.release_borrowers(id);

        let node = &mut self.nodes[id];
        node.state = State::Unresolved;
        node.received_update = false;
        node.derived_unresolvable_data = false;
        node.index = index;
        self.layout(id);
    }

    /// Create the child in slot `idx`
    pub(crate) fn create_child(&mut self, id: NodeId, idx: usize) -> Option<NodeId> {
        let index = self.nodes[id].index.child(idx)?;
        let child = self.nodes.insert(TileNode::new(Some(id), index));
        self.layout(child);
        self.nodes[id].children[idx] = Some(child);
        Some(child)
    }

    /// Re-parent a previously orphaned node into slot `idx`
    pub(crate) fn adopt(
        &mut self,
        id: NodeId,
        idx: usize,
        orphan: NodeId,
        backend: &mut dyn RenderBackend,
    ) -> Option<NodeId> {
        let Some(index) = self.nodes[id].index.child(idx) else {
            self.release(orphan, backend);
            return None;
        };
        self.nodes[id].children[idx] = Some(orphan);
        self.nodes[orphan].parent = Some(id);
        self.set(orphan, index, backend);
        Some(orphan)
    }

    /// Detach the flagged children not touched during `draw_version`
    ///
    /// Orphans come back without textures first, then by ascending texture
    /// size, so adoption reuses the cheapest nodes.
    pub(crate) fn orphan(&mut self, id: NodeId, draw_version: u64, flagged: [bool; 4]) -> Vec<NodeId> {
        let mut orphans = Vec::new();
        for (i, flag) in flagged.into_iter().enumerate() {
            let Some(child) = self.nodes[id].children[i] else {
                continue;
            };
            if flag && self.nodes[child].last_touch != Some(draw_version) {
                self.nodes[id].children[i] = None;
                self.nodes[child].parent = None;
                orphans.push(child);
            }
        }
        orphans.sort_by_key(|orphan| {
            self.nodes[*orphan]
                .texture
                .as_ref()
                .map(|t| u64::from(t.width) * u64::from(t.height))
        });
        orphans
    }

    /// Release every child of `id`
    pub(crate) fn abandon(&mut self, id: NodeId, backend: &mut dyn RenderBackend) {
        for i in 0..4 {
            if let Some(child) = self.nodes[id].children[i].take() {
                self.release(child, backend);
            }
        }
    }

    pub(crate) fn texture_key(&self, id: NodeId) -> CacheKey {
        let index = self.nodes[id].index;
        CacheKey::Tile {
            uri: Arc::clone(&self.uri),
            level: index.level,
            column: index.column,
            row: index.row,
        }
    }

    /// Start borrowing from `lender`, keeping both sides of the link in sync
    pub(crate) fn borrow_from(&mut self, id: NodeId, lender: NodeId) {
        self.unborrow(id);
        self.nodes[id].lend_from = Some(lender);
        let borrowers = &mut self.nodes[lender].borrowers;
        if !borrowers.contains(&id) {
            borrowers.push(id);
        }
    }

    /// Stop borrowing, on both sides of the link
    pub(crate) fn unborrow(&mut self, id: NodeId) {
        let Some(lender) = self.nodes[id].lend_from.take() else {
            return;
        };
        if let Some(lender) = self.nodes.get_mut(lender) {
            lender.borrowers.retain(|b| *b != id);
        }
    }

    /// Force every borrower of `id` to look for a new lender
    pub(crate) fn release_borrowers(&mut self, id: NodeId) {
        let borrowers = std::mem::take(&mut self.nodes[id].borrowers);
        for borrower in borrowers {
            if let Some(node) = self.nodes.get_mut(borrower)
                && node.lend_from == Some(id)
            {
                node.lend_from = None;
                node.loading_vert_count = 0;
            }
        }
    }

    /// Park an entry in the cache, releasing whatever it displaced
    pub(crate) fn cache_put(&self, key: CacheKey, entry: CacheEntry, backend: &mut dyn RenderBackend) {
        match &self.cache {
            Some(cache) => {
                let displaced = cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(key, entry);
                Self::release_entries(displaced, backend);
            }
            None => Self::release_entries(vec![entry], backend),
        }
    }

    pub(crate) fn release_entries(entries: Vec<CacheEntry>, backend: &mut dyn RenderBackend) {
        for texture in entries.into_iter().filter_map(|e| e.texture) {
            backend.release_texture(texture);
        }
    }
}
