//! Per-frame traversal
//!
//! [`TileTree::draw`] picks the target level for the view and walks every
//! visible source region from the root down to that level. Nodes above the
//! target only manage their children; nodes at the target draw themselves,
//! falling back to a cropped ancestor texture (or the placeholder) until
//! their own pixels arrive.

use crate::mesh::{self, quad_tex_coords};
use crate::node::DrawSource;
use crate::region::{Region, visible_regions};
use crate::resolver::NodeGrid;
use crate::state::{CacheHints, State};
use crate::texture::{DrawCommand, DrawTexture, RenderBackend};
use crate::tree::{FrameStats, TileTree};
use crate::view::{Hemisphere, MapView};
use crate::{EngineError, NodeId, Result, utils};
use geo::Point;
use std::sync::PoisonError;

/// Child visiting order for each 45 degree sector of the direction from the
/// tile centre to the point of interest
const POI_ITERATION_BIAS: [[usize; 4]; 8] = [
    [1, 3, 0, 2],
    [1, 0, 2, 3],
    [0, 1, 2, 3],
    [0, 2, 1, 3],
    [2, 0, 3, 1],
    [2, 3, 0, 1],
    [3, 2, 1, 0],
    [3, 1, 2, 0],
];

/// Sector used when there is no point of interest
const DEFAULT_ITERATION_OFFSET: usize = 2;

/// Which image a node submits
#[derive(Debug, Clone, Copy)]
enum Layer {
    Own,
    Borrowed(NodeId),
    Placeholder,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TileTree {
    /// Draw one frame
    pub fn draw(&mut self, view: &MapView, backend: &mut dyn RenderBackend) -> Result<FrameStats> {
        let root = self.root;
        self.draw_node(root, view, backend)
    }

    /// Draw one frame starting at `id`, which must be the root
    pub fn draw_node(
        &mut self,
        id: NodeId,
        view: &MapView,
        backend: &mut dyn RenderBackend,
    ) -> Result<FrameStats> {
        self.ensure_live()?;
        if id != self.root {
            tracing::error!("draw invoked on non-root node {id:?}");
            return Err(EngineError::NotRoot(id));
        }
        profiling::scope!("draw");

        self.pump_events(backend);
        self.stats = FrameStats::default();

        let regions = visible_regions(view, &self.transform, self.width(), self.height());
        if regions.is_empty() {
            return Ok(self.stats);
        }

        let root_level = self.nodes[self.root].index.level;
        let level = utils::level_for_resolution(
            self.transform.gsd(),
            view.resolution,
            self.options.level_transition_bias,
        )
        .min(root_level);
        self.draw_pump_level = level;
        self.stats.level = level;
        self.stats.regions = regions.len();

        self.resolver.begin_draw(view);
        let count = regions.len();
        for (i, region) in regions.into_iter().enumerate() {
            self.draw_region(self.root, view, level, region, i + 1 == count, backend);
        }
        self.resolver.end_draw(view);

        if let Some(target) = self.offscreen.take() {
            backend.release_offscreen_target(target);
        }

        tracing::trace!(
            "frame {}: level {level}, {} tiles, {} reads, {} nodes",
            view.draw_version,
            self.stats.tiles_drawn,
            self.stats.reads_issued,
            self.nodes.len()
        );
        Ok(self.stats)
    }

    /// Draw the subtree at `id` for one region; `cull` marks the last region
    fn draw_region(
        &mut self,
        id: NodeId,
        view: &MapView,
        mut level: u32,
        region: Region,
        cull: bool,
        backend: &mut dyn RenderBackend,
    ) {
        let node_level = self.nodes[id].index.level;
        if self.options.adaptive_tile_lod {
            let tile_gsd = view.estimate_resolution(&self.nodes[id].bounds);
            let computed = utils::level_for_resolution(
                self.transform.gsd(),
                tile_gsd,
                self.options.level_transition_bias,
            );
            if computed > level && computed > node_level {
                level = node_level;
            }
        }

        if node_level == level {
            let had_texture = self.nodes[id].texture.is_some();
            self.draw_impl(id, view, backend);
            if !had_texture && self.nodes[id].texture.is_some() {
                self.abandon(id, backend);
            }
        } else if node_level > level {
            self.draw_children(id, view, level, region, cull, backend);
        }

        self.nodes[id].vertices_invalid = false;
    }

    fn draw_children(
        &mut self,
        id: NodeId,
        view: &MapView,
        level: u32,
        region: Region,
        cull: bool,
        backend: &mut dyn RenderBackend,
    ) {
        let unresolved_children = self.source.is_multi_resolution()
            && self.refresh_for_unresolvable_children(id, backend);

        // every third level draws itself until its own data has faded in
        let node = &self.nodes[id];
        if self.options.progressive_load
            && node.index.level % 3 == 0
            && (!node.touched || node.fade_timer_ms > 0)
        {
            self.progressive_loading = true;
            self.draw_impl(id, view, backend);
            return;
        }
        self.progressive_loading = false;

        let visible = self.visible_quadrants(id, region);

        let orphans = if cull {
            self.orphan(id, view.draw_version, visible.map(|v| !v))
        } else {
            Vec::new()
        };
        let mut orphans = orphans.into_iter();

        let mut visible = visible;
        let mut vis_count = 0;
        for (i, vis) in visible.iter_mut().enumerate() {
            if !*vis {
                continue;
            }
            if self.nodes[id].children[i].is_none() {
                match orphans.next() {
                    Some(orphan) => {
                        self.adopt(id, i, orphan, backend);
                    }
                    None => {
                        self.create_child(id, i);
                    }
                }
            }
            let Some(child) = self.nodes[id].children[i] else {
                *vis = false;
                continue;
            };
            let child = &mut self.nodes[child];
            if child.tile_width == 0 || child.tile_height == 0 {
                *vis = false;
                continue;
            }
            child.last_touch = Some(view.draw_version);
            vis_count += 1;
        }
        for orphan in orphans {
            self.release(orphan, backend);
        }

        if vis_count == 0 {
            // selected for overdraw
            self.nodes[id].is_overdraw = true;
            self.draw_impl(id, view, backend);
            return;
        } else if !cull {
            self.nodes[id].is_overdraw = false;
        }

        let node = &mut self.nodes[id];
        if !unresolved_children
            && cull
            && !node.is_overdraw
            && let Some(request) = node.request.take()
        {
            request.cancel();
            node.read_started = None;
            if node.state == State::Resolving {
                node.state = State::Unresolved;
            }
        }

        let children = self.nodes[id].children;
        let mut offset = DEFAULT_ITERATION_OFFSET;
        if let Some((poi_x, poi_y)) = region.poi {
            if self.nodes[id].src.contains(poi_x, poi_y) {
                for i in 0..4 {
                    if let Some(child) = children[i]
                        && visible[i]
                        && self.nodes[child].src.contains(poi_x, poi_y)
                    {
                        self.draw_child(id, child, view, level, region, cull, backend);
                        visible[i] = false;
                        break;
                    }
                }
            }
            let (mid_x, mid_y) = self.tile_midpoint(id);
            let theta = utils::angle_degrees((poi_x - mid_x) as f64, (poi_y - mid_y) as f64);
            offset = (theta / 45.0) as usize % 8;
        }
        for i in POI_ITERATION_BIAS[offset] {
            if let Some(child) = children[i]
                && visible[i]
            {
                self.draw_child(id, child, view, level, region, cull, backend);
                visible[i] = false;
            }
        }

        let node = &self.nodes[id];
        if node.borrowers.is_empty()
            && node.texture.is_some()
            && !unresolved_children
            && cull
            && !node.is_overdraw
        {
            self.release_texture(id, backend);
        }
    }

    fn draw_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        view: &MapView,
        level: u32,
        region: Region,
        cull: bool,
        backend: &mut dyn RenderBackend,
    ) {
        self.nodes[child].vertices_invalid = self.nodes[parent].vertices_invalid;
        self.draw_region(child, view, level, region, cull, backend);
    }

    /// Multi-resolution sources can fill holes of unresolvable children from
    /// this node's own data; returns whether any child is unresolvable
    fn refresh_for_unresolvable_children(
        &mut self,
        id: NodeId,
        backend: &mut dyn RenderBackend,
    ) -> bool {
        let children = self.nodes[id].children;
        let unresolvable = children
            .iter()
            .flatten()
            .any(|c| self.nodes[*c].state == State::Unresolvable);
        if !unresolvable {
            return false;
        }

        let node = &self.nodes[id];
        if node.state == State::Unresolved
            || (node.state == State::Unresolvable && node.derived_unresolvable_data)
        {
            self.use_cached_texture(id, backend);
            let node = &self.nodes[id];
            if node.state == State::Unresolved && node.request.is_none() {
                match self.validate_texture(id, backend) {
                    Ok(()) => self.dispatch_read(id),
                    Err(err) => tracing::warn!(
                        "cannot allocate texture for {}: {err}",
                        self.nodes[id].index
                    ),
                }
            }
        }

        let node = &self.nodes[id];
        if node.state != State::Unresolved || node.received_update {
            // re-borrow from this node instead of a coarser ancestor
            for child in children.into_iter().flatten() {
                let child_node = &self.nodes[child];
                if child_node.state == State::Unresolvable
                    && child_node.lend_from.is_some_and(|lender| lender != id)
                {
                    self.unborrow(child);
                }
            }
        }
        true
    }

    /// Source-space midpoint of `id`'s tile at nominal tile size
    fn tile_midpoint(&self, id: NodeId) -> (i64, i64) {
        let node = &self.nodes[id];
        let half_w = i64::from(self.source.tile_width() / 2);
        let half_h = i64::from(self.source.tile_height() / 2);
        (
            node.src.x + (half_w << node.index.level),
            node.src.y + (half_h << node.index.level),
        )
    }

    /// Child quadrants intersecting `region`: UL, UR, LL, LR
    fn visible_quadrants(&self, id: NodeId, region: Region) -> [bool; 4] {
        let node = &self.nodes[id];
        let rect = region.rect;
        let max_src_x = rect.right() - 1;
        let max_src_y = rect.bottom() - 1;
        let (mid_x, mid_y) = self.tile_midpoint(id);
        let tile_max_x = node.src.right() - 1;
        let tile_max_y = node.src.bottom() - 1;
        let limit_x = self.width() - 1;
        let limit_y = self.height() - 1;

        let left = rect.x < mid_x.min(limit_x) && max_src_x > node.src.x.max(0);
        let upper = rect.y < mid_y.min(limit_y) && max_src_y > node.src.y.max(0);
        let right = rect.x < tile_max_x.min(limit_x) && max_src_x > mid_x.max(0);
        let lower = rect.y < tile_max_y.min(limit_y) && max_src_y > mid_y.max(0);
        [upper && left, upper && right, lower && left, lower && right]
    }

    /// Draw `id` at its own level
    fn draw_impl(&mut self, id: NodeId, view: &MapView, backend: &mut dyn RenderBackend) {
        let node = &mut self.nodes[id];
        if node.vertices_invalid {
            node.vertex_coords_valid = false;
            node.grid_vertices.fill(None);
        }

        self.super_draw(id, view, backend);

        let node = &mut self.nodes[id];
        if node.state == State::Resolved {
            if node.fade_timer_ms == 0 {
                node.should_borrow = false;
                node.loading_tex_coords.clear();
                node.loading_vert_count = 0;
                self.unborrow(id);
            } else {
                node.fade_timer_ms = node.fade_timer_ms.saturating_sub(view.animation_delta_ms);
            }
        }
    }

    fn super_draw(&mut self, id: NodeId, view: &MapView, backend: &mut dyn RenderBackend) {
        if self.cache.is_some() && !self.nodes[id].has_data() {
            self.use_cached_texture(id, backend);
        }
        if let Err(err) = self.validate_texture(id, backend) {
            tracing::warn!("skipping {} this frame: {err}", self.nodes[id].index);
            self.nodes[id].draw_source = None;
            return;
        }

        let state = self.nodes[id].state;
        if matches!(state, State::Resolved | State::Unresolvable) && self.needs_refresh(id) {
            if state == State::Unresolvable {
                self.nodes[id].state = State::Unresolved;
            }
            self.resolve_texture(id, backend);
        } else if self.should_resolve(id) {
            self.resolve_texture(id, backend);
        }

        let progressive = self.progressive_loading;
        let node = &mut self.nodes[id];
        if !node.touched && matches!(node.state, State::Resolved | State::Unresolvable) {
            node.touched = true;
            if progressive {
                self.stats.refresh_requested = true;
            }
        }

        let node = &self.nodes[id];
        let mut source = None;
        if node.state != State::Resolved || node.fade_timer_ms > 0 {
            source = self.draw_loading_texture(id, view, backend);
        } else {
            let node = &mut self.nodes[id];
            node.loading_tex_coords.clear();
            node.loading_vert_count = 0;
        }

        let node = &self.nodes[id];
        if node.received_update && node.texture.is_some() {
            self.validate_vertex_coords(id, view);
            self.draw_texture(id, view, Layer::Own, backend);
            source = Some(DrawSource::Texture);
        }

        self.nodes[id].draw_source = source;
        match source {
            Some(DrawSource::Texture) => self.stats.tiles_drawn += 1,
            Some(DrawSource::Borrowed { .. }) => {
                self.stats.tiles_drawn += 1;
                self.stats.borrowed += 1;
            }
            Some(DrawSource::Placeholder) => {
                self.stats.tiles_drawn += 1;
                self.stats.placeholders += 1;
            }
            None => {}
        }
    }

    /// Draw the borrowed ancestor texture, or the placeholder
    fn draw_loading_texture(
        &mut self,
        id: NodeId,
        view: &MapView,
        backend: &mut dyn RenderBackend,
    ) -> Option<DrawSource> {
        match self.find_lender(id, backend) {
            Some(lender) => {
                let vertex_count = {
                    let node = &self.nodes[id];
                    mesh::num_vertices(node.grid_width, node.grid_height)
                };
                if self.nodes[id].lend_from != Some(lender) {
                    self.borrow_from(id, lender);
                    self.borrow_tex_coords(id, lender);
                } else if self.nodes[id].loading_vert_count != vertex_count {
                    self.borrow_tex_coords(id, lender);
                }
                self.validate_vertex_coords(id, view);
                self.draw_texture(id, view, Layer::Borrowed(lender), backend);
                Some(DrawSource::Borrowed { from: lender })
            }
            None if self.options.loading_texture_enabled => {
                let (pw, ph) = backend.placeholder_size();
                let node = &mut self.nodes[id];
                let extent = [
                    node.tile_width as f32 / pw.max(1) as f32,
                    node.tile_height as f32 / ph.max(1) as f32,
                ];
                node.loading_tex_coords =
                    quad_tex_coords([0.0, 0.0], extent, node.grid_width, node.grid_height);
                node.loading_vert_count = 0;
                self.validate_vertex_coords(id, view);
                self.draw_texture(id, view, Layer::Placeholder, backend);
                Some(DrawSource::Placeholder)
            }
            None => None,
        }
    }

    /// The ancestor whose texture `id` should display while loading
    ///
    /// The nearest resolved ancestor (or one parked in the cache as resolved)
    /// wins; failing that the nearest ancestor holding partial data.
    fn find_lender(&mut self, id: NodeId, backend: &mut dyn RenderBackend) -> Option<NodeId> {
        let node = &self.nodes[id];
        if let Some(lender) = node.lend_from {
            return self.nodes[lender].texture.is_some().then_some(lender);
        }
        if !(self.options.texture_borrow_enabled && node.should_borrow) {
            return None;
        }

        let mut updated = None;
        let mut scratch = node.parent;
        while let Some(ancestor_id) = scratch {
            let ancestor = &self.nodes[ancestor_id];
            if ancestor.state == State::Resolved && ancestor.texture.is_some() {
                break;
            }
            if let Some(cache) = &self.cache {
                let key = self.texture_key(ancestor_id);
                let cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
                match cache.get(&key) {
                    Some(entry) if entry.has_hint(CacheHints::RESOLVED) => break,
                    Some(_) if updated.is_none() => updated = Some(ancestor_id),
                    _ => {}
                }
            }
            if ancestor.received_update && ancestor.texture.is_some() && updated.is_none() {
                updated = Some(ancestor_id);
            }
            scratch = ancestor.parent;
        }

        let lender = scratch.or(updated)?;
        // found in the cache only; reclaim it
        if !self.nodes[lender].has_data() && !self.use_cached_texture(lender, backend) {
            return None;
        }
        self.nodes[lender].texture.is_some().then_some(lender)
    }

    /// Texture coordinates of `id`'s footprint inside the lender's texture
    fn borrow_tex_coords(&mut self, id: NodeId, lender: NodeId) {
        let lender = &self.nodes[lender];
        let Some(texture) = lender.texture.as_ref() else {
            return;
        };
        let extent_x = lender.tile_width as f32 / texture.width.max(1) as f32;
        let extent_y = lender.tile_height as f32 / texture.height.max(1) as f32;
        let (lx, ly) = (lender.src.x, lender.src.y);
        let lw = lender.src.width.max(1) as f32;
        let lh = lender.src.height.max(1) as f32;

        let node = &self.nodes[id];
        let src = node.src;
        // one source pixel of slack on each side
        let min_x = (((src.x - lx - 1) as f32 / lw) * extent_x).max(0.0);
        let min_y = (((src.y - ly - 1) as f32 / lh) * extent_y).max(0.0);
        let max_x = (((src.right() - lx + 1) as f32 / lw) * extent_x).min(extent_x);
        let max_y = (((src.bottom() - ly + 1) as f32 / lh) * extent_y).min(extent_y);
        let (gw, gh) = (node.grid_width, node.grid_height);

        let node = &mut self.nodes[id];
        node.loading_tex_coords = quad_tex_coords([min_x, min_y], [max_x, max_y], gw, gh);
        node.loading_vert_count = mesh::num_vertices(gw, gh);
    }

    /// Project the mesh grid into the view's projection, relative to the
    /// tile centroid
    fn validate_vertex_coords(&mut self, id: NodeId, view: &MapView) {
        self.validate_tex_verts(id);
        let projection = view.projection;
        let srid = projection.srid();
        let node = &mut self.nodes[id];
        let expected = mesh::num_vertices(node.grid_width, node.grid_height);
        let current = node
            .mesh
            .as_ref()
            .is_some_and(|m| m.vertices.len() == expected);
        if node.vertex_coords_valid && node.vertex_srid == Some(srid) && current {
            return;
        }

        if node.vertex_srid != Some(srid) || node.primary_hemi.is_none() {
            let centroid = node.centroid;
            node.centroid_proj = projection.forward(centroid);
            node.centroid_proj_hemi2 = projection.forward(Point::new(
                utils::wrap_to_other_hemisphere(centroid.x()),
                centroid.y(),
            ));
            node.primary_hemi = Some(Hemisphere::of_longitude(centroid.x()));
        }
        if node.grid_vertices.len() != expected {
            node.grid_vertices = vec![None; expected];
        }

        let grid = NodeGrid {
            node: id,
            level: node.index.level,
            src: node.src,
            grid_width: node.grid_width,
            grid_height: node.grid_height,
        };
        let gw = i64::from(grid.grid_width.max(1));
        let gh = i64::from(grid.grid_height.max(1));
        let origin = node.centroid_proj;

        self.resolver.begin_node(&grid);
        let mut vertices = Vec::with_capacity(expected);
        for i in 0..=gh {
            for j in 0..=gw {
                let idx = (i * (gw + 1) + j) as usize;
                let mut vertex = match node.grid_vertices[idx] {
                    Some(vertex) if vertex.resolved => vertex,
                    _ => self.resolver.project(
                        view,
                        grid.src.x + (grid.src.width * j) / gw,
                        grid.src.y + (grid.src.height * i) / gh,
                    ),
                };
                let p = vertex.projected(projection);
                node.grid_vertices[idx] = Some(vertex);
                vertices.push([p[0] - origin[0], p[1] - origin[1], p[2] - origin[2]]);
            }
        }
        self.resolver.end_node(&grid);

        if let Some(mesh) = node.mesh.as_mut() {
            mesh.vertices = vertices;
        }
        node.vertex_coords_valid = true;
        node.vertex_srid = Some(srid);
    }

    /// Submit one layer of `id` to the backend
    fn draw_texture(&self, id: NodeId, view: &MapView, layer: Layer, backend: &mut dyn RenderBackend) {
        let node = &self.nodes[id];
        let Some(mesh) = node.mesh.as_ref() else {
            return;
        };
        let (texture, tex_coords, alpha) = match layer {
            Layer::Own => {
                let Some(texture) = node.texture.as_ref() else {
                    return;
                };
                let limit = self.options.fade_timer_limit_ms;
                let alpha = if limit > 0 {
                    limit.saturating_sub(node.fade_timer_ms) as f32 / limit as f32
                } else {
                    1.0
                };
                (DrawTexture::Tile(texture), mesh.tex_coords.as_slice(), alpha)
            }
            Layer::Borrowed(lender) => {
                let Some(texture) = self.nodes.get(lender).and_then(|l| l.texture.as_ref()) else {
                    return;
                };
                (DrawTexture::Tile(texture), node.loading_tex_coords.as_slice(), 1.0)
            }
            Layer::Placeholder => (
                DrawTexture::Placeholder,
                node.loading_tex_coords.as_slice(),
                1.0,
            ),
        };
        if tex_coords.len() != mesh.vertices.len() {
            tracing::trace!("mesh of {} not ready, skipping layer", node.index);
            return;
        }

        // draw on the camera's side of the antimeridian
        let origin = if view.crosses_idl()
            && node
                .primary_hemi
                .is_some_and(|hemi| hemi != view.primary_hemisphere())
        {
            node.centroid_proj_hemi2
        } else {
            node.centroid_proj
        };

        backend.draw(&DrawCommand {
            node: id,
            tile: node.index,
            texture,
            tex_coords,
            vertices: &mesh.vertices,
            indices: mesh.indices.as_deref(),
            origin,
            alpha,
        });
    }
}
