//! Tile resolution
//!
//! Everything that turns a node's tile index into pixels: reading from the
//! source, compositing children into their parent, parking textures in the
//! cache and picking them up again, and applying read events.

use crate::cache::CacheEntry;
use crate::mesh::{self, MeshBuffers};
use crate::node::TileNode;
use crate::source::{PixelRect, ReadEvent, ReadRequest, ReadSink};
use crate::state::{CacheHints, State};
use crate::texture::{CompositePart, RenderBackend};
use crate::tree::TileTree;
use crate::{NodeId, Result};
use std::sync::PoisonError;
use std::time::Instant;

/// Tile entries carry the tile version they were read at
fn encode_version(version: Option<u64>) -> Option<Vec<u8>> {
    version.map(|v| v.to_le_bytes().to_vec())
}

fn decode_version(payload: Option<&[u8]>) -> Option<u64> {
    payload
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(u64::from_le_bytes)
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl TileTree {
    /// Whether drawing `id` should (re)start resolution
    pub(crate) fn should_resolve(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        match node.state {
            State::Unresolved => node.request.is_none(),
            State::Unresolvable => node
                .children
                .iter()
                .flatten()
                .any(|c| self.nodes.get(*c).is_some_and(|c| c.received_update)),
            _ => false,
        }
    }

    /// The source has a newer version of the tile, or a refresh was requested
    pub(crate) fn needs_refresh(&self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if node.stale {
            return true;
        }
        self.options.version_check_enabled
            && node
                .tile_version
                .is_some_and(|version| version != self.source.tile_version(node.index))
    }

    /// Composite what the children hold, then read whatever is still missing
    pub(crate) fn resolve_texture(&mut self, id: NodeId, backend: &mut dyn RenderBackend) {
        profiling::scope!("resolve_texture");
        let state = self.nodes[id].state;
        {
            let node = &mut self.nodes[id];
            node.stale = false;
            node.should_borrow = state != State::Resolved;
        }

        if state != State::Resolved && self.texture_copy_available() {
            self.composite_children(id, backend);
            if self.nodes[id].state == State::Resolved {
                self.unborrow(id);
            }
        } else if state == State::Resolved {
            // refresh of a resolved tile
            self.nodes[id].state = State::Unresolved;
        }

        self.abandon(id, backend);

        if self.nodes[id].state == State::Unresolved {
            self.dispatch_read(id);
        }
    }

    /// Render every child holding data into its quadrant of `id`'s texture
    fn composite_children(&mut self, id: NodeId, backend: &mut dyn RenderBackend) {
        let children = self.nodes[id].children;
        let mut has_child_data = false;
        let mut will_be_resolved = true;
        for child in children {
            match child.and_then(|c| self.nodes.get(c)) {
                Some(child) => {
                    will_be_resolved &= child.state == State::Resolved;
                    has_child_data |= child.has_data();
                }
                None => will_be_resolved = false,
            }
        }
        if !has_child_data {
            return;
        }

        {
            let node = &mut self.nodes[id];
            node.format = node.format.composite_format(!will_be_resolved);
        }
        if let Err(err) = self.validate_texture(id, backend) {
            tracing::warn!(
                "cannot allocate composite texture for {}: {err}",
                self.nodes[id].index
            );
            return;
        }

        let target = match self.offscreen {
            Some(target) => Some(target),
            None => match backend.create_offscreen_target() {
                Ok(target) => {
                    self.offscreen = Some(target);
                    Some(target)
                }
                Err(err) => {
                    tracing::warn!("offscreen target unavailable, disabling texture copy: {err}");
                    self.offscreen_failed = true;
                    None
                }
            },
        };

        let mut copied = 0;
        let mut resolved_parts = 0;
        let mut failed = false;
        if let Some(target) = target {
            profiling::scope!("composite");
            let half_w = self.source.tile_width() / 2;
            let half_h = self.source.tile_height() / 2;
            let node = &self.nodes[id];
            let mut parts = Vec::with_capacity(4);
            for (i, child) in children.into_iter().enumerate() {
                let Some(child) = child.and_then(|c| self.nodes.get(c)) else {
                    continue;
                };
                let Some(texture) = child.texture.as_ref() else {
                    continue;
                };
                if !child.has_data() {
                    continue;
                }
                let (tx, ty) = TileNode::quadrant(i);
                let part_x = tx * half_w;
                let part_y = ty * half_h;
                let width = ((tx + 1) * half_w).min(node.tile_width).saturating_sub(part_x);
                let height = ((ty + 1) * half_h).min(node.tile_height).saturating_sub(part_y);
                if width == 0 || height == 0 {
                    continue;
                }
                parts.push(CompositePart {
                    texture,
                    extent: [
                        child.tile_width as f32 / texture.width as f32,
                        child.tile_height as f32 / texture.height as f32,
                    ],
                    dst: PixelRect::new(part_x, part_y, width, height),
                });
                if child.state == State::Resolved {
                    resolved_parts += 1;
                }
            }

            if let Some(dst) = node.texture.as_ref()
                && !parts.is_empty()
            {
                match backend.composite(target, dst, &parts) {
                    Ok(()) => copied = parts.len(),
                    Err(err) => {
                        tracing::warn!("texture copy failed, disabling texture copy: {err}");
                        resolved_parts = 0;
                        failed = true;
                    }
                }
            }
        }
        if failed {
            self.offscreen_failed = true;
            if let Some(target) = self.offscreen.take() {
                backend.release_offscreen_target(target);
            }
        }

        if copied > 0 {
            self.stats.composites += 1;
            let node = &mut self.nodes[id];
            node.received_update = true;
            node.tex_coords_valid = false;
            self.validate_tex_verts(id);
        }

        let current_version = self.source.tile_version(self.nodes[id].index);
        let child_copy_resolves_parent = self.options.child_copy_resolves_parent;
        let node = &mut self.nodes[id];
        let was_unresolvable = node.state == State::Unresolvable;
        if resolved_parts == 4 {
            if child_copy_resolves_parent {
                node.state = State::Resolved;
                node.tile_version = Some(current_version);
            } else if !was_unresolvable {
                node.state = State::Unresolved;
            }
            node.should_borrow = false;
        } else if !was_unresolvable && node.state != State::Suspended {
            node.state = State::Unresolved;
        }
        if was_unresolvable {
            node.derived_unresolvable_data |= copied > 0;
        }
        tracing::trace!(
            "composited {copied} children into {} ({resolved_parts} resolved)",
            node.index
        );
    }

    /// Issue a read for `id`; the node moves to `Resolving`
    pub(crate) fn dispatch_read(&mut self, id: NodeId) {
        self.next_request_id += 1;
        let node = &mut self.nodes[id];
        let request = ReadRequest::new(self.next_request_id, node.index);
        node.state = State::Resolving;
        node.read_started = Some(Instant::now());
        node.request = Some(request.clone());
        tracing::debug!("reading tile {} (request {})", node.index, request.id);

        let sink = ReadSink::new(id, request.id, self.events_tx.clone());
        self.stats.reads_issued += 1;
        self.source.async_read(request, sink);
    }

    /// Apply one read event on the render thread
    pub(crate) fn apply_read_event(
        &mut self,
        id: NodeId,
        request_id: u64,
        event: ReadEvent,
        backend: &mut dyn RenderBackend,
    ) {
        let Some(node) = self.nodes.get(id) else {
            tracing::trace!("dropping read event for released node {id:?}");
            return;
        };
        if node.request.as_ref().map(|r| r.id) != Some(request_id) {
            tracing::trace!("dropping stale event of request {request_id} for {}", node.index);
            return;
        }

        match event {
            ReadEvent::Created | ReadEvent::Started => {}
            ReadEvent::Update { data, dst } => {
                if let Err(err) = self.validate_texture(id, backend) {
                    tracing::warn!("cannot allocate texture for {}: {err}", self.nodes[id].index);
                    return;
                }
                let node = &mut self.nodes[id];
                if let Some(texture) = node.texture.as_ref() {
                    match backend.upload(texture, dst, &data) {
                        Ok(()) => node.received_update = true,
                        Err(err) => tracing::warn!("upload into {} failed: {err}", node.index),
                    }
                }
            }
            ReadEvent::Completed => {
                let version = self.source.tile_version(self.nodes[id].index);
                let node = &mut self.nodes[id];
                node.read_elapsed_ms = node
                    .read_started
                    .take()
                    .map_or(0, |start| start.elapsed().as_millis() as u64);
                node.state = State::Resolved;
                node.request = None;
                node.tile_version = Some(version);
                tracing::debug!(
                    "resolved tile {} in {} ms",
                    node.index,
                    node.read_elapsed_ms
                );
                self.reset_fade_timer(id);
                if self.options.mipmap_enabled
                    && let Some(texture) = self.nodes[id].texture.as_ref()
                {
                    backend.generate_mipmaps(texture);
                }
            }
            ReadEvent::Canceled => {
                let node = &mut self.nodes[id];
                node.request = None;
                node.read_started = None;
                if node.state == State::Resolving {
                    node.state = State::Unresolved;
                }
            }
            ReadEvent::Error(cause) => {
                let version = self.source.tile_version(self.nodes[id].index);
                let node = &mut self.nodes[id];
                tracing::error!("read of tile {} failed: {cause}", node.index);
                node.request = None;
                node.read_started = None;
                node.tile_version = Some(version);
                node.state = State::Unresolvable;
            }
        }
    }

    /// Reclaim `id`'s parked texture from the cache
    pub(crate) fn use_cached_texture(&mut self, id: NodeId, backend: &mut dyn RenderBackend) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        let key = self.texture_key(id);
        let Some(entry) = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
        else {
            return false;
        };
        let resolved = entry.has_hint(CacheHints::RESOLVED);
        let version = decode_version(entry.payload.as_deref());
        let Some(texture) = entry.texture else {
            return false;
        };

        let node = &mut self.nodes[id];
        node.format = texture.format;
        let replaced = node.texture.replace(texture);
        node.received_update = true;
        node.tile_version = version;
        node.tex_coords_valid = false;
        node.vertex_coords_valid = false;
        node.vertex_srid = None;
        if let Some(mesh) = entry.mesh {
            if (mesh.grid_width, mesh.grid_height) != (node.grid_width, node.grid_height) {
                node.grid_width = mesh.grid_width;
                node.grid_height = mesh.grid_height;
                node.grid_vertices = vec![None; mesh::num_vertices(mesh.grid_width, mesh.grid_height)];
            }
            node.mesh = Some(mesh);
            node.tex_coords_valid = true;
        }
        if let Some(old) = replaced {
            backend.release_texture(old);
            self.release_borrowers(id);
        }
        if resolved {
            self.nodes[id].state = State::Resolved;
            self.reset_fade_timer(id);
        }
        tracing::trace!("reclaimed cached texture for {}", self.nodes[id].index);
        true
    }

    /// Give up `id`'s texture: parked in the cache when it holds data
    pub(crate) fn release_texture(&mut self, id: NodeId, backend: &mut dyn RenderBackend) {
        let key = self.texture_key(id);
        let node = &mut self.nodes[id];
        let resolved = node.state == State::Resolved;
        let keep = self.cache.is_some() && (resolved || node.received_update);
        let texture = node.texture.take();
        let mesh = node.mesh.take();
        let version = node.tile_version;
        if let Some(request) = node.request.take() {
            request.cancel();
        }
        node.tex_coords_valid = false;
        node.vertex_coords_valid = false;
        node.received_update = false;
        if node.state != State::Unresolvable {
            node.state = State::Unresolved;
        }

        if let Some(texture) = texture {
            if keep {
                let entry = CacheEntry {
                    texture: Some(texture),
                    mesh,
                    hints: if resolved {
                        CacheHints::RESOLVED
                    } else {
                        CacheHints::empty()
                    },
                    payload: encode_version(version),
                };
                self.cache_put(key, entry, backend);
            } else {
                backend.release_texture(texture);
            }
        }
        self.release_borrowers(id);
    }

    /// Make sure `id` owns a texture matching its tile size and format
    pub(crate) fn validate_texture(&mut self, id: NodeId, backend: &mut dyn RenderBackend) -> Result<()> {
        let node = &self.nodes[id];
        let (width, height, format) = (node.tile_width, node.tile_height, node.format);
        let stale = match &node.texture {
            Some(texture) => texture.width < width || texture.height < height || texture.format != format,
            None => true,
        };
        if stale {
            let replaced = self.nodes[id].texture.take();
            if let Some(old) = replaced {
                backend.release_texture(old);
                let node = &mut self.nodes[id];
                node.received_update = false;
                if node.state == State::Resolved {
                    node.state = State::Unresolved;
                }
                self.release_borrowers(id);
            }
            let node = &mut self.nodes[id];
            node.mesh = None;
            node.tex_coords_valid = false;
            node.vertex_coords_valid = false;
            let texture = backend.create_texture(width, height, format)?;
            self.nodes[id].texture = Some(texture);
        }
        self.validate_tex_verts(id);
        Ok(())
    }

    /// Rebuild the mesh when the grid or the texture extent changed
    pub(crate) fn validate_tex_verts(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        let current = node
            .mesh
            .as_ref()
            .is_some_and(|m| m.grid_width == node.grid_width && m.grid_height == node.grid_height);
        if node.tex_coords_valid && current {
            return;
        }
        let extent = node.texture.as_ref().map_or([1.0, 1.0], |texture| {
            [
                node.tile_width as f32 / texture.width.max(1) as f32,
                node.tile_height as f32 / texture.height.max(1) as f32,
            ]
        });
        node.mesh = Some(MeshBuffers::new(node.grid_width, node.grid_height, extent));
        node.tex_coords_valid = true;
        node.vertex_coords_valid = false;
        node.loading_vert_count = 0;
    }

    /// Fade-in time for freshly resolved data drawn over a borrowed texture
    ///
    /// Tiles closer to the target level fade longer; the read latency has
    /// already eaten part of the budget.
    pub(crate) fn reset_fade_timer(&mut self, id: NodeId) {
        let limit = self.options.fade_timer_limit_ms;
        let root_level = self.source.num_levels().saturating_sub(1);
        let pump = self.draw_pump_level;
        let node = &mut self.nodes[id];
        node.fade_timer_ms = if node.lend_from.is_some() && limit > 0 {
            let span = root_level.saturating_sub(pump);
            let scale = if span == 0 {
                1.0
            } else {
                1.0 - f64::from(node.index.level.saturating_sub(pump)) / f64::from(span)
            };
            ((limit as f64 * scale.clamp(0.0, 1.0)) as u64).saturating_sub(node.read_elapsed_ms)
        } else {
            0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_payload() {
        assert_eq!(decode_version(encode_version(Some(42)).as_deref()), Some(42));
        assert_eq!(encode_version(None), None);
        assert_eq!(decode_version(Some(&[1, 2, 3])), None);
    }
}
