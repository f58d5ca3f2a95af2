//! Headless render backend: tracks GPU-side resources without a GPU

use quadtile_lib::{
    CompositePart, DrawCommand, DrawTexture, EngineError, OffscreenTarget, PixelRect,
    RenderBackend, Result, Texture, TextureFormat, TextureId, TileData,
};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    next_id: u64,
    live: HashMap<TextureId, usize>,
    offscreen_supported: bool,
    offscreen_live: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub uploads: u64,
    pub composites: u64,
    pub draws: u64,
    pub placeholder_draws: u64,
}

impl HeadlessBackend {
    pub fn new(offscreen_supported: bool) -> Self {
        Self {
            offscreen_supported,
            ..Self::default()
        }
    }

    #[inline]
    pub fn live_textures(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn live_offscreen_targets(&self) -> usize {
        self.offscreen_live
    }
}

impl RenderBackend for HeadlessBackend {
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
        if width == 0 || height == 0 {
            return Err(EngineError::Backend(format!(
                "cannot create {width}x{height} texture"
            )));
        }
        self.next_id += 1;
        let texture = Texture {
            id: TextureId(self.next_id),
            width,
            height,
            format,
        };
        let size = texture.size_bytes();
        self.live.insert(texture.id, size);
        self.live_bytes += size;
        self.peak_bytes = self.peak_bytes.max(self.live_bytes);
        Ok(texture)
    }

    fn upload(&mut self, texture: &Texture, dst: PixelRect, data: &TileData) -> Result<()> {
        let expected = data.width as usize * data.height as usize * data.format.bytes_per_pixel();
        if data.pixels.len() < expected {
            return Err(EngineError::Backend(format!(
                "short upload: {} of {expected} bytes",
                data.pixels.len()
            )));
        }
        if dst.x + dst.width > texture.width || dst.y + dst.height > texture.height {
            return Err(EngineError::Backend(format!(
                "upload {dst:?} outside {}x{} texture",
                texture.width, texture.height
            )));
        }
        self.uploads += 1;
        Ok(())
    }

    fn release_texture(&mut self, texture: Texture) {
        match self.live.remove(&texture.id) {
            Some(size) => self.live_bytes -= size,
            None => tracing::warn!("released unknown texture {:?}", texture.id),
        }
    }

    fn create_offscreen_target(&mut self) -> Result<OffscreenTarget> {
        if !self.offscreen_supported {
            return Err(EngineError::Offscreen("framebuffer objects unsupported".into()));
        }
        self.offscreen_live += 1;
        Ok(OffscreenTarget(1))
    }

    fn release_offscreen_target(&mut self, _target: OffscreenTarget) {
        self.offscreen_live = self.offscreen_live.saturating_sub(1);
    }

    fn composite(
        &mut self,
        _target: OffscreenTarget,
        dst: &Texture,
        parts: &[CompositePart<'_>],
    ) -> Result<()> {
        for part in parts {
            if part.dst.x + part.dst.width > dst.width || part.dst.y + part.dst.height > dst.height {
                return Err(EngineError::Backend(format!(
                    "composite part {:?} outside {}x{} texture",
                    part.dst, dst.width, dst.height
                )));
            }
        }
        self.composites += 1;
        Ok(())
    }

    fn draw(&mut self, command: &DrawCommand<'_>) {
        self.draws += 1;
        if matches!(command.texture, DrawTexture::Placeholder) {
            self.placeholder_draws += 1;
        }
        tracing::trace!(
            "draw {} ({} vertices, alpha {:.2})",
            command.tile,
            command.vertices.len(),
            command.alpha
        );
    }
}
