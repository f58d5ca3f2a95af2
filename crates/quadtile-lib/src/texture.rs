//! Render backend seam
//!
//! The engine never calls a GPU API. Texture creation, uploads, offscreen
//! compositing and draw submission go through [`RenderBackend`], implemented
//! by the host renderer (or by a recording backend in tests).

use crate::source::{PixelRect, TileData, TileIndex};
use crate::{NodeId, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Pixel layout of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TextureFormat {
    Luminance8,
    LuminanceAlpha8,
    Rgb8,
    #[default]
    Rgba8,
}

impl TextureFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Luminance8 => 1,
            TextureFormat::LuminanceAlpha8 => 2,
            TextureFormat::Rgb8 => 3,
            TextureFormat::Rgba8 => 4,
        }
    }

    #[inline]
    pub fn has_alpha(self) -> bool {
        matches!(self, TextureFormat::LuminanceAlpha8 | TextureFormat::Rgba8)
    }

    /// Format of a parent texture composited from children of this format
    ///
    /// Luminance is promoted to color; a partial composite needs alpha for
    /// the quadrants left empty.
    pub fn composite_format(self, partial: bool) -> TextureFormat {
        if partial {
            return TextureFormat::Rgba8;
        }
        match self {
            TextureFormat::Luminance8 => TextureFormat::Rgb8,
            TextureFormat::LuminanceAlpha8 => TextureFormat::Rgba8,
            other => other,
        }
    }
}

/// Backend handle for a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// A texture owned by exactly one node or cache entry
///
/// Not `Clone`: moving the value moves ownership of the backend resource.
#[derive(Debug, PartialEq, Eq)]
pub struct Texture {
    pub id: TextureId,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Texture {
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Backend handle for an offscreen compositing target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffscreenTarget(pub u64);

/// One child texture rendered into a quadrant of its parent's texture
#[derive(Debug)]
pub struct CompositePart<'a> {
    pub texture: &'a Texture,
    /// Fraction of the child texture holding tile pixels
    pub extent: [f32; 2],
    /// Destination rectangle in the parent texture
    pub dst: PixelRect,
}

/// Which image a draw submission shows
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawTexture<'a> {
    Tile(&'a Texture),
    /// The backend's generic "loading" image
    Placeholder,
}

/// A textured mesh submission for one node
#[derive(Debug)]
pub struct DrawCommand<'a> {
    pub node: NodeId,
    pub tile: TileIndex,
    pub texture: DrawTexture<'a>,
    pub tex_coords: &'a [[f32; 2]],
    /// Vertex positions relative to `origin`
    pub vertices: &'a [[f64; 3]],
    /// Triangle strip indices, present for grids with more than 4 vertices
    pub indices: Option<&'a [u16]>,
    /// Projected tile centroid the vertices are relative to
    pub origin: [f64; 3],
    pub alpha: f32,
}

/// GPU operations needed by the engine, called on the render thread only
pub trait RenderBackend {
    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture>;

    /// Copy `data` into the `dst` sub-rectangle of `texture`
    fn upload(&mut self, texture: &Texture, dst: PixelRect, data: &TileData) -> Result<()>;

    fn generate_mipmaps(&mut self, _texture: &Texture) {}

    fn release_texture(&mut self, texture: Texture);

    fn create_offscreen_target(&mut self) -> Result<OffscreenTarget>;

    fn release_offscreen_target(&mut self, target: OffscreenTarget);

    /// Render `parts` into `dst` through `target`; `dst` is cleared first
    fn composite(
        &mut self,
        target: OffscreenTarget,
        dst: &Texture,
        parts: &[CompositePart<'_>],
    ) -> Result<()>;

    /// Size of the placeholder image drawn by [`DrawTexture::Placeholder`]
    fn placeholder_size(&self) -> (u32, u32) {
        (64, 64)
    }

    fn draw(&mut self, command: &DrawCommand<'_>);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::EngineError;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct RecordedDraw {
        pub node: NodeId,
        pub tile: TileIndex,
        /// `None` for the placeholder
        pub texture: Option<TextureId>,
        pub tex_coords: Vec<[f32; 2]>,
        pub alpha: f32,
    }

    /// Hands out texture ids and records every call
    #[derive(Debug, Default)]
    pub(crate) struct RecordingBackend {
        next_id: u64,
        pub live: HashSet<TextureId>,
        pub released: Vec<TextureId>,
        pub uploads: usize,
        pub composites: usize,
        pub offscreen_live: usize,
        pub fail_offscreen: bool,
        pub fail_create: bool,
        pub draws: Vec<RecordedDraw>,
    }

    impl RenderBackend for RecordingBackend {
        fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<Texture> {
            if self.fail_create {
                return Err(EngineError::Backend("out of texture memory".into()));
            }
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
            self.released.push(texture.id);
        }

        fn create_offscreen_target(&mut self) -> Result<OffscreenTarget> {
            if self.fail_offscreen {
                return Err(EngineError::Offscreen("no framebuffer".into()));
            }
            self.offscreen_live += 1;
            Ok(OffscreenTarget(1))
        }

        fn release_offscreen_target(&mut self, _target: OffscreenTarget) {
            self.offscreen_live -= 1;
        }

        fn composite(
            &mut self,
            _target: OffscreenTarget,
            _dst: &Texture,
            _parts: &[CompositePart<'_>],
        ) -> Result<()> {
            self.composites += 1;
            Ok(())
        }

        fn draw(&mut self, command: &DrawCommand<'_>) {
            self.draws.push(RecordedDraw {
                node: command.node,
                tile: command.tile,
                texture: match command.texture {
                    DrawTexture::Tile(texture) => Some(texture.id),
                    DrawTexture::Placeholder => None,
                },
                tex_coords: command.tex_coords.to_vec(),
                alpha: command.alpha,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_format_promotion() {
        assert_eq!(
            TextureFormat::Luminance8.composite_format(false),
            TextureFormat::Rgb8
        );
        assert_eq!(
            TextureFormat::LuminanceAlpha8.composite_format(false),
            TextureFormat::Rgba8
        );
        assert_eq!(TextureFormat::Rgb8.composite_format(false), TextureFormat::Rgb8);
        assert_eq!(TextureFormat::Rgb8.composite_format(true), TextureFormat::Rgba8);
        assert_eq!(
            TextureFormat::Luminance8.composite_format(true),
            TextureFormat::Rgba8
        );
    }

    #[test]
    fn test_texture_size_bytes() {
        let texture = Texture {
            id: TextureId(1),
            width: 256,
            height: 128,
            format: TextureFormat::Rgb8,
        };
        assert_eq!(texture.size_bytes(), 256 * 128 * 3);
        assert!(!texture.format.has_alpha());
    }
}
