//! Engine options

use crate::cache::{DEFAULT_CACHE_BUDGET_BYTES, SharedTextureCache, TextureCache};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tuning options for a [`crate::TileTree`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Options {
    /// Minimum mesh subdivisions per tile edge (power of two, >= 1)
    pub min_grid_size: u32,
    /// Maximum mesh subdivisions per tile edge (power of two)
    pub max_grid_size: u32,
    /// Added to the computed level before rounding up.
    /// Positive values switch to coarser levels earlier.
    pub level_transition_bias: f64,
    /// Build parent textures by compositing resident children
    pub texture_copy_enabled: bool,
    /// A parent composited from four resolved children counts as resolved
    pub child_copy_resolves_parent: bool,
    /// Unresolved tiles display a cropped ancestor texture
    pub texture_borrow_enabled: bool,
    /// Every third level must be loaded before its descendants are drawn
    pub progressive_load: bool,
    /// Fade-in duration for newly resolved tiles, in milliseconds (0 disables)
    pub fade_timer_limit_ms: u64,
    /// Generate mipmaps when a tile read completes
    pub mipmap_enabled: bool,
    /// Draw the generic placeholder when there is nothing to borrow
    pub loading_texture_enabled: bool,
    /// Re-read tiles whose source version changed
    pub version_check_enabled: bool,
    /// Refine mesh vertices with the precise projection on a worker thread
    pub precise_vertices: bool,
    /// Refine the target level per tile from its own estimated resolution
    pub adaptive_tile_lod: bool,
    /// Geographic distance, in degrees, between mesh grid samples
    pub recommended_grid_sample_distance: f64,
    /// Byte budget of a texture cache created for these options
    pub cache_budget_bytes: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Default for Options {
    fn default() -> Self {
        Self {
            min_grid_size: 1,
            max_grid_size: 32,
            level_transition_bias: 0.0,
            texture_copy_enabled: true,
            child_copy_resolves_parent: true,
            texture_borrow_enabled: true,
            progressive_load: true,
            fade_timer_limit_ms: 0,
            mipmap_enabled: false,
            loading_texture_enabled: true,
            version_check_enabled: true,
            precise_vertices: false,
            adaptive_tile_lod: false,
            recommended_grid_sample_distance: 0.125,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
        }
    }
}

impl Options {
    /// Mesh subdivisions for a tile spanning `span` degrees
    pub fn grid_size_for_span(&self, span: f64) -> u32 {
        let min = self.min_grid_size.max(1);
        let max = self.max_grid_size.max(min);
        if span.is_nan() || span <= 0.0 || self.recommended_grid_sample_distance <= 0.0 {
            return min;
        }
        let samples = (span / self.recommended_grid_sample_distance).ceil() as u64;
        let subs = crate::utils::next_pow2(samples);
        subs.clamp(min as u64, max as u64) as u32
    }

    /// A texture cache sized by [`cache_budget_bytes`](Self::cache_budget_bytes),
    /// ready to share between trees
    pub fn new_cache(&self) -> SharedTextureCache {
        TextureCache::shared(self.cache_budget_bytes)
    }
}
