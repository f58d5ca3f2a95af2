use clap::Parser;
use geo::{Coord, Rect};
use quadtile_lib::Options;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Quadtile Sim - drives the tile engine against a synthetic raster with a scripted camera
pub struct Settings {
    /// Raster width in pixels
    #[clap(long, default_value = "65536")]
    pub width: i64,

    /// Raster height in pixels
    #[clap(long, default_value = "32768")]
    pub height: i64,

    /// Tile edge in pixels
    #[clap(long, default_value = "256")]
    pub tile_size: u32,

    /// Western edge of the raster footprint, degrees
    #[clap(long, default_value = "-10.0", allow_hyphen_values = true)]
    pub west: f64,

    /// Southern edge of the raster footprint, degrees
    #[clap(long, default_value = "35.0", allow_hyphen_values = true)]
    pub south: f64,

    /// Eastern edge of the raster footprint, degrees
    #[clap(long, default_value = "10.0", allow_hyphen_values = true)]
    pub east: f64,

    /// Northern edge of the raster footprint, degrees
    #[clap(long, default_value = "45.0", allow_hyphen_values = true)]
    pub north: f64,

    /// Simulated read latency in milliseconds
    #[clap(long, default_value = "20")]
    pub latency_ms: u64,

    /// Fraction of reads that fail (0.0-1.0)
    #[clap(long, default_value = "0.0")]
    pub error_rate: f64,

    /// Seed of the synthetic failure pattern
    #[clap(long, default_value = "1")]
    pub seed: u64,

    /// Bump the version of the tile under the camera every N frames (0 = never)
    #[clap(long, default_value = "0")]
    pub edit_interval: u64,

    /// Frames in the camera script
    #[clap(long, default_value = "300")]
    pub frames: u64,

    /// Extra frames at the final view waiting for the tree to settle
    #[clap(long, default_value = "200")]
    pub settle_frames: u64,

    /// Frame interval in milliseconds
    #[clap(long, default_value = "16")]
    pub frame_ms: u64,

    /// Viewport width in pixels
    #[clap(long, default_value = "1280")]
    pub viewport_width: u32,

    /// Viewport height in pixels
    #[clap(long, default_value = "720")]
    pub viewport_height: u32,

    /// Texture cache budget in MiB (0 disables the cache)
    #[clap(long, default_value = "256")]
    pub cache_mb: usize,

    /// Fade-in duration of freshly resolved tiles in milliseconds
    #[clap(long, default_value = "0")]
    pub fade_ms: u64,

    /// Level transition bias (positive = coarser)
    #[clap(short, long, default_value = "0.0", allow_hyphen_values = true)]
    pub bias: f64,

    /// Refine tile meshes with the warped "sensor" projection on a worker thread
    #[clap(long)]
    pub precise: bool,

    /// Amplitude of the sensor warp in pixels
    #[clap(long, default_value = "2.0")]
    pub warp_px: f64,

    /// Never composite children into their parent
    #[clap(long)]
    pub no_texture_copy: bool,

    /// Never display ancestor textures while loading
    #[clap(long)]
    pub no_borrow: bool,

    /// Skip the intermediate levels shown during progressive loading
    #[clap(long)]
    pub no_progressive: bool,

    /// Pick the level per tile instead of per view
    #[clap(long)]
    pub adaptive_lod: bool,

    /// Simulate a backend without offscreen render targets
    #[clap(long)]
    pub no_offscreen: bool,

    /// Print per-frame statistics as JSON lines on stdout
    #[clap(long)]
    pub json: bool,
}

impl Settings {
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Engine options for these settings
    pub fn options(&self) -> Options {
        Options {
            level_transition_bias: self.bias,
            texture_copy_enabled: !self.no_texture_copy,
            texture_borrow_enabled: !self.no_borrow,
            progressive_load: !self.no_progressive,
            fade_timer_limit_ms: self.fade_ms,
            adaptive_tile_lod: self.adaptive_lod,
            precise_vertices: self.precise,
            cache_budget_bytes: self.cache_mb << 20,
            ..Options::default()
        }
    }

    /// Raster footprint, `(lng, lat)` degrees
    pub fn bounds(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.west,
                y: self.south,
            },
            Coord {
                x: self.east,
                y: self.north,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let settings = Settings::parse_from(["quadtile-sim"]);
        assert_eq!(settings.tile_size, 256);
        assert!(settings.options().texture_copy_enabled);
        assert_eq!(settings.bounds().min().x, -10.0);
    }

    #[test]
    fn test_flags_map_to_options() {
        let settings = Settings::parse_from([
            "quadtile-sim",
            "--no-texture-copy",
            "--no-borrow",
            "--fade-ms",
            "250",
            "--bias",
            "-0.5",
            "--precise",
            "--cache-mb",
            "8",
        ]);
        let options = settings.options();
        assert!(!options.texture_copy_enabled);
        assert!(!options.texture_borrow_enabled);
        assert!(options.progressive_load);
        assert_eq!(options.fade_timer_limit_ms, 250);
        assert_eq!(options.level_transition_bias, -0.5);
        assert!(options.precise_vertices);
        assert_eq!(options.cache_budget_bytes, 8 << 20);
    }
}
