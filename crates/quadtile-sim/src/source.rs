//! Synthetic tile source
//!
//! Serves a checkerboard pyramid after a configurable latency, failing a
//! deterministic fraction of reads. Reads run on the tokio runtime; pixel
//! generation goes to the blocking pool.

use crate::settings::Settings;
use quadtile_lib::{
    PixelRect, ReadEvent, ReadRequest, ReadSink, TextureFormat, TileData, TileIndex, TileSource,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Checkerboard cell edge in tile pixels
const CELL: u32 = 32;

pub struct SyntheticSource {
    uri: String,
    width: i64,
    height: i64,
    tile_size: u32,
    levels: u32,
    latency: Duration,
    error_rate: f64,
    seed: u64,
    versions: Mutex<HashMap<TileIndex, u64>>,
    runtime: Handle,
}

/// Levels needed for the coarsest one to fit in a single tile
pub fn levels_for(width: i64, height: i64, tile_size: u32) -> u32 {
    let mut levels = 1;
    while (i64::from(tile_size) << (levels - 1)) < width.max(height) {
        levels += 1;
    }
    levels
}

impl SyntheticSource {
    pub fn new(settings: &Settings, runtime: Handle) -> Self {
        let levels = levels_for(settings.width, settings.height, settings.tile_size.max(1));
        Self {
            uri: format!(
                "synthetic://{}x{}/{}",
                settings.width, settings.height, settings.tile_size
            ),
            width: settings.width,
            height: settings.height,
            tile_size: settings.tile_size,
            levels,
            latency: Duration::from_millis(settings.latency_ms),
            error_rate: settings.error_rate.clamp(0.0, 1.0),
            seed: settings.seed,
            versions: Mutex::new(HashMap::new()),
            runtime,
        }
    }

    /// Mark `tile` as edited; trees drawing it will read it again
    pub fn touch(&self, tile: TileIndex) -> u64 {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let version = versions.entry(tile).or_insert(0);
        *version += 1;
        tracing::info!("edited tile {tile}, now at version {version}");
        *version
    }

    /// Deterministic per tile and version
    fn should_fail(&self, tile: TileIndex, version: u64) -> bool {
        if self.error_rate <= 0.0 {
            return false;
        }
        let key = self.seed
            ^ (u64::from(tile.level) << 56)
            ^ ((tile.column as u64) << 28)
            ^ (tile.row as u64)
            ^ version.rotate_left(17);
        let unit = (splitmix64(key) >> 11) as f64 / (1u64 << 53) as f64;
        unit < self.error_rate
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// RGBA checkerboard; the shade encodes the level, the tint the version
fn checkerboard(tile: TileIndex, width: u32, height: u32, version: u64) -> TileData {
    profiling::scope!("checkerboard");
    let shade = 255u8.saturating_sub((tile.level * 12).min(200) as u8);
    let tint = (version.wrapping_mul(40) % 256) as u8;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        for x in 0..width {
            let dark = ((x / CELL) + (y / CELL)) % 2 == 0;
            let value = if dark { shade / 2 } else { shade };
            pixels.extend_from_slice(&[value, value, value.saturating_add(tint), 255]);
        }
    }
    TileData {
        width,
        height,
        format: TextureFormat::Rgba8,
        pixels: Arc::from(pixels),
    }
}

impl TileSource for SyntheticSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn width(&self) -> i64 {
        self.width
    }

    fn height(&self) -> i64 {
        self.height
    }

    fn tile_width(&self) -> u32 {
        self.tile_size
    }

    fn tile_height(&self) -> u32 {
        self.tile_size
    }

    fn num_levels(&self) -> u32 {
        self.levels
    }

    fn tile_version(&self, tile: TileIndex) -> u64 {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tile)
            .copied()
            .unwrap_or(0)
    }

    fn async_read(&self, request: ReadRequest, sink: ReadSink) {
        let tile = request.tile;
        let width = self.tile_pixel_width(tile.level, tile.column);
        let height = self.tile_pixel_height(tile.level, tile.row);
        let version = self.tile_version(tile);
        let fail = self.should_fail(tile, version);
        let latency = self.latency;

        sink.send(ReadEvent::Created);
        self.runtime.spawn(async move {
            sink.send(ReadEvent::Started);
            tokio::time::sleep(latency).await;
            if request.is_canceled() {
                sink.canceled();
                return;
            }
            if fail {
                sink.error(format!("synthetic failure reading {tile}"));
                return;
            }
            let data =
                tokio::task::spawn_blocking(move || checkerboard(tile, width, height, version))
                    .await;
            match data {
                Ok(data) => {
                    sink.update(data, PixelRect::new(0, 0, width, height));
                    sink.completed();
                }
                Err(err) => {
                    sink.error(err.to_string());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_for() {
        assert_eq!(levels_for(256, 256, 256), 1);
        assert_eq!(levels_for(257, 100, 256), 2);
        assert_eq!(levels_for(65536, 32768, 256), 9);
    }

    #[test]
    fn test_checkerboard_layout() {
        let data = checkerboard(TileIndex::new(0, 0, 0), 64, 40, 0);
        assert_eq!(data.pixels.len(), 64 * 40 * 4);
        // first cell dark, its right neighbour light
        assert_eq!(data.pixels[0], 127);
        assert_eq!(data.pixels[(CELL as usize) * 4], 255);
    }

    #[tokio::test]
    async fn test_failure_pattern_is_deterministic() {
        let settings = <Settings as clap::Parser>::parse_from([
            "quadtile-sim",
            "--error-rate",
            "0.5",
        ]);
        let source = SyntheticSource::new(&settings, Handle::current());
        let tiles: Vec<_> = (0..64).map(|i| TileIndex::new(0, i, 0)).collect();
        let first: Vec<bool> = tiles.iter().map(|t| source.should_fail(*t, 0)).collect();
        let again: Vec<bool> = tiles.iter().map(|t| source.should_fail(*t, 0)).collect();
        assert_eq!(first, again);
        assert!(first.iter().any(|f| *f));
        assert!(first.iter().any(|f| !*f));

        source.touch(tiles[0]);
        assert_eq!(source.tile_version(tiles[0]), 1);
        assert_eq!(source.tile_version(tiles[1]), 0);
    }
}
