//! Headless simulator for the quadtile engine
//!
//! Builds a tile tree over a synthetic raster, flies a scripted camera over it
//! and logs what every frame drew, read and composited.

mod backend;
mod camera;
mod profiling;
mod settings;
mod source;
mod warp;

use backend::HeadlessBackend;
use camera::Camera;
use geo::Point;
use quadtile_lib::{
    AffineProjection, EngineError, FrameStats, GeoTransform, ImageProjection, State, TileIndex,
    TileSource, TileTree,
};
use serde::Serialize;
use settings::Settings;
use source::SyntheticSource;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use warp::WarpedProjection;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One line of `--json` output
#[derive(Debug, Serialize)]
struct FrameRecord {
    frame: u64,
    state: State,
    #[serde(flatten)]
    stats: FrameStats,
    nodes: usize,
    live_textures: usize,
    live_bytes: usize,
    cache_bytes: usize,
}

fn main() {
    let settings = Settings::from_cli();
    let _profiling = profiling::setup_logging_and_profiling();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(SimError::from)
        .and_then(|rt| rt.block_on(run(settings)));
    if let Err(err) = result {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), SimError> {
    let source = Arc::new(SyntheticSource::new(
        &settings,
        tokio::runtime::Handle::current(),
    ));
    let affine = AffineProjection::from_bounds(settings.width, settings.height, settings.bounds());
    let precise = settings.precise.then(|| {
        Arc::new(WarpedProjection::new(
            affine,
            settings.width,
            settings.height,
            settings.warp_px,
        )) as Arc<dyn ImageProjection>
    });
    let transform = GeoTransform::new(affine, precise, settings.tile_size, settings.tile_size);
    let options = settings.options();
    let cache = (settings.cache_mb > 0).then(|| options.new_cache());
    let mut tree = TileTree::new(source.clone(), transform, options, cache.clone())?;
    let mut backend = HeadlessBackend::new(!settings.no_offscreen);
    let camera = Camera::new(
        settings.bounds(),
        tree.transform().gsd(),
        source.num_levels(),
        settings.frames,
        settings.frame_ms,
        (settings.viewport_width, settings.viewport_height),
    );
    tracing::info!(
        "simulating {} over {} levels, gsd {:.2} m/px",
        source.uri(),
        source.num_levels(),
        tree.transform().gsd()
    );

    let mut interval = tokio::time::interval(Duration::from_millis(settings.frame_ms.max(1)));
    let mut totals = FrameStats::default();
    let mut settled = None;
    let last_frame = settings.frames + settings.settle_frames;
    for frame in 0..=last_frame {
        interval.tick().await;
        let view = camera.view(frame);
        let stats = {
            ::profiling::scope!("frame");
            tree.draw(&view, &mut backend)?
        };
        totals.reads_issued += stats.reads_issued;
        totals.composites += stats.composites;
        totals.tiles_drawn += stats.tiles_drawn;
        totals.borrowed += stats.borrowed;
        totals.placeholders += stats.placeholders;

        if settings.edit_interval > 0 && frame > 0 && frame % settings.edit_interval == 0 {
            edit_under_camera(&tree, &source, view.center, stats.level);
        }

        let state = tree.state();
        let cache_bytes = cache.as_ref().map_or(0, |cache| {
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .used_bytes()
        });
        tracing::info!(
            "frame {frame}: level {}, {} tiles ({} borrowed, {} placeholders), {} reads, {} composites, {state:?}, cache {:.1} MiB",
            stats.level,
            stats.tiles_drawn,
            stats.borrowed,
            stats.placeholders,
            stats.reads_issued,
            stats.composites,
            cache_bytes as f64 / (1024.0 * 1024.0)
        );
        if settings.json {
            let record = FrameRecord {
                frame,
                state,
                stats,
                nodes: tree.len(),
                live_textures: backend.live_textures(),
                live_bytes: backend.live_bytes,
                cache_bytes,
            };
            println!("{}", serde_json::to_string(&record)?);
        }

        if frame >= settings.frames && state.is_terminal() && settings.edit_interval == 0 {
            settled = Some(frame - settings.frames);
            break;
        }
    }

    match settled {
        Some(frames) => tracing::info!("settled {frames} frames after the script ended"),
        None => tracing::warn!("tree still loading after {} settle frames", settings.settle_frames),
    }
    tracing::info!(
        "totals: {} reads, {} composites, {} tiles drawn ({} borrowed, {} placeholders), {} uploads",
        totals.reads_issued,
        totals.composites,
        totals.tiles_drawn,
        totals.borrowed,
        totals.placeholders,
        backend.uploads
    );
    tracing::info!(
        "peak texture memory {:.1} MiB, {} textures live before dispose",
        backend.peak_bytes as f64 / (1024.0 * 1024.0),
        backend.live_textures()
    );

    tree.dispose(&mut backend);
    if backend.live_textures() > 0 || backend.live_offscreen_targets() > 0 {
        tracing::warn!(
            "{} textures and {} offscreen targets leaked after dispose",
            backend.live_textures(),
            backend.live_offscreen_targets()
        );
    }
    if let Some(cache) = cache {
        let cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!("cache after dispose: {cache:?}");
    }
    Ok(())
}

/// Bump the version of the tile at `level` under the camera centre
fn edit_under_camera(tree: &TileTree, source: &SyntheticSource, center: Point<f64>, level: u32) {
    let Some((image, _)) = tree.ground_to_image(center, false) else {
        return;
    };
    let span_x = i64::from(source.tile_width()) << level;
    let span_y = i64::from(source.tile_height()) << level;
    let (x, y) = (image.x as i64, image.y as i64);
    if x < 0 || y < 0 || x >= source.width() || y >= source.height() {
        return;
    }
    source.touch(TileIndex::new(level, x / span_x, y / span_y));
}
