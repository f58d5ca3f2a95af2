//! Precise vertex resolution on a background thread
//!
//! Precise image-to-ground solutions (sensor models, for example) can be far
//! too slow to compute on the render thread. [`PreciseVertexResolver`]
//! answers immediately with whatever it knows (a memoized solution, a
//! midpoint of two memoized neighbours, or the approximate transform) and
//! queues the pixel for a worker thread. Each finished solution posts
//! [`EngineEvent::VerticesInvalid`] so the tree rebuilds affected meshes.
//!
//! Solutions survive the resolver through a JSON snapshot parked in the
//! texture cache under [`CacheKey::Coords`].

use crate::cache::{CacheEntry, CacheKey, SharedTextureCache};
use crate::event::{EngineEvent, EventSender};
use crate::projection::GeoTransform;
use crate::resolver::{GridVertex, NodeGrid, VertexResolver};
use crate::view::MapView;
use geo::{Coord, Point};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

type Pixel = (i64, i64);

/// Coarsest grid the expansion pass starts comparing against
const MAX_EXPANSION_GRID: u32 = 16;

#[derive(Debug, Default)]
struct Queue {
    waiting: VecDeque<Pixel>,
    pending: HashSet<Pixel>,
    precise: HashMap<Pixel, Point<f64>>,
    unresolvable: HashSet<Pixel>,
    /// Token of the worker allowed to run; `None` stops every worker
    active: Option<u64>,
    next_token: u64,
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Persisted form of the memoized solutions
#[derive(Debug, Default, Serialize, Deserialize)]
struct CoordinateSnapshot {
    precise: Vec<(i64, i64, f64, f64)>,
    unresolvable: Vec<(i64, i64)>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl CoordinateSnapshot {
    fn capture(queue: &Queue) -> Self {
        Self {
            precise: queue
                .precise
                .iter()
                .map(|(&(x, y), p)| (x, y, p.x(), p.y()))
                .collect(),
            unresolvable: queue.unresolvable.iter().copied().collect(),
        }
    }

    fn restore(self, queue: &mut Queue) {
        for (x, y, lng, lat) in self.precise {
            queue.precise.insert((x, y), Point::new(lng, lat));
        }
        queue.unresolvable.extend(self.unresolvable);
        let Queue {
            waiting,
            pending,
            precise,
            unresolvable,
            ..
        } = queue;
        let known = |p: &Pixel| precise.contains_key(p) || unresolvable.contains(p);
        waiting.retain(|p| !known(p));
        pending.retain(|p| !known(p));
    }
}

/// Midpoint of the first pair of memoized neighbours around `(x, y)`
///
/// Neighbours are one grid step away; horizontal pairs are tried first, then
/// vertical, then the diagonal.
pub(crate) fn interpolate(
    precise: &HashMap<Pixel, Point<f64>>,
    grid: &NodeGrid,
    x: i64,
    y: i64,
) -> Option<Point<f64>> {
    let inc_x = grid.src.width / i64::from(grid.grid_width.max(1));
    let inc_y = grid.src.height / i64::from(grid.grid_height.max(1));
    let pairs = [
        ((x - inc_x, y), (x + inc_x, y)),
        ((x, y - inc_y), (x, y + inc_y)),
        ((x - inc_x, y - inc_y), (x + inc_x, y + inc_y)),
    ];
    pairs.into_iter().find_map(|(a, b)| {
        let (a, b) = (precise.get(&a)?, precise.get(&b)?);
        Some(Point::new((a.x() + b.x()) / 2.0, (a.y() + b.y()) / 2.0))
    })
}

/// Resolves grid vertices through the dataset's precise transform
pub struct PreciseVertexResolver {
    shared: Arc<Shared>,
    transform: Arc<GeoTransform>,
    uri: Arc<str>,
    cache: Option<SharedTextureCache>,
    events: EventSender,
    restored: bool,
    /// Pixels asked for since `begin_draw`
    current_request: HashSet<Pixel>,
    request_nodes: Vec<NodeGrid>,
    current_node: Option<NodeGrid>,
    needs_resolved: usize,
    requested: usize,
    nodes_pending: usize,
    drawn: bool,
}

impl std::fmt::Debug for PreciseVertexResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreciseVertexResolver")
            .field("uri", &self.uri)
            .field("nodes_pending", &self.nodes_pending)
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl PreciseVertexResolver {
    /// The four raster corners are seeded from the approximate transform.
    pub fn new(
        transform: Arc<GeoTransform>,
        width: i64,
        height: i64,
        uri: Arc<str>,
        cache: Option<SharedTextureCache>,
        events: EventSender,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        {
            let mut queue = shared.lock();
            let approx = transform.approximate();
            for (x, y) in [(0, 0), (width, 0), (width, height), (0, height)] {
                queue
                    .precise
                    .insert((x, y), approx.project(x as f64, y as f64));
            }
        }
        Self {
            shared,
            transform,
            uri,
            cache,
            events,
            restored: false,
            current_request: HashSet::new(),
            request_nodes: Vec::new(),
            current_node: None,
            needs_resolved: 0,
            requested: 0,
            nodes_pending: 0,
            drawn: false,
        }
    }

    /// Whether `(x, y)` has a final answer
    pub fn is_memoized(&self, x: i64, y: i64) -> bool {
        let queue = self.shared.lock();
        queue.precise.contains_key(&(x, y)) || queue.unresolvable.contains(&(x, y))
    }

    /// Pixels queued or being solved
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    fn restore_snapshot(&self, queue: &mut Queue) {
        let Some(cache) = &self.cache else {
            return;
        };
        let entry = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&CacheKey::Coords {
                uri: Arc::clone(&self.uri),
            });
        let Some(payload) = entry.and_then(|e| e.payload) else {
            return;
        };
        match serde_json::from_slice::<CoordinateSnapshot>(&payload) {
            Ok(snapshot) => {
                tracing::debug!(
                    "restored {} precise and {} unresolvable vertices for {}",
                    snapshot.precise.len(),
                    snapshot.unresolvable.len(),
                    self.uri
                );
                snapshot.restore(queue);
            }
            Err(err) => tracing::warn!("discarding vertex snapshot for {}: {err}", self.uri),
        }
    }

    /// Queue `pixel` for the worker unless it is already settled or queued
    fn request(&mut self, queue: &mut Queue, pixel: Pixel) {
        if queue.unresolvable.contains(&pixel) {
            return;
        }
        self.needs_resolved += 1;
        self.current_request.insert(pixel);
        if !queue.pending.insert(pixel) {
            self.shared.wake.notify_one();
            return;
        }
        queue.waiting.push_back(pixel);
        if queue.active.is_none() {
            self.spawn_worker(queue);
        }
        self.shared.wake.notify_one();
    }

    fn spawn_worker(&self, queue: &mut Queue) {
        queue.next_token += 1;
        let token = queue.next_token;
        queue.active = Some(token);

        let shared = Arc::clone(&self.shared);
        let transform = Arc::clone(&self.transform);
        let events = self.events.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("precise-vertices-{token}"))
            .spawn(move || run_worker(shared, transform, events, token));
        if let Err(err) = spawned {
            tracing::warn!("failed to start precise vertex worker: {err}");
            queue.active = None;
        }
    }
}

fn run_worker(shared: Arc<Shared>, transform: Arc<GeoTransform>, events: EventSender, token: u64) {
    #[cfg(feature = "profiling")]
    profiling::register_thread!("precise-vertices");
    tracing::debug!("precise vertex worker {token} started");

    let mut finished: Option<(Pixel, Option<Point<f64>>)> = None;
    loop {
        let next = {
            let mut queue = shared.lock();
            if let Some((pixel, solution)) = finished.take()
                && queue.active == Some(token)
            {
                match solution {
                    Some(ground) => {
                        queue.precise.insert(pixel, ground);
                    }
                    None => {
                        queue.unresolvable.insert(pixel);
                    }
                }
                queue.pending.remove(&pixel);
                let _ = events.send(EngineEvent::VerticesInvalid);
            }
            loop {
                if queue.active != Some(token) {
                    tracing::debug!("precise vertex worker {token} stopped");
                    return;
                }
                if let Some(pixel) = queue.waiting.pop_front() {
                    break pixel;
                }
                queue = shared
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let (ground, precise) = transform.image_to_ground(
            Coord {
                x: next.0 as f64,
                y: next.1 as f64,
            },
            true,
        );
        let solved = precise && !ground.x().is_nan() && !ground.y().is_nan();
        finished = Some((next, solved.then_some(ground)));
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl VertexResolver for PreciseVertexResolver {
    fn begin_draw(&mut self, _view: &MapView) {
        self.current_request.clear();
        self.nodes_pending = 0;
    }

    fn begin_node(&mut self, grid: &NodeGrid) {
        self.current_node = Some(*grid);
        self.needs_resolved = 0;
        self.requested = 0;
        self.request_nodes.push(*grid);
    }

    fn project(&mut self, view: &MapView, x: i64, y: i64) -> GridVertex {
        let pixel = (x, y);
        if !view.targeting {
            self.drawn = true;
            self.requested += 1;
            let shared = Arc::clone(&self.shared);
            let mut queue = shared.lock();
            if !self.restored
                && !queue.precise.contains_key(&pixel)
                && !queue.unresolvable.contains(&pixel)
            {
                self.restored = true;
                self.restore_snapshot(&mut queue);
            }
            if let Some(&ground) = queue.precise.get(&pixel) {
                return GridVertex::new(ground, true);
            }
            if queue.unresolvable.contains(&pixel) {
                let ground = self.transform.approximate().project(x as f64, y as f64);
                return GridVertex::new(ground, true);
            }
            self.request(&mut queue, pixel);
            if let Some(ground) = self
                .current_node
                .as_ref()
                .and_then(|grid| interpolate(&queue.precise, grid, x, y))
            {
                return GridVertex::new(ground, false);
            }
        }
        let ground = self.transform.approximate().project(x as f64, y as f64);
        GridVertex::new(ground, false)
    }

    fn end_node(&mut self, _grid: &NodeGrid) {
        self.current_node = None;
        if self.requested > 0 && self.needs_resolved > 0 {
            self.nodes_pending += 1;
        }
    }

    fn end_draw(&mut self, view: &MapView) {
        if !view.targeting && self.drawn && self.nodes_pending == 0 {
            let min_grid = self
                .request_nodes
                .iter()
                .map(|n| n.grid_width)
                .fold(MAX_EXPANSION_GRID, u32::min);
            for node in self.request_nodes.iter().filter(|n| n.grid_width <= min_grid) {
                // coarse levels get denser grids
                let target = 1u32 << (4 - node.level.saturating_mul(2).min(4));
                if node.grid_width < target {
                    let _ = self.events.send(EngineEvent::ExpandGrid {
                        node: node.node,
                        target,
                    });
                }
            }
        }
        self.request_nodes.clear();

        let current = &self.current_request;
        let mut queue = self.shared.lock();
        queue.waiting.retain(|p| current.contains(p));
        queue.pending.retain(|p| current.contains(p));
    }

    fn release(&mut self) -> Vec<CacheEntry> {
        let mut queue = self.shared.lock();
        queue.active = None;
        queue.waiting.clear();
        queue.pending.clear();
        self.shared.wake.notify_all();

        let mut displaced = Vec::new();
        if let Some(cache) = &self.cache
            && (queue.precise.len() > 4 || !queue.unresolvable.is_empty())
        {
            match serde_json::to_vec(&CoordinateSnapshot::capture(&queue)) {
                Ok(payload) => {
                    let entry = CacheEntry {
                        payload: Some(payload),
                        ..Default::default()
                    };
                    displaced = cache.lock().unwrap_or_else(PoisonError::into_inner).put(
                        CacheKey::Coords {
                            uri: Arc::clone(&self.uri),
                        },
                        entry,
                    );
                }
                Err(err) => tracing::warn!("failed to persist vertices for {}: {err}", self.uri),
            }
        }
        queue.precise.clear();
        queue.unresolvable.clear();
        drop(queue);

        self.restored = false;
        self.current_request.clear();
        self.request_nodes.clear();
        displaced
    }
}

impl Drop for PreciseVertexResolver {
    fn drop(&mut self) {
        self.shared.lock().active = None;
        self.shared.wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeId;
    use crate::cache::TextureCache;
    use crate::projection::{AffineProjection, ImageProjection};
    use crate::region::SourceRect;
    use geo::Rect;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::unbounded_channel;

    const SIZE: i64 = 1024;

    fn approx() -> AffineProjection {
        AffineProjection::from_bounds(
            SIZE,
            SIZE,
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
        )
    }

    /// Approximate answer nudged slightly east; counts invocations
    struct Nudged {
        calls: AtomicUsize,
        solvable: bool,
    }

    impl ImageProjection for Nudged {
        fn image_to_ground(&self, image: Coord<f64>) -> Option<Point<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.solvable {
                return None;
            }
            let p = approx().project(image.x, image.y);
            Some(Point::new(p.x() + 1e-6, p.y()))
        }

        fn ground_to_image(&self, ground: Point<f64>) -> Option<Coord<f64>> {
            approx().unproject(ground)
        }
    }

    fn transform(model: Arc<Nudged>) -> Arc<GeoTransform> {
        Arc::new(GeoTransform::new(approx(), Some(model), 256, 256))
    }

    fn model(solvable: bool) -> Arc<Nudged> {
        Arc::new(Nudged {
            calls: AtomicUsize::new(0),
            solvable,
        })
    }

    fn view() -> MapView {
        MapView::new(
            Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
            10.0,
        )
    }

    fn node_id() -> NodeId {
        slotmap::SlotMap::<NodeId, ()>::with_key().insert(())
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for worker");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_corners_are_seeded() {
        let (tx, _rx) = unbounded_channel();
        let resolver =
            PreciseVertexResolver::new(transform(model(true)), SIZE, SIZE, Arc::from("r"), None, tx);
        assert!(resolver.is_memoized(0, 0));
        assert!(resolver.is_memoized(SIZE, SIZE));
        assert!(!resolver.is_memoized(512, 512));
    }

    #[test]
    fn test_resolves_in_background_and_memoizes() {
        let (tx, mut rx) = unbounded_channel();
        let nudged = model(true);
        let mut resolver =
            PreciseVertexResolver::new(transform(Arc::clone(&nudged)), SIZE, SIZE, Arc::from("r"), None, tx);
        let v = view();

        let first = resolver.project(&v, 512, 512);
        assert!(!first.resolved);
        wait_for(|| resolver.is_memoized(512, 512));
        assert_eq!(rx.try_recv(), Ok(EngineEvent::VerticesInvalid));

        let second = resolver.project(&v, 512, 512);
        assert!(second.resolved);
        assert!((second.value.x() - (0.5 + 1e-6)).abs() < 1e-12);
        let third = resolver.project(&v, 512, 512);
        assert_eq!(second.value, third.value);

        // memoized pixels are never handed to the worker again
        assert_eq!(nudged.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.pending_len(), 0);
    }

    #[test]
    fn test_unresolvable_is_final() {
        let (tx, _rx) = unbounded_channel();
        let nudged = model(false);
        let mut resolver =
            PreciseVertexResolver::new(transform(Arc::clone(&nudged)), SIZE, SIZE, Arc::from("r"), None, tx);
        let v = view();

        resolver.project(&v, 256, 256);
        wait_for(|| resolver.is_memoized(256, 256));
        let vertex = resolver.project(&v, 256, 256);
        assert!(vertex.resolved);
        assert_eq!(vertex.value, approx().project(256.0, 256.0));
        assert_eq!(nudged.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_targeting_never_queues() {
        let (tx, _rx) = unbounded_channel();
        let nudged = model(true);
        let mut resolver =
            PreciseVertexResolver::new(transform(Arc::clone(&nudged)), SIZE, SIZE, Arc::from("r"), None, tx);
        let mut v = view();
        v.targeting = true;
        let vertex = resolver.project(&v, 100, 100);
        assert!(!vertex.resolved);
        assert_eq!(resolver.pending_len(), 0);
    }

    #[test]
    fn test_interpolation_prefers_horizontal_neighbours() {
        let grid = NodeGrid {
            node: node_id(),
            level: 0,
            src: SourceRect::new(0, 0, 64, 64),
            grid_width: 4,
            grid_height: 4,
        };
        let mut precise = HashMap::new();
        assert_eq!(interpolate(&precise, &grid, 16, 16), None);

        precise.insert((0, 0), Point::new(0.0, 0.0));
        precise.insert((32, 32), Point::new(2.0, 2.0));
        assert_eq!(
            interpolate(&precise, &grid, 16, 16),
            Some(Point::new(1.0, 1.0))
        );

        precise.insert((16, 0), Point::new(10.0, 10.0));
        precise.insert((16, 32), Point::new(20.0, 20.0));
        assert_eq!(
            interpolate(&precise, &grid, 16, 16),
            Some(Point::new(15.0, 15.0))
        );

        precise.insert((0, 16), Point::new(4.0, 4.0));
        precise.insert((32, 16), Point::new(6.0, 6.0));
        assert_eq!(
            interpolate(&precise, &grid, 16, 16),
            Some(Point::new(5.0, 5.0))
        );
    }

    #[test]
    fn test_snapshot_survives_release() {
        let cache = TextureCache::shared(1 << 20);
        let uri: Arc<str> = Arc::from("snap");
        let (tx, _rx) = unbounded_channel();
        let mut resolver = PreciseVertexResolver::new(
            transform(model(true)),
            SIZE,
            SIZE,
            Arc::clone(&uri),
            Some(Arc::clone(&cache)),
            tx.clone(),
        );
        resolver.project(&view(), 512, 512);
        wait_for(|| resolver.is_memoized(512, 512));
        assert!(resolver.release().is_empty());
        assert!(!resolver.is_memoized(512, 512));
        assert!(cache.lock().unwrap().contains(&CacheKey::Coords {
            uri: Arc::clone(&uri)
        }));

        let fresh = model(true);
        let mut restored = PreciseVertexResolver::new(
            transform(Arc::clone(&fresh)),
            SIZE,
            SIZE,
            uri,
            Some(Arc::clone(&cache)),
            tx,
        );
        let vertex = restored.project(&view(), 512, 512);
        assert!(vertex.resolved);
        assert_eq!(fresh.calls.load(Ordering::SeqCst), 0);
        assert!(cache.lock().unwrap().is_empty());
    }

    #[test]
    fn test_grid_expansion_requested_when_idle() {
        let (tx, mut rx) = unbounded_channel();
        let mut resolver =
            PreciseVertexResolver::new(transform(model(true)), SIZE, SIZE, Arc::from("r"), None, tx);
        let v = view();
        let id = node_id();
        let grid = NodeGrid {
            node: id,
            level: 0,
            src: SourceRect::new(0, 0, SIZE, SIZE),
            grid_width: 1,
            grid_height: 1,
        };
        // corners only: everything is memoized, nothing pending
        resolver.begin_draw(&v);
        resolver.begin_node(&grid);
        for (x, y) in [(0, 0), (SIZE, 0), (0, SIZE), (SIZE, SIZE)] {
            assert!(resolver.project(&v, x, y).resolved);
        }
        resolver.end_node(&grid);
        resolver.end_draw(&v);
        assert_eq!(
            rx.try_recv(),
            Ok(EngineEvent::ExpandGrid {
                node: id,
                target: 16
            })
        );
    }

    #[test]
    fn test_no_expansion_while_nodes_pending() {
        let (tx, mut rx) = unbounded_channel();
        let mut resolver =
            PreciseVertexResolver::new(transform(model(true)), SIZE, SIZE, Arc::from("r"), None, tx);
        let v = view();
        let grid = NodeGrid {
            node: node_id(),
            level: 2,
            src: SourceRect::new(0, 0, SIZE, SIZE),
            grid_width: 1,
            grid_height: 1,
        };
        resolver.begin_draw(&v);
        resolver.begin_node(&grid);
        resolver.project(&v, 300, 300);
        resolver.end_node(&grid);
        resolver.end_draw(&v);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, EngineEvent::ExpandGrid { .. }));
        }
    }
}
