//! End-to-end traversal scenarios against a manually answered source

mod common;

use common::{Backend, MockSource, answer, tree_with, view_at_level};
use quadtile_lib::{
    DEFAULT_CACHE_BUDGET_BYTES, DrawSource, EngineError, FrameStats, Options, State, TextureCache,
    TileIndex, TileTree,
};
use std::sync::Arc;

fn frame(tree: &mut TileTree, backend: &mut Backend, level: u32, version: u64) -> FrameStats {
    let view = view_at_level(tree, level, version);
    tree.draw(&view, backend).unwrap()
}

/// Every borrow link is recorded on both ends
fn assert_borrows_consistent(tree: &TileTree) {
    for id in tree.node_ids() {
        let node = tree.node(id).unwrap();
        if let Some(lender) = node.lend_from() {
            let lender = tree.node(lender).expect("lender is alive");
            assert!(lender.borrowers().contains(&id));
        }
        for borrower in node.borrowers() {
            let borrower = tree.node(*borrower).expect("borrower is alive");
            assert_eq!(borrower.lend_from(), Some(id));
        }
    }
}

const ROOT: TileIndex = TileIndex::new(2, 0, 0);

#[test]
fn test_root_resolves_from_single_read() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    let stats = frame(&mut tree, &mut backend, 2, 1);
    assert_eq!(stats.reads_issued, 1);
    assert_eq!(stats.placeholders, 1);
    assert_eq!(tree.state(), State::Resolving);
    assert_eq!(source.answer_all(), vec![ROOT]);

    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(stats.tiles_drawn, 1);
    assert_eq!(tree.state(), State::Resolved);
    assert_eq!(backend.uploads, 1);
    let root = tree.node(tree.root()).unwrap();
    assert_eq!(root.draw_source(), Some(DrawSource::Texture));
    assert_eq!(backend.draws.last().unwrap().texture, root.texture().map(|t| t.id));
}

#[test]
fn test_children_borrow_parent_until_resolved() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 2);
    let root_texture = tree.node(tree.root()).unwrap().texture().map(|t| t.id);
    assert!(root_texture.is_some());

    backend.draws.clear();
    let stats = frame(&mut tree, &mut backend, 1, 3);
    assert_eq!(stats.level, 1);
    assert_eq!(stats.reads_issued, 4);
    assert_eq!(stats.borrowed, 4);
    assert_eq!(backend.draws.len(), 4);
    assert!(backend.draws.iter().all(|d| d.texture == root_texture));
    assert_eq!(source.pending().len(), 4);
    assert!(source.pending().iter().all(|t| t.level == 1));
    assert_borrows_consistent(&tree);

    source.answer_all();
    let stats = frame(&mut tree, &mut backend, 1, 4);
    assert_eq!(stats.borrowed, 0);
    assert_eq!(stats.tiles_drawn, 4);
    assert_borrows_consistent(&tree);
    assert!(tree.node(tree.root()).unwrap().texture().is_none());
    assert_eq!(tree.state(), State::Resolved);
}

#[test]
fn test_error_then_version_bump_rereads_once() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    assert_eq!(source.fail_all("decode error"), vec![ROOT]);

    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Unresolvable);
    assert_eq!(tree.state(), State::Unresolvable);
    let stats = frame(&mut tree, &mut backend, 2, 3);
    assert_eq!(stats.reads_issued, 0);

    source.bump_version(ROOT);
    let stats = frame(&mut tree, &mut backend, 2, 4);
    assert_eq!(stats.reads_issued, 1);
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Resolving);
    let stats = frame(&mut tree, &mut backend, 2, 5);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(source.pending(), vec![ROOT]);
}

#[test]
fn test_version_bump_rereads_resolved_tile_once() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Resolved);

    source.bump_version(ROOT);
    let stats = frame(&mut tree, &mut backend, 2, 3);
    assert_eq!(stats.reads_issued, 1);
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Resolving);
    let stats = frame(&mut tree, &mut backend, 2, 4);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(source.pending(), vec![ROOT]);

    source.answer_all();
    let stats = frame(&mut tree, &mut backend, 2, 5);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(tree.state(), State::Resolved);
}

#[test]
fn test_refresh_rereads_resolved_tiles() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(tree.state(), State::Resolved);

    tree.refresh();
    let stats = frame(&mut tree, &mut backend, 2, 3);
    assert_eq!(stats.reads_issued, 1);
    source.answer_all();
    let stats = frame(&mut tree, &mut backend, 2, 4);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(tree.state(), State::Resolved);
}

#[test]
fn test_suspend_cancels_and_resume_rereads() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    tree.suspend();
    let reads = source.take_reads();
    assert_eq!(reads.len(), 1);
    assert!(reads[0].0.is_canceled());
    assert_eq!(tree.state(), State::Suspended);

    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.reads_issued, 0);

    tree.resume();
    let stats = frame(&mut tree, &mut backend, 2, 3);
    assert_eq!(stats.reads_issued, 1);

    // the canceled request answering late changes nothing
    answer(&reads[0].1);
    frame(&mut tree, &mut backend, 2, 4);
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Resolving);
    assert_eq!(backend.uploads, 0);
}

#[test]
fn test_children_composite_into_parent_without_read() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    let stats = frame(&mut tree, &mut backend, 1, 1);
    assert_eq!(stats.reads_issued, 4);
    source.answer_all();

    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(stats.composites, 1);
    assert_eq!(backend.composites, 1);
    assert_eq!(backend.offscreen_live, 0);

    let root = tree.node(tree.root()).unwrap();
    assert_eq!(root.state(), State::Resolved);
    assert_eq!(root.draw_source(), Some(DrawSource::Texture));
    assert!(root.children().iter().all(Option::is_none));
    assert_eq!(backend.live.len(), 1);
}

#[test]
fn test_offscreen_failure_falls_back_to_reads() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 1, 1);
    source.answer_all();

    backend.fail_offscreen = true;
    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.composites, 0);
    assert_eq!(stats.reads_issued, 1);
    assert_eq!(source.pending(), vec![ROOT]);
    assert!(!tree.texture_copy_available());

    // the failure sticks for the rest of the session
    backend.fail_offscreen = false;
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 3);
    assert!(!tree.texture_copy_available());
    assert_eq!(tree.node(tree.root()).unwrap().state(), State::Resolved);
}

#[test]
fn test_failed_composite_disables_texture_copy() {
    let source = Arc::new(MockSource::default());
    let mut tree = tree_with(source.clone(), Options::default(), None);
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 1, 1);
    source.answer_all();

    backend.fail_composite = true;
    let stats = frame(&mut tree, &mut backend, 2, 2);
    assert_eq!(stats.composites, 0);
    assert_eq!(stats.reads_issued, 1);
    assert!(!tree.texture_copy_available());
    assert_eq!(backend.offscreen_live, 0);
}

#[test]
fn test_cache_serves_zoom_out_and_back_in() {
    let source = Arc::new(MockSource::default());
    let cache = TextureCache::shared(DEFAULT_CACHE_BUDGET_BYTES);
    let mut tree = tree_with(source.clone(), Options::default(), Some(cache.clone()));
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 2);
    frame(&mut tree, &mut backend, 1, 3);
    source.answer_all();
    frame(&mut tree, &mut backend, 1, 4);
    assert!(tree.node(tree.root()).unwrap().texture().is_none());
    assert_eq!(cache.lock().unwrap().len(), 1);

    let stats = frame(&mut tree, &mut backend, 2, 5);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(
        tree.node(tree.root()).unwrap().draw_source(),
        Some(DrawSource::Texture)
    );
    assert_eq!(cache.lock().unwrap().len(), 4);

    let stats = frame(&mut tree, &mut backend, 1, 6);
    assert_eq!(stats.reads_issued, 0);
    assert_eq!(stats.tiles_drawn, 4);
    assert_eq!(stats.borrowed, 0);
    assert!(source.pending().is_empty());
    assert_borrows_consistent(&tree);
}

#[test]
fn test_dispose_releases_every_texture() {
    let source = Arc::new(MockSource::default());
    let cache = TextureCache::shared(DEFAULT_CACHE_BUDGET_BYTES);
    let mut tree = tree_with(source.clone(), Options::default(), Some(cache.clone()));
    let mut backend = Backend::default();

    frame(&mut tree, &mut backend, 2, 1);
    source.answer_all();
    frame(&mut tree, &mut backend, 2, 2);
    frame(&mut tree, &mut backend, 1, 3);
    assert!(!backend.live.is_empty());

    tree.dispose(&mut backend);
    assert!(tree.is_disposed());
    assert!(backend.live.is_empty());
    assert_eq!(backend.offscreen_live, 0);
    assert!(cache.lock().unwrap().is_empty());

    let view = view_at_level(&tree, 2, 4);
    assert!(matches!(
        tree.draw(&view, &mut backend),
        Err(EngineError::Disposed)
    ));
    tree.dispose(&mut backend);
}
