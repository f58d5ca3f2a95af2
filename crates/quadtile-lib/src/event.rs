//! Messages posted onto the render-affinity queue by worker threads

use crate::NodeId;
use crate::source::ReadEvent;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Work for the render thread; drained at the start of every draw
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Progress of a tile read issued for `node`
    Read {
        node: NodeId,
        request: u64,
        event: ReadEvent,
    },
    /// New precise vertex solutions are available
    VerticesInvalid,
    /// Refine the mesh grid of `node` up to `target` subdivisions
    ExpandGrid { node: NodeId, target: u32 },
}

pub type EventSender = UnboundedSender<EngineEvent>;
pub type EventReceiver = UnboundedReceiver<EngineEvent>;
