//! Tile resolve states and the bit flags derived from them

use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Resolve lifecycle of a single tile
///
/// ```text
/// Unresolved -> Resolving -> Resolved
///               Resolving -> Unresolvable      (read error)
/// Resolved | Unresolvable -> Unresolved         (version bump, refresh)
/// Resolving -> Suspended -> Unresolved          (suspend / resume)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
    #[default]
    Unresolved,
    Resolving,
    Resolved,
    Unresolvable,
    Suspended,
}

impl State {
    /// States that end a resolve attempt for the current version
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Resolved | State::Unresolvable)
    }

    #[inline]
    pub(crate) fn mask(self) -> StateMask {
        match self {
            State::Resolved => StateMask::RESOLVED,
            State::Resolving => StateMask::RESOLVING,
            State::Unresolved => StateMask::UNRESOLVED,
            State::Unresolvable => StateMask::UNRESOLVABLE,
            State::Suspended => StateMask::SUSPENDED,
        }
    }
}

bitflags! {
    /// Union of the states found in a subtree
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StateMask: u8 {
        const RESOLVED = 0x01;
        const RESOLVING = 0x02;
        const UNRESOLVED = 0x04;
        const UNRESOLVABLE = 0x08;
        const SUSPENDED = 0x10;
    }
}

bitflags! {
    /// Hints stored alongside a cached texture
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct CacheHints: u32 {
        /// The cached texture holds a complete tile, not a partial update
        const RESOLVED = 0x1;
    }
}
