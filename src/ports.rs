//! Host port assignment for game servers.
//!
//! Ports are drawn from `[BASE_PORT, BASE_PORT + span]` with
//! [`RESERVED_PORT`] never handed out. [`allocate`] is the historical
//! id-derived heuristic; [`PortAllocator::next`] starts from the same
//! candidate but refuses ports that are already in use.

use std::collections::HashSet;

use crate::error::{Error, Result};

pub const BASE_PORT: u16 = 25565;
pub const RESERVED_PORT: u16 = 25577;
pub const DEFAULT_SPAN: u16 = 1000;

/// `BASE_PORT + last_assigned_id`, with the reserved port bumped by one.
///
/// Assumes ids are dense and monotonic. Nothing here looks at ports already
/// handed out: ids 12 and 13 both land on 25578, and records inserted out of
/// order collide freely.
pub fn allocate(last_assigned_id: u64) -> u16 {
    let offset = u16::try_from(last_assigned_id).unwrap_or(u16::MAX);
    let candidate = BASE_PORT.saturating_add(offset);
    if candidate == RESERVED_PORT {
        candidate + 1
    } else {
        candidate
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    base: u16,
    last: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_SPAN)
    }
}

impl PortAllocator {
    pub fn new(span: u16) -> Self {
        Self {
            base: BASE_PORT,
            last: BASE_PORT.saturating_add(span),
        }
    }

    /// First free port at or after `allocate(last_assigned_id)`, wrapping to
    /// the bottom of the range once the top is reached.
    pub fn next(&self, last_assigned_id: u64, in_use: &HashSet<u16>) -> Result<u16> {
        let start = allocate(last_assigned_id).clamp(self.base, self.last);
        let free = |port: &u16| *port != RESERVED_PORT && !in_use.contains(port);

        (start..=self.last)
            .chain(self.base..start)
            .find(free)
            .ok_or(Error::PortsExhausted {
                first: self.base,
                last: self.last,
            })
    }
}
