//! Client interests and the objects they are waiting on.

use std::collections::BTreeSet;

/// A client's standing request to see every object in some zones of one
/// parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub handle: u16,
    pub context: u32,
    pub parent_id: u32,
    pub zones: Vec<u32>,
    /// Set once the zone query completed.
    pub done: bool,
    /// Opened by an AI on the client's behalf; gets no client-facing ack.
    pub ai: bool,
    /// Objects generated before the query completed, in arrival order.
    pub pending: Vec<u32>,
}

impl Interest {
    pub fn new(handle: u16, context: u32, parent_id: u32, zones: Vec<u32>, ai: bool) -> Self {
        Self {
            handle,
            context,
            parent_id,
            zones,
            done: false,
            ai,
            pending: Vec::new(),
        }
    }

    pub fn covers(&self, parent_id: u32, zone_id: u32) -> bool {
        self.parent_id == parent_id && self.zones.contains(&zone_id)
    }

    pub fn add_pending(&mut self, do_id: u32) {
        if !self.pending.contains(&do_id) {
            self.pending.push(do_id);
        }
    }
}

/// Zones of `old` that nobody covers once it is replaced by
/// `(new_parent, new_zones)`. `others` are the client's remaining interests.
pub fn killed_zones(old: &Interest, new_parent: u32, new_zones: &[u32], others: &[Interest]) -> BTreeSet<u32> {
    old.zones
        .iter()
        .copied()
        .filter(|zone| !(new_parent == old.parent_id && new_zones.contains(zone)))
        .filter(|zone| !others.iter().any(|other| other.covers(old.parent_id, *zone)))
        .collect()
}

/// A generated object held back until every interest that saw it finished
/// its query. `datagrams` are complete server datagrams in arrival order.
#[derive(Debug, Clone)]
pub struct PendingObject {
    pub do_id: u32,
    pub dc_id: u16,
    pub parent_id: u32,
    pub zone_id: u32,
    pub datagrams: Vec<Vec<u8>>,
}

/// What the client has been told about an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub do_id: u32,
    pub dc_id: u16,
    pub parent_id: u32,
    pub zone_id: u32,
}
