//! Channel id allocation over a half-open range.
//!
//! Ids are handed out by a forward scan that wraps at the end of the range.
//! A freed id is parked until the scan wraps, so it is never handed straight
//! back out within the same pass.

use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("channel range [{min}, {max}) exhausted")]
    Exhausted { min: u64, max: u64 },
}

#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    min: u64,
    max: u64,
    next: u64,
    used: HashSet<u64>,
    freed: HashSet<u64>,
}

impl ChannelAllocator {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min,
            max: max.max(min),
            next: min,
            used: HashSet::new(),
            freed: HashSet::new(),
        }
    }

    pub fn range(&self) -> (u64, u64) {
        (self.min, self.max)
    }

    pub fn allocate(&mut self) -> Result<u64, AllocatorError> {
        let span = self.max - self.min;
        if self.used.len() as u64 >= span && self.freed.is_empty() {
            return Err(AllocatorError::Exhausted {
                min: self.min,
                max: self.max,
            });
        }

        loop {
            if self.next >= self.max {
                self.next = self.min;
                self.reclaim();
            }

            let candidate = self.next;
            self.next += 1;

            if self.used.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Marks an id as released. It becomes allocatable after the next wrap.
    pub fn free(&mut self, channel: u64) {
        if self.used.contains(&channel) {
            self.freed.insert(channel);
        }
    }

    /// Records an externally chosen id as taken.
    pub fn claim(&mut self, channel: u64) -> bool {
        if channel < self.min || channel >= self.max {
            return false;
        }
        self.freed.remove(&channel);
        self.used.insert(channel)
    }

    pub fn is_used(&self, channel: u64) -> bool {
        self.used.contains(&channel) && !self.freed.contains(&channel)
    }

    /// Ids currently live (allocated and not freed).
    pub fn len(&self) -> usize {
        self.used.len() - self.freed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reclaim(&mut self) {
        for channel in self.freed.drain() {
            self.used.remove(&channel);
        }
    }
}
