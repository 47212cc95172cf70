//! Channel subscription table shared by the master director and every
//! in-process shim.
//!
//! A participant is anything that can receive a datagram: a TCP connection
//! on the master, a distributed object or service inside a state server, a
//! client session inside a client agent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct Router<P> {
    subscriptions: HashMap<u64, HashSet<P>>,
    channels: HashMap<P, HashSet<u64>>,
    ranges: Vec<(P, u64, u64)>,
}

impl<P> Default for Router<P> {
    fn default() -> Self {
        Self {
            subscriptions: HashMap::new(),
            channels: HashMap::new(),
            ranges: Vec::new(),
        }
    }
}

impl<P> Router<P>
where
    P: Copy + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `participant` to `channel`.
    ///
    /// Returns true when the channel had no subscribers before, which is the
    /// moment a downstream shim must subscribe upstream.
    pub fn subscribe(&mut self, participant: P, channel: u64) -> bool {
        self.channels.entry(participant).or_default().insert(channel);
        let subscribers = self.subscriptions.entry(channel).or_default();
        let first = subscribers.is_empty();
        subscribers.insert(participant);
        first
    }

    /// Removes one subscription.
    ///
    /// Returns true when this removed the channel's last subscriber.
    pub fn unsubscribe(&mut self, participant: P, channel: u64) -> bool {
        if let Some(channels) = self.channels.get_mut(&participant) {
            channels.remove(&channel);
            if channels.is_empty() {
                self.channels.remove(&participant);
            }
        }

        match self.subscriptions.get_mut(&channel) {
            Some(subscribers) => {
                if !subscribers.remove(&participant) {
                    return false;
                }
                if subscribers.is_empty() {
                    self.subscriptions.remove(&channel);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Drops every subscription and range held by `participant`.
    ///
    /// Returns the channels left with no subscriber at all, sorted.
    pub fn unsubscribe_all(&mut self, participant: P) -> Vec<u64> {
        self.ranges.retain(|(owner, _, _)| *owner != participant);

        let channels = self.channels.remove(&participant).unwrap_or_default();
        let mut emptied = Vec::new();
        for channel in channels {
            if let Some(subscribers) = self.subscriptions.get_mut(&channel) {
                subscribers.remove(&participant);
                if subscribers.is_empty() {
                    self.subscriptions.remove(&channel);
                    emptied.push(channel);
                }
            }
        }
        emptied.sort_unstable();
        emptied
    }

    /// Subscribes to every channel in `[low, high)`.
    pub fn add_range(&mut self, participant: P, low: u64, high: u64) {
        if low >= high {
            return;
        }
        let exists = self
            .ranges
            .iter()
            .any(|&(owner, lo, hi)| owner == participant && lo == low && hi == high);
        if !exists {
            self.ranges.push((participant, low, high));
        }
    }

    /// Removes `[low, high)` from the participant's ranges, splitting any
    /// range that only partly overlaps.
    pub fn remove_range(&mut self, participant: P, low: u64, high: u64) {
        if low >= high {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len());
        for (owner, lo, hi) in self.ranges.drain(..) {
            if owner != participant || hi <= low || lo >= high {
                kept.push((owner, lo, hi));
                continue;
            }
            if lo < low {
                kept.push((owner, lo, low));
            }
            if hi > high {
                kept.push((owner, high, hi));
            }
        }
        self.ranges = kept;
    }

    pub fn is_subscribed(&self, participant: P, channel: u64) -> bool {
        self.subscriptions
            .get(&channel)
            .map_or(false, |subscribers| subscribers.contains(&participant))
            || self
                .ranges
                .iter()
                .any(|&(owner, lo, hi)| owner == participant && (lo..hi).contains(&channel))
    }

    pub fn ranges_of(&self, participant: P) -> Vec<(u64, u64)> {
        self.ranges
            .iter()
            .filter(|(owner, _, _)| *owner == participant)
            .map(|&(_, lo, hi)| (lo, hi))
            .collect()
    }

    /// Parts of `[low, high)` that no participant's range covers.
    pub fn uncovered(&self, low: u64, high: u64) -> Vec<(u64, u64)> {
        let mut spans: Vec<(u64, u64)> = self.ranges.iter().map(|&(_, lo, hi)| (lo, hi)).collect();
        spans.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = low;
        for (lo, hi) in spans {
            if cursor >= high || lo >= high {
                break;
            }
            if hi <= cursor {
                continue;
            }
            if lo > cursor {
                gaps.push((cursor, lo));
            }
            cursor = hi;
        }
        if cursor < high {
            gaps.push((cursor, high));
        }
        gaps
    }

    pub fn has_subscribers(&self, channel: u64) -> bool {
        self.subscriptions.contains_key(&channel)
    }

    pub fn channels_of(&self, participant: P) -> Vec<u64> {
        let mut channels: Vec<u64> = self
            .channels
            .get(&participant)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        channels.sort_unstable();
        channels
    }

    /// Everyone who should receive a datagram addressed to `recipients`.
    ///
    /// Each receiver appears once even if it matches several recipients, and
    /// `sender` never receives its own datagram. The order is deterministic.
    pub fn receivers(&self, recipients: &[u64], sender: Option<P>) -> Vec<P> {
        let mut out = BTreeSet::new();
        for channel in recipients {
            if let Some(subscribers) = self.subscriptions.get(channel) {
                out.extend(subscribers.iter().copied());
            }
            for &(owner, lo, hi) in &self.ranges {
                if (lo..hi).contains(channel) {
                    out.insert(owner);
                }
            }
        }
        if let Some(sender) = sender {
            out.remove(&sender);
        }
        out.into_iter().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn participant_count(&self) -> usize {
        self.channels.len()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
