//! Downstream director shim.
//!
//! Services that host many participants (objects, client sessions) route
//! among them locally and mirror the union of their subscriptions to the
//! master director over a single upstream connection.

use crate::director::ControlMessage;
use crate::network::ConnectionHandle;
use crate::router::Router;
use log::{debug, error};
use shared::{DatagramError, DatagramIterator};
use std::hash::Hash;

/// Participant type for services that are a single participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceParticipant;

pub struct LocalDirector<P> {
    router: Router<P>,
    upstream: ConnectionHandle,
}

impl<P> LocalDirector<P>
where
    P: Copy + Eq + Hash + Ord + std::fmt::Debug,
{
    pub fn new(upstream: ConnectionHandle) -> Self {
        Self {
            router: Router::new(),
            upstream,
        }
    }

    pub fn router(&self) -> &Router<P> {
        &self.router
    }

    pub fn subscribe(&mut self, participant: P, channel: u64) {
        if self.router.subscribe(participant, channel) {
            self.send_upstream(ControlMessage::SetChannel(channel).into_bytes());
        }
    }

    pub fn unsubscribe(&mut self, participant: P, channel: u64) {
        if self.router.unsubscribe(participant, channel) {
            self.send_upstream(ControlMessage::RemoveChannel(channel).into_bytes());
        }
    }

    pub fn unsubscribe_all(&mut self, participant: P) {
        let ranges = self.router.ranges_of(participant);
        for channel in self.router.unsubscribe_all(participant) {
            self.send_upstream(ControlMessage::RemoveChannel(channel).into_bytes());
        }
        for (low, high) in ranges {
            self.release_range(low, high);
        }
    }

    /// Range subscriptions are forwarded as-is; the master keeps one copy.
    pub fn add_range(&mut self, participant: P, low: u64, high: u64) {
        self.router.add_range(participant, low, high);
        self.send_upstream(ControlMessage::AddRange(low, high).into_bytes());
    }

    /// Upstream only loses the parts of the range no other local
    /// participant still covers.
    pub fn remove_range(&mut self, participant: P, low: u64, high: u64) {
        self.router.remove_range(participant, low, high);
        self.release_range(low, high);
    }

    fn release_range(&self, low: u64, high: u64) {
        for (lo, hi) in self.router.uncovered(low, high) {
            self.send_upstream(ControlMessage::RemoveRange(lo, hi).into_bytes());
        }
    }

    /// Registers a datagram the master routes if this connection drops.
    pub fn add_post_remove(&self, datagram: Vec<u8>) {
        self.send_upstream(ControlMessage::AddPostRemove(datagram).into_bytes());
    }

    pub fn clear_post_removes(&self) {
        self.send_upstream(ControlMessage::ClearPostRemove.into_bytes());
    }

    pub fn send_upstream(&self, bytes: Vec<u8>) {
        if !self.upstream.send(bytes) {
            error!("Upstream connection is gone, datagram dropped");
        }
    }

    /// Local participants a datagram is addressed to.
    ///
    /// `sender` is excluded; datagrams that arrived from upstream pass
    /// `None` since the master already excluded their origin.
    pub fn receivers(&self, bytes: &[u8], sender: Option<P>) -> Result<Vec<P>, DatagramError> {
        let mut dgi = DatagramIterator::new(bytes);
        let recipients = dgi.read_recipients()?;
        let receivers = self.router.receivers(&recipients, sender);
        if receivers.is_empty() {
            debug!("No local receivers for {:?}", recipients);
        }
        Ok(receivers)
    }
}
