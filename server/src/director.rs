//! Master message director.
//!
//! Every service connects here over TCP. Control datagrams change the
//! sending connection's subscriptions; everything else is routed by channel
//! to every subscribed connection except the one it came from.

use crate::config::MessageDirectorConfig;
use crate::network::{spawn_listener, ConnectionHandle, ConnectionId, NetworkEvent};
use crate::router::Router;
use log::{debug, error, info, warn};
use shared::datagram::is_control;
use shared::msgtypes::{
    CONTROL_ADD_POST_REMOVE, CONTROL_ADD_RANGE, CONTROL_CLEAR_POST_REMOVE, CONTROL_REMOVE_CHANNEL,
    CONTROL_REMOVE_RANGE, CONTROL_SET_CHANNEL,
};
use shared::{Datagram, DatagramError, DatagramIterator};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Parsed control datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SetChannel(u64),
    RemoveChannel(u64),
    AddRange(u64, u64),
    RemoveRange(u64, u64),
    /// Raw datagram routed when the sender's connection drops.
    AddPostRemove(Vec<u8>),
    ClearPostRemove,
    Unknown(u16),
}

impl ControlMessage {
    /// Parses a datagram already known to address the control channel.
    pub fn parse(bytes: &[u8]) -> Result<Self, DatagramError> {
        let mut dgi = DatagramIterator::new(bytes);
        dgi.read_recipients()?;
        let subtype = dgi.get_uint16()?;
        Ok(match subtype {
            CONTROL_SET_CHANNEL => Self::SetChannel(dgi.get_channel()?),
            CONTROL_REMOVE_CHANNEL => Self::RemoveChannel(dgi.get_channel()?),
            CONTROL_ADD_RANGE => Self::AddRange(dgi.get_channel()?, dgi.get_channel()?),
            CONTROL_REMOVE_RANGE => Self::RemoveRange(dgi.get_channel()?, dgi.get_channel()?),
            CONTROL_ADD_POST_REMOVE => Self::AddPostRemove(dgi.remaining_bytes().to_vec()),
            CONTROL_CLEAR_POST_REMOVE => Self::ClearPostRemove,
            other => Self::Unknown(other),
        })
    }

    pub fn to_datagram(&self) -> Datagram {
        match self {
            Self::SetChannel(channel) => {
                let mut dg = Datagram::control(CONTROL_SET_CHANNEL);
                dg.add_channel(*channel);
                dg
            }
            Self::RemoveChannel(channel) => {
                let mut dg = Datagram::control(CONTROL_REMOVE_CHANNEL);
                dg.add_channel(*channel);
                dg
            }
            Self::AddRange(low, high) => {
                let mut dg = Datagram::control(CONTROL_ADD_RANGE);
                dg.add_channel(*low);
                dg.add_channel(*high);
                dg
            }
            Self::RemoveRange(low, high) => {
                let mut dg = Datagram::control(CONTROL_REMOVE_RANGE);
                dg.add_channel(*low);
                dg.add_channel(*high);
                dg
            }
            Self::AddPostRemove(bytes) => {
                let mut dg = Datagram::control(CONTROL_ADD_POST_REMOVE);
                dg.add_bytes(bytes);
                dg
            }
            Self::ClearPostRemove => Datagram::control(CONTROL_CLEAR_POST_REMOVE),
            Self::Unknown(subtype) => Datagram::control(*subtype),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.to_datagram().into_bytes()
    }
}

#[derive(Debug)]
struct Participant {
    handle: ConnectionHandle,
    post_removes: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutingStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub controls: u64,
}

pub struct MessageDirector {
    config: MessageDirectorConfig,
    router: Router<ConnectionId>,
    participants: HashMap<ConnectionId, Participant>,
    stats: RoutingStats,
}

impl MessageDirector {
    pub fn new(config: MessageDirectorConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            participants: HashMap::new(),
            stats: RoutingStats::default(),
        }
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn router(&self) -> &Router<ConnectionId> {
        &self.router
    }

    pub fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected { handle } => {
                info!("Participant {} connected from {}", handle.id(), handle.peer());
                self.participants.insert(
                    handle.id(),
                    Participant {
                        handle,
                        post_removes: Vec::new(),
                    },
                );
            }
            NetworkEvent::Frame { id, bytes } => {
                if is_control(&bytes) {
                    self.handle_control(id, &bytes);
                } else {
                    self.route(&bytes, Some(id));
                }
            }
            NetworkEvent::Disconnected { id } => self.remove_participant(id),
        }
    }

    /// Applies a control datagram to the connection that sent it.
    fn handle_control(&mut self, id: ConnectionId, bytes: &[u8]) {
        self.stats.controls += 1;

        let message = match ControlMessage::parse(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed control datagram from {}: {}", id, e);
                return;
            }
        };

        match message {
            ControlMessage::SetChannel(channel) => {
                debug!("{} subscribed to {}", id, channel);
                self.router.subscribe(id, channel);
            }
            ControlMessage::RemoveChannel(channel) => {
                debug!("{} unsubscribed from {}", id, channel);
                self.router.unsubscribe(id, channel);
            }
            ControlMessage::AddRange(low, high) => self.router.add_range(id, low, high),
            ControlMessage::RemoveRange(low, high) => self.router.remove_range(id, low, high),
            ControlMessage::AddPostRemove(datagram) => match self.participants.get_mut(&id) {
                Some(participant) => participant.post_removes.push(datagram),
                None => debug!("Post remove from unknown participant {}", id),
            },
            ControlMessage::ClearPostRemove => {
                if let Some(participant) = self.participants.get_mut(&id) {
                    participant.post_removes.clear();
                }
            }
            ControlMessage::Unknown(subtype) => {
                warn!("Unknown control subtype {} from {}", subtype, id);
            }
        }
    }

    /// Routes a datagram to every subscriber of its recipients.
    ///
    /// Returns the number of connections it was queued for.
    pub fn route(&mut self, bytes: &[u8], origin: Option<ConnectionId>) -> usize {
        let mut dgi = DatagramIterator::new(bytes);
        let recipients = match dgi.read_recipients() {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!("Dropping unroutable datagram from {:?}: {}", origin, e);
                self.stats.dropped += 1;
                return 0;
            }
        };

        self.stats.routed += 1;
        let mut delivered = 0;
        for receiver in self.router.receivers(&recipients, origin) {
            let Some(participant) = self.participants.get(&receiver) else {
                continue;
            };
            if participant.handle.send(bytes.to_vec()) {
                delivered += 1;
            } else {
                error!("Failed to queue datagram for {}", receiver);
            }
        }
        self.stats.delivered += delivered as u64;
        delivered
    }

    /// Routes the participant's post removes, then drops its subscriptions.
    fn remove_participant(&mut self, id: ConnectionId) {
        let Some(participant) = self.participants.remove(&id) else {
            return;
        };
        info!(
            "Participant {} ({}) disconnected, {} post removes",
            id,
            participant.handle.peer(),
            participant.post_removes.len()
        );

        for datagram in &participant.post_removes {
            self.route(datagram, Some(id));
        }
        self.router.unsubscribe_all(id);
    }

    fn log_stats(&self) {
        debug!(
            "{} participants, {} channels, routed {} delivered {} dropped {} controls {}",
            self.participants.len(),
            self.router.channel_count(),
            self.stats.routed,
            self.stats.delivered,
            self.stats.dropped,
            self.stats.controls
        );
    }

    /// Binds, then runs the routing loop on the current task.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let (addr, events) = spawn_listener(&self.config.bind_addr).await?;
        info!("Message director listening on {}", addr);
        self.serve(events).await;
        Ok(())
    }

    /// Binds and runs the routing loop in the background.
    pub async fn spawn(self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let (addr, events) = spawn_listener(&self.config.bind_addr).await?;
        info!("Message director listening on {}", addr);
        tokio::spawn(self.serve(events));
        Ok(addr)
    }

    pub async fn serve(mut self, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        let mut stats_interval = interval(self.config.stats_interval);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Message director shutting down");
                        break;
                    }
                },
                _ = stats_interval.tick() => self.log_stats(),
            }
        }
    }
}
