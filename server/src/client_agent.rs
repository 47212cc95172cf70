//! Client agent: the boundary between game clients and the cluster.
//!
//! Every accepted socket gets a session channel from the allocator and a
//! `ClientSession`. Sessions subscribe through a `LocalDirector`, so a
//! datagram one session sends to another on this agent (a relog eject, say)
//! is delivered without a round trip through the master director.

use crate::client_session::{ClientSession, SessionEffect};
use crate::config::ClientAgentConfig;
use crate::context::AppContext;
use crate::local::LocalDirector;
use crate::network::{connect_upstream, spawn_listener, ConnectionHandle, ConnectionId, NetworkEvent};
use log::{debug, error, info, warn};
use shared::{ChannelAllocator, Schema};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

struct Client {
    handle: ConnectionHandle,
    session: ClientSession,
}

pub struct ClientAgent {
    schema: Arc<Schema>,
    config: ClientAgentConfig,
    local: LocalDirector<ConnectionId>,
    allocator: ChannelAllocator,
    clients: HashMap<ConnectionId, Client>,
    outbox: VecDeque<(ConnectionId, Vec<u8>)>,
}

impl ClientAgent {
    pub fn new(ctx: &AppContext, upstream: ConnectionHandle) -> Self {
        let config = ctx.config.client_agent.clone();
        Self {
            schema: Arc::clone(&ctx.schema),
            allocator: ChannelAllocator::new(config.channel_min, config.channel_max),
            config,
            local: LocalDirector::new(upstream),
            clients: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn session(&self, id: ConnectionId) -> Option<&ClientSession> {
        self.clients.get(&id).map(|client| &client.session)
    }

    /// Handles an event from the client listener.
    pub fn handle_client_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connected { handle } => self.accept(handle),
            NetworkEvent::Frame { id, bytes } => {
                let Some(client) = self.clients.get_mut(&id) else {
                    return;
                };
                let effects = client.session.handle_client(&bytes);
                self.apply(id, effects);
            }
            NetworkEvent::Disconnected { id } => {
                if self.clients.contains_key(&id) {
                    info!("Client {} lost connection", id);
                    self.drop_client(id);
                }
            }
        }
        self.flush();
    }

    fn accept(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        let channel = match self.allocator.allocate() {
            Ok(channel) => channel,
            Err(e) => {
                error!("Refusing client {} from {}: {}", id, handle.peer(), e);
                handle.close();
                return;
            }
        };
        info!("Client {} from {} got channel {}", id, handle.peer(), channel);

        let mut session = ClientSession::new(channel, Arc::clone(&self.schema), self.config.clone());
        let effects = session.open();
        self.clients.insert(id, Client { handle, session });
        self.apply(id, effects);
    }

    /// Handles a datagram routed to us by the master director.
    pub fn handle_upstream(&mut self, bytes: &[u8]) {
        match self.local.receivers(bytes, None) {
            Ok(receivers) => {
                for receiver in receivers {
                    self.deliver(receiver, bytes);
                }
            }
            Err(e) => warn!("Dropping malformed datagram from upstream: {}", e),
        }
        self.flush();
    }

    fn deliver(&mut self, receiver: ConnectionId, bytes: &[u8]) {
        let Some(client) = self.clients.get_mut(&receiver) else {
            return;
        };
        let effects = client.session.handle_server(bytes);
        self.apply(receiver, effects);
    }

    /// Carries out a session's effects in order.
    fn apply(&mut self, id: ConnectionId, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::ToClient(bytes) => {
                    if let Some(client) = self.clients.get(&id) {
                        client.handle.send(bytes);
                    }
                }
                SessionEffect::ToServer(bytes) => self.outbox.push_back((id, bytes)),
                SessionEffect::Subscribe(channel) => self.local.subscribe(id, channel),
                SessionEffect::Unsubscribe(channel) => self.local.unsubscribe(id, channel),
                SessionEffect::Close => {
                    self.drop_client(id);
                    return;
                }
            }
        }
    }

    /// Runs the session's cleanup and releases everything it held.
    fn drop_client(&mut self, id: ConnectionId) {
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        for effect in client.session.on_disconnect() {
            if let SessionEffect::ToServer(bytes) = effect {
                self.outbox.push_back((id, bytes));
            }
        }
        self.local.unsubscribe_all(id);
        self.allocator.free(client.session.channel());
        client.handle.close();
        debug!("Client {} released channel {}", id, client.session.channel());
    }

    /// Routes everything sessions queued, locally first and then upstream.
    fn flush(&mut self) {
        while let Some((origin, bytes)) = self.outbox.pop_front() {
            match self.local.receivers(&bytes, Some(origin)) {
                Ok(receivers) => {
                    for receiver in receivers {
                        self.deliver(receiver, &bytes);
                    }
                }
                Err(e) => {
                    error!("Session built an unroutable datagram: {}", e);
                    continue;
                }
            }
            self.local.send_upstream(bytes);
        }
    }

    /// Times out overdue requests of every session.
    pub fn prune(&mut self, now: Instant) {
        let mut ids: Vec<ConnectionId> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            let effects = client.session.prune_requests(now);
            self.apply(id, effects);
        }
        self.flush();
    }

    /// Connects upstream, binds the client port and serves until the
    /// message director goes away.
    pub async fn run(ctx: AppContext) -> Result<(), Box<dyn std::error::Error>> {
        let (agent, upstream_events, client_events, addr) = Self::connect(&ctx).await?;
        info!("Client agent accepting clients on {}", addr);
        agent.serve(upstream_events, client_events).await;
        Err("lost connection to the message director".into())
    }

    /// Like `run`, but serves in the background. Returns the client address.
    pub async fn spawn(ctx: AppContext) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let (agent, upstream_events, client_events, addr) = Self::connect(&ctx).await?;
        info!("Client agent accepting clients on {}", addr);
        tokio::spawn(agent.serve(upstream_events, client_events));
        Ok(addr)
    }

    #[allow(clippy::type_complexity)]
    async fn connect(
        ctx: &AppContext,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<NetworkEvent>,
            mpsc::UnboundedReceiver<NetworkEvent>,
            SocketAddr,
        ),
        Box<dyn std::error::Error>,
    > {
        let (upstream, upstream_events) = connect_upstream(&ctx.config.client_agent.md_addr).await?;
        let (addr, client_events) = spawn_listener(&ctx.config.client_agent.bind_addr).await?;
        Ok((ClientAgent::new(ctx, upstream), upstream_events, client_events, addr))
    }

    pub async fn serve(
        mut self,
        mut upstream_events: mpsc::UnboundedReceiver<NetworkEvent>,
        mut client_events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) {
        let mut prune_interval = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = upstream_events.recv() => match event {
                    Some(NetworkEvent::Frame { bytes, .. }) => self.handle_upstream(&bytes),
                    Some(NetworkEvent::Connected { .. }) => {}
                    Some(NetworkEvent::Disconnected { .. }) | None => {
                        error!("Lost connection to the message director");
                        break;
                    }
                },
                event = client_events.recv() => match event {
                    Some(event) => self.handle_client_event(event),
                    None => {
                        error!("Client listener stopped");
                        break;
                    }
                },
                _ = prune_interval.tick() => self.prune(Instant::now()),
            }
        }

        for id in self.clients.keys().copied().collect::<Vec<_>>() {
            self.drop_client(id);
        }
        self.flush();
    }
}
