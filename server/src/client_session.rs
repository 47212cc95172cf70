//! One connected game client as seen by the client agent.
//!
//! A session never touches sockets or the router. Every handler returns the
//! `SessionEffect`s the agent must carry out, in order: frames for the
//! client, datagrams for the cluster, subscription changes and closing the
//! connection. That keeps the whole visibility state machine testable with
//! plain byte buffers.

use crate::client_state::{ClientState, DisconnectReason};
use crate::config::ClientAgentConfig;
use crate::interest::{killed_zones, Interest, ObjectInfo, PendingObject};
use crate::names::{check_wish_name, compose_pattern_name, NamePattern};
use log::{debug, info, warn};
use shared::channels::{
    account_channel, client_sender_channel, location_as_channel, puppet_channel, CLIENTS_CHANNEL,
    DBSERVERS_CHANNEL, OTP_DO_ID_CENTRAL_LOGGER, OTP_DO_ID_FRIEND_MANAGER, OTP_DO_ID_TOONTOWN,
    STATESERVERS_CHANNEL,
};
use shared::msgtypes::*;
use shared::{Datagram, DatagramError, DatagramIterator, Schema};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

type Result<T> = std::result::Result<T, DatagramError>;

/// Avatar slots per account.
pub const MAX_AVATARS: u8 = 6;

/// Server messages passed to the client untouched apart from the header.
const FORWARDED_MSG_TYPES: [u16; 4] = [
    CLIENT_FRIEND_ONLINE,
    CLIENT_FRIEND_OFFLINE,
    CLIENT_GET_FRIEND_LIST_RESP,
    CLIENT_SYSTEM_MESSAGE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEffect {
    /// A client-protocol datagram for this session's socket.
    ToClient(Vec<u8>),
    /// A server datagram for the cluster.
    ToServer(Vec<u8>),
    Subscribe(u64),
    Unsubscribe(u64),
    /// Flush and close the socket; the session is finished.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarSlot {
    pub av_id: u32,
    pub name: String,
    pub dna: Vec<u8>,
    pub pos: u8,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub disl_id: u32,
    pub avatars: Vec<AvatarSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Login { username: String },
    GetAvatars,
    CreateAvatar { pos: u8, dna: Vec<u8> },
    SetAvatar { av_id: u32 },
    DeleteAvatar { av_id: u32 },
    GetFriendList,
}

#[derive(Debug)]
struct PendingRequest {
    request: Request,
    deadline: Instant,
}

pub struct ClientSession {
    channel: u64,
    schema: Arc<Schema>,
    config: ClientAgentConfig,
    state: ClientState,
    interests: Vec<Interest>,
    visible: HashMap<u32, ObjectInfo>,
    owned: HashMap<u32, ObjectInfo>,
    uberdogs: HashSet<u32>,
    pending: HashMap<u32, PendingObject>,
    account: Option<Account>,
    avatar_id: u32,
    setting_avatar: Option<u32>,
    requests: HashMap<u32, PendingRequest>,
    next_context: u32,
    effects: Vec<SessionEffect>,
    closed: bool,
}

impl ClientSession {
    pub fn new(channel: u64, schema: Arc<Schema>, config: ClientAgentConfig) -> Self {
        Self {
            channel,
            schema,
            config,
            state: ClientState::New,
            interests: Vec::new(),
            visible: HashMap::new(),
            owned: HashMap::new(),
            uberdogs: HashSet::from([OTP_DO_ID_CENTRAL_LOGGER, OTP_DO_ID_FRIEND_MANAGER]),
            pending: HashMap::new(),
            account: None,
            avatar_id: 0,
            setting_avatar: None,
            requests: HashMap::new(),
            next_context: 0,
            effects: Vec::new(),
            closed: false,
        }
    }

    pub fn channel(&self) -> u64 {
        self.channel
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn avatar_id(&self) -> u32 {
        self.avatar_id
    }

    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn interests(&self) -> &[Interest] {
        &self.interests
    }

    pub fn is_visible(&self, do_id: u32) -> bool {
        self.visible.contains_key(&do_id)
    }

    pub fn is_owned(&self, do_id: u32) -> bool {
        self.owned.contains_key(&do_id)
    }

    pub fn is_pending(&self, do_id: u32) -> bool {
        self.pending.contains_key(&do_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Subscriptions every session starts with.
    pub fn open(&mut self) -> Vec<SessionEffect> {
        self.subscribe(self.channel);
        self.subscribe(CLIENTS_CHANNEL);
        self.take_effects()
    }

    /// Handles a datagram from the client's socket.
    pub fn handle_client(&mut self, bytes: &[u8]) -> Vec<SessionEffect> {
        if !self.closed {
            if let Err(e) = self.receive_client(bytes) {
                warn!("Client {} sent a malformed datagram: {}", self.channel, e);
                self.kick(DisconnectReason::InternalError, "Malformed datagram.");
            }
        }
        self.take_effects()
    }

    /// Handles a server datagram routed to this session.
    pub fn handle_server(&mut self, bytes: &[u8]) -> Vec<SessionEffect> {
        if !self.closed {
            if let Err(e) = self.receive_server(bytes) {
                warn!("Client {} dropped a malformed server datagram: {}", self.channel, e);
            }
        }
        self.take_effects()
    }

    /// Fails every correlated request whose deadline has passed.
    pub fn prune_requests(&mut self, now: Instant) -> Vec<SessionEffect> {
        let mut expired: Vec<u32> = self
            .requests
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(context, _)| *context)
            .collect();
        expired.sort_unstable();

        for context in expired {
            if self.closed {
                break;
            }
            if let Some(pending) = self.requests.remove(&context) {
                warn!("Client {} request {:?} timed out", self.channel, pending.request);
                if let Err(e) = self.fail_request(context, pending.request) {
                    warn!("Could not report timeout to client {}: {}", self.channel, e);
                }
            }
        }
        self.take_effects()
    }

    /// Final cleanup once the socket is gone or the session was kicked.
    pub fn on_disconnect(&mut self) -> Vec<SessionEffect> {
        if self.avatar_id != 0 {
            if let Err(e) = self.delete_avatar_ram() {
                warn!("Could not delete avatar of client {}: {}", self.channel, e);
            }
        }
        self.closed = true;
        self.effects.retain(|effect| *effect != SessionEffect::Close);
        self.take_effects()
    }

    fn take_effects(&mut self) -> Vec<SessionEffect> {
        std::mem::take(&mut self.effects)
    }

    fn to_client(&mut self, bytes: Vec<u8>) {
        self.effects.push(SessionEffect::ToClient(bytes));
    }

    fn to_server(&mut self, bytes: Vec<u8>) {
        self.effects.push(SessionEffect::ToServer(bytes));
    }

    fn subscribe(&mut self, channel: u64) {
        self.effects.push(SessionEffect::Subscribe(channel));
    }

    fn unsubscribe(&mut self, channel: u64) {
        self.effects.push(SessionEffect::Unsubscribe(channel));
    }

    fn transition(&mut self, to: ClientState) {
        if self.state.can_transition(to) {
            debug!("Client {} {} -> {}", self.channel, self.state, to);
            self.state = to;
        } else {
            warn!("Client {} refused transition {} -> {}", self.channel, self.state, to);
        }
    }

    /// Tells the client why it is being dropped, then closes.
    fn kick(&mut self, reason: DisconnectReason, text: &str) {
        self.kick_with_code(reason.code(), text);
    }

    fn kick_with_code(&mut self, code: u16, text: &str) {
        info!("Booting client {} with index {}: \"{}\"", self.channel, code, text);
        let mut dg = Datagram::client(CLIENT_GO_GET_LOST);
        dg.add_uint16(code);
        if dg.add_string16(text).is_err() {
            dg.add_uint16(0);
        }
        self.to_client(dg.into_bytes());
        self.closed = true;
        self.effects.push(SessionEffect::Close);
    }

    fn new_request(&mut self, request: Request) -> u32 {
        self.next_context = self.next_context.wrapping_add(1).max(1);
        let context = self.next_context;
        self.requests.insert(
            context,
            PendingRequest {
                request,
                deadline: Instant::now() + self.config.request_timeout,
            },
        );
        context
    }

    fn has_request(&self, predicate: impl Fn(&Request) -> bool) -> bool {
        self.requests.values().any(|pending| predicate(&pending.request))
    }

    fn object_exists(&self, do_id: u32) -> bool {
        self.visible.contains_key(&do_id) || self.owned.contains_key(&do_id) || self.uberdogs.contains(&do_id)
    }

    fn known_class(&self, do_id: u32) -> Option<u16> {
        self.visible
            .get(&do_id)
            .or_else(|| self.owned.get(&do_id))
            .map(|info| info.dc_id)
    }

    fn receive_client(&mut self, bytes: &[u8]) -> Result<()> {
        let mut dgi = DatagramIterator::new(bytes);
        let msg_type = dgi.get_uint16()?;
        if msg_type != CLIENT_OBJECT_UPDATE_FIELD {
            debug!("Got {} from client {}", msg_name(msg_type), self.channel);
        }

        match msg_type {
            CLIENT_HEARTBEAT => {
                self.to_client(bytes.to_vec());
                return Ok(());
            }
            CLIENT_DISCONNECT => {
                info!("Client {} disconnecting", self.channel);
                self.closed = true;
                self.effects.push(SessionEffect::Close);
                return Ok(());
            }
            _ => {}
        }

        if !self.state.accepts(msg_type) {
            debug!(
                "Unexpected {} ({}) from client {} in state {}",
                msg_name(msg_type),
                msg_type,
                self.channel,
                self.state
            );
            return Ok(());
        }

        match msg_type {
            CLIENT_LOGIN_2 => self.receive_login(&mut dgi),
            CLIENT_GET_AVATARS => self.receive_get_avatars(),
            CLIENT_CREATE_AVATAR => self.receive_create_avatar(&mut dgi),
            CLIENT_SET_AVATAR => self.receive_set_avatar(&mut dgi),
            CLIENT_SET_WISHNAME => self.receive_set_wishname(&mut dgi),
            CLIENT_SET_NAME_PATTERN => self.receive_set_name_pattern(&mut dgi),
            CLIENT_DELETE_AVATAR => self.receive_delete_avatar(&mut dgi),
            CLIENT_GET_FRIEND_LIST => self.receive_get_friend_list(),
            CLIENT_ADD_INTEREST => self.receive_add_interest(&mut dgi, false),
            CLIENT_REMOVE_INTEREST => self.receive_remove_interest(&mut dgi, false),
            CLIENT_OBJECT_UPDATE_FIELD => self.receive_update_field(&mut dgi),
            CLIENT_OBJECT_LOCATION => self.receive_client_location(&mut dgi),
            _ => Ok(()),
        }
    }

    /// `CLIENT_LOGIN_2(play_token, server_version, hash, token_type, want_magic_words)`
    fn receive_login(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let play_token = dgi.get_string16()?;
        let server_version = dgi.get_string16()?;
        let _hash = dgi.get_uint32()?;
        let _token_type = dgi.get_int32()?;
        let _want_magic_words = dgi.get_string16()?;

        if server_version != self.config.server_version {
            let text = format!(
                "Client version {} does not match server version {}.",
                server_version, self.config.server_version
            );
            self.kick(DisconnectReason::OutdatedClient, &text);
            return Ok(());
        }

        if self.has_request(|r| matches!(r, Request::Login { .. })) {
            debug!("Client {} sent a second login while one is pending", self.channel);
            return Ok(());
        }

        if play_token.is_empty() {
            if self.config.allow_anonymous {
                self.transition(ClientState::Anonymous);
                self.send_login_response("")?;
                info!("Client {} logged in anonymously", self.channel);
            } else {
                self.kick(DisconnectReason::LoginError, "Anonymous logins are not allowed.");
            }
            return Ok(());
        }

        let context = self.new_request(Request::Login {
            username: play_token.clone(),
        });
        self.send_account_query(context, &play_token)
    }

    fn send_account_query(&mut self, context: u32, username: &str) -> Result<()> {
        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_ACCOUNT_QUERY)?;
        dg.add_uint32(context);
        dg.add_string16(username)?;
        self.to_server(dg.into_bytes());
        Ok(())
    }

    fn send_login_response(&mut self, username: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut dg = Datagram::client(CLIENT_LOGIN_2_RESP);
        dg.add_uint8(0);
        dg.add_string16("")?;
        dg.add_string16(username)?;
        dg.add_uint8(1);
        dg.add_uint32(now.as_secs() as u32);
        dg.add_uint32(now.subsec_micros());
        dg.add_uint8(1);
        self.to_client(dg.into_bytes());
        Ok(())
    }

    fn receive_get_avatars(&mut self) -> Result<()> {
        let Some(username) = self.account.as_ref().map(|a| a.username.clone()) else {
            debug!("Client {} asked for avatars without an account", self.channel);
            return Ok(());
        };
        if self.has_request(|r| *r == Request::GetAvatars) {
            return Ok(());
        }
        let context = self.new_request(Request::GetAvatars);
        self.send_account_query(context, &username)
    }

    /// `(return_code u8, count u16, (av_id, name, dna, pos)...)`, used for both
    /// the avatar list and the delete reply.
    fn send_avatar_list(&mut self, msg_type: u16, return_code: u8) -> Result<()> {
        let avatars = self.account.as_ref().map(|a| a.avatars.clone()).unwrap_or_default();
        let mut dg = Datagram::client(msg_type);
        dg.add_uint8(return_code);
        dg.add_uint16(avatars.len() as u16);
        for slot in &avatars {
            dg.add_uint32(slot.av_id);
            dg.add_string16(&slot.name)?;
            dg.add_blob16(&slot.dna)?;
            dg.add_uint8(slot.pos);
        }
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `ACCOUNT_QUERY_RESP(context, disl_id, count u8, (av_id, name, dna, pos)...)`
    fn handle_account_response(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let context = dgi.get_uint32()?;
        let Some(pending) = self.requests.remove(&context) else {
            debug!("Client {} got an account response for unknown context {}", self.channel, context);
            return Ok(());
        };

        let disl_id = dgi.get_uint32()?;
        let count = dgi.get_uint8()?;
        let mut avatars = Vec::with_capacity(count as usize);
        for _ in 0..count {
            avatars.push(AvatarSlot {
                av_id: dgi.get_uint32()?,
                name: dgi.get_string16()?,
                dna: dgi.get_blob16()?.to_vec(),
                pos: dgi.get_uint8()?,
            });
        }

        match pending.request {
            Request::Login { username } => {
                // An older session on the same account gets kicked first.
                let mut eject = Datagram::server(&[account_channel(disl_id)], self.channel, CLIENT_AGENT_EJECT)?;
                eject.add_uint16(DisconnectReason::Relogged.code());
                eject.add_string16("This account has been logged in from elsewhere.")?;
                self.to_server(eject.into_bytes());
                self.subscribe(account_channel(disl_id));

                self.account = Some(Account {
                    username: username.clone(),
                    disl_id,
                    avatars,
                });
                self.transition(ClientState::Authenticated);
                self.send_login_response(&username)?;
                info!("Client {} logged in as {} (account {})", self.channel, username, disl_id);
            }
            Request::GetAvatars => {
                if let Some(account) = self.account.as_mut() {
                    account.avatars = avatars;
                }
                self.transition(ClientState::AvatarChooser);
                self.send_avatar_list(CLIENT_GET_AVATARS_RESP, 0)?;
            }
            Request::DeleteAvatar { av_id } => {
                if let Some(account) = self.account.as_mut() {
                    account.avatars = avatars;
                }
                info!("Client {} deleted avatar {}", self.channel, av_id);
                self.send_avatar_list(CLIENT_DELETE_AVATAR_RESP, 0)?;
            }
            other => warn!("Client {}: account response answered {:?}", self.channel, other),
        }
        Ok(())
    }

    /// `CLIENT_CREATE_AVATAR(dna blob16, pos u8)`
    fn receive_create_avatar(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let dna = dgi.get_blob16()?.to_vec();
        let pos = dgi.get_uint8()?;

        let Some(disl_id) = self.account.as_ref().map(|a| a.disl_id) else {
            return Ok(());
        };
        let taken = self
            .account
            .as_ref()
            .map_or(false, |a| a.avatars.iter().any(|slot| slot.pos == pos));
        let schema = Arc::clone(&self.schema);
        let dclass = schema.class_by_name(&self.config.avatar_class);

        let (Some(dclass), false, true) = (dclass, taken, pos < MAX_AVATARS) else {
            debug!("Client {} cannot create an avatar in slot {}", self.channel, pos);
            return self.send_create_avatar_response(0, 1, 0);
        };

        let mut fields = Vec::new();
        if let Some(field) = schema.class_field(dclass, "setDNAString") {
            let mut packed = Datagram::new();
            packed.add_blob16(&dna)?;
            fields.push((field.number, packed.into_bytes()));
        }
        if let Some(field) = schema.class_field(dclass, "setDISLid") {
            fields.push((field.number, disl_id.to_le_bytes().to_vec()));
        }

        let context = self.new_request(Request::CreateAvatar { pos, dna });
        self.transition(ClientState::CreatingAvatar);

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_CREATE_STORED_OBJECT)?;
        dg.add_uint32(context);
        dg.add_uint16(dclass.number);
        dg.add_uint16(fields.len() as u16);
        for (number, data) in &fields {
            dg.add_uint16(*number);
            dg.add_bytes(data);
        }
        self.to_server(dg.into_bytes());
        Ok(())
    }

    fn send_create_avatar_response(&mut self, context: u32, return_code: u8, av_id: u32) -> Result<()> {
        let mut dg = Datagram::client(CLIENT_CREATE_AVATAR_RESP);
        dg.add_uint16(context as u16);
        dg.add_uint8(return_code);
        dg.add_uint32(av_id);
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `CREATE_STORED_OBJECT_RESP(context, failed u8, do_id)`
    fn handle_create_object_response(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let context = dgi.get_uint32()?;
        let failed = dgi.get_uint8()? != 0;
        let av_id = dgi.get_uint32()?;

        let Some(pending) = self.requests.remove(&context) else {
            debug!("Client {} got a create response for unknown context {}", self.channel, context);
            return Ok(());
        };
        let Request::CreateAvatar { pos, dna } = pending.request else {
            warn!("Client {}: create response answered {:?}", self.channel, pending.request);
            return Ok(());
        };

        if failed || av_id == 0 {
            warn!("Avatar creation for client {} failed", self.channel);
            self.transition(ClientState::AvatarChooser);
            return self.send_create_avatar_response(context, 1, 0);
        }

        let Some(account) = self.account.as_mut() else {
            return Ok(());
        };
        account.avatars.push(AvatarSlot {
            av_id,
            name: String::new(),
            dna,
            pos,
        });
        let disl_id = account.disl_id;

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_ACCOUNT_SET_AVATAR)?;
        dg.add_uint32(disl_id);
        dg.add_uint8(pos);
        dg.add_uint32(av_id);
        self.to_server(dg.into_bytes());

        info!("Client {} created avatar {} in slot {}", self.channel, av_id, pos);
        self.send_create_avatar_response(context, 0, av_id)
    }

    /// `CLIENT_SET_AVATAR(av_id)`; zero leaves the game.
    fn receive_set_avatar(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let av_id = dgi.get_uint32()?;

        if self.state == ClientState::PlayGame {
            if av_id == 0 {
                info!("Client {} left the game with avatar {}", self.channel, self.avatar_id);
                self.delete_avatar_ram()?;
                self.transition(ClientState::AvatarChooser);
            } else {
                debug!("Client {} tried to switch avatars while playing", self.channel);
            }
            return Ok(());
        }

        if av_id == 0 {
            return Ok(());
        }
        if self.has_request(|r| matches!(r, Request::CreateAvatar { .. })) {
            debug!("Client {} picked an avatar before creation finished", self.channel);
            return Ok(());
        }

        if !self.owns_avatar(av_id) {
            warn!("Client {} tried to play avatar {} of another account", self.channel, av_id);
            self.kick(DisconnectReason::InternalError, "Tried to play an avatar you do not own.");
            return Ok(());
        }

        let Some(dclass) = self.schema.class_by_name(&self.config.avatar_class).map(|c| c.number) else {
            warn!("Avatar class {} is not in the schema", self.config.avatar_class);
            return self.send_avatar_details_failure(av_id);
        };

        let context = self.new_request(Request::SetAvatar { av_id });
        self.setting_avatar = Some(av_id);
        self.transition(ClientState::SettingAvatar);

        let mut dg = Datagram::server(
            &[STATESERVERS_CHANNEL],
            self.channel,
            STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT,
        )?;
        dg.add_uint32(av_id);
        dg.add_uint32(0);
        dg.add_uint32(0);
        dg.add_channel(self.channel);
        dg.add_uint16(dclass);
        dg.add_uint32(context);
        self.to_server(dg.into_bytes());
        Ok(())
    }

    fn owns_avatar(&self, av_id: u32) -> bool {
        self.account
            .as_ref()
            .map_or(false, |a| a.avatars.iter().any(|slot| slot.av_id == av_id))
    }

    /// Writes an approved name to the database and the cached slot.
    fn store_avatar_name(&mut self, av_id: u32, name: &str) -> Result<()> {
        let Some(number) = self
            .schema
            .class_by_name(&self.config.avatar_class)
            .and_then(|dclass| dclass.field_number("setName"))
        else {
            warn!("Avatar class {} has no setName", self.config.avatar_class);
            return Ok(());
        };

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_SET_STORED_VALUES)?;
        dg.add_uint32(av_id);
        dg.add_uint16(1);
        dg.add_uint16(number);
        dg.add_string16(name)?;
        self.to_server(dg.into_bytes());

        if let Some(slot) = self
            .account
            .as_mut()
            .and_then(|a| a.avatars.iter_mut().find(|slot| slot.av_id == av_id))
        {
            slot.name = name.to_string();
        }
        info!("Avatar {} of client {} is now named {}", av_id, self.channel, name);
        Ok(())
    }

    /// `CLIENT_SET_WISHNAME(av_id, name)`. An av_id of zero only checks the
    /// name; otherwise an approved name is applied straight away.
    fn receive_set_wishname(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let av_id = dgi.get_uint32()?;
        let name = dgi.get_string16()?;

        if av_id != 0 && !self.owns_avatar(av_id) {
            warn!("Client {} tried to name avatar {} of another account", self.channel, av_id);
            self.kick(DisconnectReason::InternalError, "Tried to name an avatar you do not own.");
            return Ok(());
        }

        let (approved, rejected) = match check_wish_name(&name) {
            Ok(approved) => {
                if av_id != 0 {
                    self.store_avatar_name(av_id, &approved)?;
                }
                (approved, String::new())
            }
            Err(e) => {
                debug!("Client {} wish name {:?} rejected: {}", self.channel, name, e);
                (String::new(), name)
            }
        };

        let mut dg = Datagram::client(CLIENT_SET_WISHNAME_RESP);
        dg.add_uint32(av_id);
        dg.add_uint16(0);
        dg.add_string16("")?;
        dg.add_string16(&approved)?;
        dg.add_string16(&rejected)?;
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `CLIENT_SET_NAME_PATTERN(av_id, 4 x (index i16, flag i16))`
    fn receive_set_name_pattern(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let av_id = dgi.get_uint32()?;
        let mut pattern: NamePattern = [(-1, 0); 4];
        for part in pattern.iter_mut() {
            *part = (dgi.get_int16()?, dgi.get_int16()?);
        }

        let return_code = if !self.owns_avatar(av_id) {
            debug!("Client {} sent a name pattern for avatar {}", self.channel, av_id);
            1
        } else {
            match compose_pattern_name(&pattern) {
                Ok(name) => {
                    self.store_avatar_name(av_id, &name)?;
                    0
                }
                Err(e) => {
                    debug!("Client {} name pattern {:?} rejected: {}", self.channel, pattern, e);
                    1
                }
            }
        };

        let mut dg = Datagram::client(CLIENT_SET_NAME_PATTERN_ANSWER);
        dg.add_uint32(av_id);
        dg.add_uint8(return_code);
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `CLIENT_DELETE_AVATAR(av_id)`: drops the stored avatar, then answers
    /// with the refreshed avatar list.
    fn receive_delete_avatar(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let av_id = dgi.get_uint32()?;
        if !self.owns_avatar(av_id) {
            warn!("Client {} tried to delete avatar {} of another account", self.channel, av_id);
            self.kick(DisconnectReason::InternalError, "Tried to delete an avatar you do not own.");
            return Ok(());
        }
        let Some(username) = self.account.as_ref().map(|a| a.username.clone()) else {
            return Ok(());
        };
        if self.has_request(|r| matches!(r, Request::DeleteAvatar { .. })) {
            debug!("Client {} is already deleting an avatar", self.channel);
            return Ok(());
        }

        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_DELETE_STORED_OBJECT)?;
        dg.add_uint32(av_id);
        self.to_server(dg.into_bytes());

        // Answered after the delete, both travel the same connection.
        let context = self.new_request(Request::DeleteAvatar { av_id });
        self.send_account_query(context, &username)
    }

    fn receive_get_friend_list(&mut self) -> Result<()> {
        if self.has_request(|r| *r == Request::GetFriendList) {
            return Ok(());
        }
        let context = self.new_request(Request::GetFriendList);
        let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], self.channel, DBSERVER_GET_FRIEND_LIST)?;
        dg.add_uint32(context);
        dg.add_uint32(self.avatar_id);
        self.to_server(dg.into_bytes());
        Ok(())
    }

    /// `GET_FRIEND_LIST_RESP(context, error u8, count u16, (do_id, name, dna)...)`
    fn handle_friend_list_response(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let context = dgi.get_uint32()?;
        let Some(pending) = self.requests.remove(&context) else {
            debug!("Client {} got a friend list for unknown context {}", self.channel, context);
            return Ok(());
        };
        if pending.request != Request::GetFriendList {
            warn!("Client {}: friend list answered {:?}", self.channel, pending.request);
            return Ok(());
        }

        let error = dgi.get_uint8()?;
        let count = dgi.get_uint16()?;
        let mut dg = Datagram::client(CLIENT_GET_FRIEND_LIST_RESP);
        dg.add_uint8(error);
        dg.add_uint16(count);
        for _ in 0..count {
            dg.add_uint32(dgi.get_uint32()?);
            dg.add_string16(&dgi.get_string16()?)?;
            dg.add_blob16(dgi.get_blob16()?)?;
            // No pets.
            dg.add_uint32(0);
        }
        self.to_client(dg.into_bytes());
        Ok(())
    }

    fn send_friend_list_failure(&mut self) {
        let mut dg = Datagram::client(CLIENT_GET_FRIEND_LIST_RESP);
        dg.add_uint8(1);
        dg.add_uint16(0);
        self.to_client(dg.into_bytes());
    }

    fn send_avatar_details_failure(&mut self, av_id: u32) -> Result<()> {
        let mut dg = Datagram::client(CLIENT_GET_AVATAR_DETAILS_RESP);
        dg.add_uint32(av_id);
        dg.add_uint8(1);
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `CREATE_WITH_REQUIRED_CONTEXT_RESP(context, failed u8, do_id)`
    fn handle_activation_response(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let context = dgi.get_uint32()?;
        let failed = dgi.get_uint8()? != 0;
        let do_id = dgi.get_uint32()?;

        let Some(pending) = self.requests.remove(&context) else {
            debug!("Client {} got an activation response for unknown context {}", self.channel, context);
            return Ok(());
        };
        let Request::SetAvatar { av_id } = pending.request else {
            warn!("Client {}: activation response answered {:?}", self.channel, pending.request);
            return Ok(());
        };

        if failed || do_id != av_id {
            warn!("Activating avatar {} for client {} failed", av_id, self.channel);
            self.setting_avatar = None;
            self.transition(ClientState::AvatarChooser);
            return self.send_avatar_details_failure(av_id);
        }
        debug!("Avatar {} active, waiting for ownership", av_id);
        Ok(())
    }

    fn delete_avatar_ram(&mut self) -> Result<()> {
        let av_id = self.avatar_id;
        let mut dg = Datagram::server(&[av_id as u64], self.channel, STATESERVER_OBJECT_DELETE_RAM)?;
        dg.add_uint32(av_id);
        self.to_server(dg.into_bytes());

        self.owned.remove(&av_id);
        self.unsubscribe(puppet_channel(av_id));
        self.avatar_id = 0;
        Ok(())
    }

    fn fail_request(&mut self, context: u32, request: Request) -> Result<()> {
        match request {
            Request::Login { .. } => {
                self.kick(DisconnectReason::LoginError, "Login timed out.");
                Ok(())
            }
            Request::GetAvatars => self.send_avatar_list(CLIENT_GET_AVATARS_RESP, 1),
            Request::DeleteAvatar { .. } => self.send_avatar_list(CLIENT_DELETE_AVATAR_RESP, 1),
            Request::GetFriendList => {
                self.send_friend_list_failure();
                Ok(())
            }
            Request::CreateAvatar { .. } => {
                self.transition(ClientState::AvatarChooser);
                self.send_create_avatar_response(context, 1, 0)
            }
            Request::SetAvatar { av_id } => {
                self.setting_avatar = None;
                self.transition(ClientState::AvatarChooser);
                self.send_avatar_details_failure(av_id)
            }
        }
    }

    /// `ADD_INTEREST(handle, context, parent, zone...)`, also used for
    /// `CLIENT_AGENT_SET_INTEREST`.
    fn receive_add_interest(&mut self, dgi: &mut DatagramIterator<'_>, ai: bool) -> Result<()> {
        let handle = dgi.get_uint16()?;
        let context = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;

        let mut zones = Vec::with_capacity(dgi.remaining() / 4);
        while dgi.remaining() >= 4 {
            let zone = dgi.get_uint32()?;
            if !zones.contains(&zone) {
                zones.push(zone);
            }
        }

        debug!(
            "Client {} requests interest {} (context {}) in {} {:?}",
            self.channel, handle, context, parent_id, zones
        );

        if self.state.limited_interest() && parent_id != OTP_DO_ID_TOONTOWN {
            debug!(
                "Client {} requested interest in {} while {}, ignoring",
                self.channel, parent_id, self.state
            );
            return Ok(());
        }

        self.add_interest(handle, context, parent_id, zones, ai)
    }

    fn add_interest(&mut self, handle: u16, context: u32, parent_id: u32, zones: Vec<u32>, ai: bool) -> Result<()> {
        if let Some(index) = self.interests.iter().position(|i| i.handle == handle) {
            let previous = self.interests.remove(index);
            let killed = killed_zones(&previous, parent_id, &zones, &self.interests);
            debug!(
                "Altering interest {} (done: {}): {:?} -> {:?}, killed zones {:?}",
                handle, previous.done, previous.zones, zones, killed
            );
            self.disable_zones(previous.parent_id, &killed);
        }

        let done = zones.is_empty();
        let mut interest = Interest::new(handle, context, parent_id, zones.clone(), ai);
        interest.done = done;
        self.interests.push(interest);
        self.drop_unneeded_pending();

        if done {
            if !ai {
                self.send_done_interest(handle, context);
            }
            return Ok(());
        }

        // Subscribe before querying so no broadcast in between is missed.
        for zone in &zones {
            self.subscribe(location_as_channel(parent_id, *zone));
        }

        let mut query = Datagram::server(&[parent_id as u64], self.channel, STATESERVER_QUERY_ZONE_OBJECT_ALL)?;
        query.add_uint16(handle);
        query.add_uint32(context);
        query.add_uint32(parent_id);
        for zone in &zones {
            query.add_uint32(*zone);
        }
        self.to_server(query.into_bytes());
        Ok(())
    }

    /// Disables visible objects in zones nobody watches any more and drops
    /// those zone channels.
    fn disable_zones(&mut self, parent_id: u32, zones: &BTreeSet<u32>) {
        if zones.is_empty() {
            return;
        }
        let mut doomed: Vec<u32> = self
            .visible
            .values()
            .filter(|info| info.parent_id == parent_id && zones.contains(&info.zone_id))
            .map(|info| info.do_id)
            .collect();
        doomed.sort_unstable();

        for do_id in doomed {
            debug!("Object {} killed by interest change", do_id);
            self.visible.remove(&do_id);
            self.send_disable(do_id);
        }
        for zone in zones {
            self.unsubscribe(location_as_channel(parent_id, *zone));
        }
    }

    fn drop_unneeded_pending(&mut self) {
        let interests = &self.interests;
        self.pending
            .retain(|do_id, _| interests.iter().any(|i| i.pending.contains(do_id)));
    }

    /// `REMOVE_INTEREST(handle[, context])`, also used for
    /// `CLIENT_AGENT_REMOVE_INTEREST`.
    fn receive_remove_interest(&mut self, dgi: &mut DatagramIterator<'_>, ai: bool) -> Result<()> {
        let handle = dgi.get_uint16()?;
        let context = if dgi.remaining() >= 4 {
            Some(dgi.get_uint32()?)
        } else {
            None
        };

        let Some(index) = self.interests.iter().position(|i| i.handle == handle) else {
            debug!(
                "Client {} removed unknown interest {} (context {:?})",
                self.channel, handle, context
            );
            return Ok(());
        };

        let interest = self.interests.remove(index);
        let uninterested = killed_zones(&interest, interest.parent_id, &[], &self.interests);
        debug!(
            "Client {} removed interest {}, releasing zones {:?}",
            self.channel, handle, uninterested
        );
        self.disable_zones(interest.parent_id, &uninterested);
        self.drop_unneeded_pending();

        if !ai {
            self.send_done_interest(handle, context.unwrap_or(interest.context));
        }
        Ok(())
    }

    fn send_done_interest(&mut self, handle: u16, context: u32) {
        let mut dg = Datagram::client(CLIENT_DONE_INTEREST_RESP);
        dg.add_uint16(handle);
        dg.add_uint32(context);
        self.to_client(dg.into_bytes());
    }

    fn send_disable(&mut self, do_id: u32) {
        let mut dg = Datagram::client(CLIENT_OBJECT_DISABLE);
        dg.add_uint32(do_id);
        self.to_client(dg.into_bytes());
    }

    fn send_object_location(&mut self, do_id: u32, parent_id: u32, zone_id: u32) {
        let mut dg = Datagram::client(CLIENT_OBJECT_LOCATION);
        dg.add_uint32(do_id);
        dg.add_uint32(parent_id);
        dg.add_uint32(zone_id);
        self.to_client(dg.into_bytes());
    }

    /// `CLIENT_OBJECT_UPDATE_FIELD(do_id, field, payload)` from the client.
    fn receive_update_field(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let do_id = dgi.get_uint32()?;
        let number = dgi.get_uint16()?;

        if self.state.uberdog_updates_only() && !self.uberdogs.contains(&do_id) {
            debug!(
                "Client {} updated {} while {}, ignoring",
                self.channel, do_id, self.state
            );
            return Ok(());
        }

        let schema = Arc::clone(&self.schema);
        let Some(field) = schema.field(number) else {
            warn!("Client {} tried to update {} with unknown field {}", self.channel, do_id, number);
            self.kick(DisconnectReason::InternalError, "Tried to send unknown field.");
            return Ok(());
        };

        let dclass = self.known_class(do_id).and_then(|n| schema.class(n));
        if let Some(dclass) = dclass {
            if !dclass.has_field(number) {
                warn!(
                    "Client {} tried to update {} ({}) with foreign field {}",
                    self.channel, do_id, dclass.name, field.name
                );
                self.kick(DisconnectReason::InternalError, "Tried to send field of another class.");
                return Ok(());
            }
        }

        let sendable = field.keywords.clsend || (field.keywords.ownsend && self.owned.contains_key(&do_id));
        if !sendable {
            warn!(
                "Client {} tried to update {} ({}) with nonsendable field {}. Keywords: {}",
                self.channel,
                do_id,
                dclass.map_or("unknown class", |c| c.name.as_str()),
                field.name,
                field.keywords
            );
            self.kick(DisconnectReason::InternalError, "Tried to send nonsendable field to object.");
            return Ok(());
        }

        let data = match field.unpack_bytes(dgi) {
            Ok(data) => data,
            Err(e) => {
                warn!("Client {} sent a bad {} payload: {}", self.channel, field.name, e);
                self.kick(DisconnectReason::InternalError, "Invalid field payload.");
                return Ok(());
            }
        };

        let mut dg = Datagram::server(&[do_id as u64], self.channel, STATESERVER_OBJECT_UPDATE_FIELD)?;
        dg.add_uint32(do_id);
        dg.add_uint16(number);
        dg.add_bytes(&data);
        self.to_server(dg.into_bytes());
        Ok(())
    }

    /// `CLIENT_OBJECT_LOCATION(do_id, parent, zone)` from the client.
    fn receive_client_location(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let do_id = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;

        let Some(info) = self.owned.get_mut(&do_id) else {
            debug!("Client {} tried to move unowned object {}", self.channel, do_id);
            return Ok(());
        };
        debug!("Client {} moves {} to ({}, {})", self.channel, do_id, parent_id, zone_id);
        info.parent_id = parent_id;
        info.zone_id = zone_id;

        let mut dg = Datagram::server(&[do_id as u64], self.channel, STATESERVER_OBJECT_SET_ZONE)?;
        dg.add_uint32(parent_id);
        dg.add_uint32(zone_id);
        self.to_server(dg.into_bytes());
        Ok(())
    }

    fn receive_server(&mut self, bytes: &[u8]) -> Result<()> {
        let mut dgi = DatagramIterator::new(bytes);
        let header = dgi.read_server_header()?;
        if header.sender == self.channel {
            return Ok(());
        }

        match header.msg_type {
            STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER => self.handle_object_entrance(bytes, &mut dgi),
            STATESERVER_OBJECT_ENTER_OWNER_RECV => self.handle_owned_object_entrance(&mut dgi),
            STATESERVER_OBJECT_CHANGE_ZONE => {
                let do_id = dgi.get_uint32()?;
                if self.queue_pending(do_id, bytes) {
                    debug!("Queued location change for pending object {}", do_id);
                    return Ok(());
                }
                self.handle_location_change(do_id, &mut dgi)
            }
            STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE => self.handle_interest_done(&mut dgi),
            STATESERVER_OBJECT_UPDATE_FIELD => {
                let do_id = dgi.get_uint32()?;
                if !self.object_exists(do_id) {
                    if self.queue_pending(do_id, bytes) {
                        debug!("Queued field update for pending object {}", do_id);
                    } else {
                        debug!("Client {} got update for unknown object {}", self.channel, do_id);
                    }
                    return Ok(());
                }
                let mut dg = Datagram::client(CLIENT_OBJECT_UPDATE_FIELD);
                dg.add_uint32(do_id);
                dg.add_bytes(dgi.remaining_bytes());
                self.to_client(dg.into_bytes());
                Ok(())
            }
            STATESERVER_OBJECT_DELETE_RAM => {
                let do_id = dgi.get_uint32()?;
                self.handle_delete(do_id, header.sender, bytes);
                Ok(())
            }
            CLIENT_AGENT_SET_INTEREST => self.receive_add_interest(&mut dgi, true),
            CLIENT_AGENT_REMOVE_INTEREST => self.receive_remove_interest(&mut dgi, true),
            CLIENT_AGENT_EJECT => {
                let code = dgi.get_uint16()?;
                let text = dgi.get_string16()?;
                self.kick_with_code(code, &text);
                Ok(())
            }
            DBSERVER_ACCOUNT_QUERY_RESP => self.handle_account_response(&mut dgi),
            DBSERVER_CREATE_STORED_OBJECT_RESP => self.handle_create_object_response(&mut dgi),
            STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP => self.handle_activation_response(&mut dgi),
            DBSERVER_GET_FRIEND_LIST_RESP => self.handle_friend_list_response(&mut dgi),
            msg_type if FORWARDED_MSG_TYPES.contains(&msg_type) => {
                let mut dg = Datagram::client(msg_type);
                dg.add_bytes(dgi.remaining_bytes());
                self.to_client(dg.into_bytes());
                Ok(())
            }
            msg_type => {
                debug!(
                    "Client {} received unhandled {} ({}) from {}",
                    self.channel,
                    msg_name(msg_type),
                    msg_type,
                    header.sender
                );
                Ok(())
            }
        }
    }

    fn queue_pending(&mut self, do_id: u32, bytes: &[u8]) -> bool {
        match self.pending.get_mut(&do_id) {
            Some(pending) => {
                pending.datagrams.push(bytes.to_vec());
                true
            }
            None => false,
        }
    }

    fn forget_pending(&mut self, do_id: u32) {
        if self.pending.remove(&do_id).is_some() {
            debug!("Client {} drops held-back datagrams for {}", self.channel, do_id);
            for interest in &mut self.interests {
                interest.pending.retain(|id| *id != do_id);
            }
        }
    }

    /// `ENTERZONE_WITH_REQUIRED_OTHER(has_other, do_id, parent, zone, dclass, ...)`
    fn handle_object_entrance(&mut self, bytes: &[u8], dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let has_other = dgi.get_uint8()? != 0;
        let do_id = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;
        let dc_id = dgi.get_uint16()?;

        let waiting: Vec<usize> = self
            .interests
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.done && i.covers(parent_id, zone_id))
            .map(|(index, _)| index)
            .collect();

        if !waiting.is_empty() {
            debug!("Queueing generate of {} in ({}, {})", do_id, parent_id, zone_id);
            self.pending
                .entry(do_id)
                .or_insert_with(|| PendingObject {
                    do_id,
                    dc_id,
                    parent_id,
                    zone_id,
                    datagrams: Vec::new(),
                })
                .datagrams
                .push(bytes.to_vec());
            for index in waiting {
                self.interests[index].add_pending(do_id);
            }
            return Ok(());
        }

        if self.object_exists(do_id) {
            return Ok(());
        }
        if !self.interests.iter().any(|i| i.covers(parent_id, zone_id)) {
            debug!("Client {} ignores {} outside its interests", self.channel, do_id);
            return Ok(());
        }

        self.visible.insert(
            do_id,
            ObjectInfo {
                do_id,
                dc_id,
                parent_id,
                zone_id,
            },
        );

        let msg_type = if has_other {
            CLIENT_CREATE_OBJECT_REQUIRED_OTHER
        } else {
            CLIENT_CREATE_OBJECT_REQUIRED
        };
        let mut dg = Datagram::client(msg_type);
        dg.add_uint32(parent_id);
        dg.add_uint32(zone_id);
        dg.add_uint16(dc_id);
        dg.add_uint32(do_id);
        dg.add_bytes(dgi.remaining_bytes());
        self.to_client(dg.into_bytes());
        Ok(())
    }

    /// `ENTER_OWNER_RECV(do_id, parent, zone, dclass, ...)`
    fn handle_owned_object_entrance(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let do_id = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;
        let dc_id = dgi.get_uint16()?;

        self.owned.insert(
            do_id,
            ObjectInfo {
                do_id,
                dc_id,
                parent_id,
                zone_id,
            },
        );

        if self.state != ClientState::SettingAvatar || self.setting_avatar != Some(do_id) {
            debug!("Client {} now owns {}", self.channel, do_id);
            return Ok(());
        }

        self.setting_avatar = None;
        self.avatar_id = do_id;
        self.subscribe(puppet_channel(do_id));
        self.transition(ClientState::PlayGame);

        let mut dg = Datagram::client(CLIENT_GET_AVATAR_DETAILS_RESP);
        dg.add_uint32(do_id);
        dg.add_uint8(0);
        dg.add_bytes(dgi.remaining_bytes());
        self.to_client(dg.into_bytes());
        info!("Client {} is playing avatar {}", self.channel, do_id);
        Ok(())
    }

    /// `CHANGE_ZONE` body after the do_id: `new_parent, new_zone, old_parent, old_zone`.
    fn handle_location_change(&mut self, do_id: u32, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let new_parent = dgi.get_uint32()?;
        let new_zone = dgi.get_uint32()?;
        let old_parent = dgi.get_uint32()?;
        let old_zone = dgi.get_uint32()?;
        debug!(
            "Location change for {}: ({}, {}) -> ({}, {})",
            do_id, old_parent, old_zone, new_parent, new_zone
        );

        let covered = self.interests.iter().any(|i| i.covers(new_parent, new_zone));
        let visible = match self.visible.get_mut(&do_id) {
            Some(info) => {
                info.parent_id = new_parent;
                info.zone_id = new_zone;
                true
            }
            None => false,
        };
        let owned = match self.owned.get_mut(&do_id) {
            Some(info) => {
                info.parent_id = new_parent;
                info.zone_id = new_zone;
                true
            }
            None => false,
        };

        if !visible && !owned {
            debug!("Client {} got location change for unknown object {}", self.channel, do_id);
            return Ok(());
        }

        if visible && !covered && !owned {
            debug!("Object {} left every interest of client {}", do_id, self.channel);
            self.visible.remove(&do_id);
            self.send_disable(do_id);
        } else {
            self.send_object_location(do_id, new_parent, new_zone);
        }
        Ok(())
    }

    fn handle_delete(&mut self, do_id: u32, sender: u64, bytes: &[u8]) {
        if do_id != 0 && do_id == self.avatar_id {
            // The object is already gone; nothing to delete on close.
            self.owned.remove(&do_id);
            self.avatar_id = 0;
            let relog = self
                .account
                .as_ref()
                .map_or(false, |a| sender == client_sender_channel(a.disl_id, 0));
            if relog {
                self.kick(DisconnectReason::Relogged, "redundant login");
            } else {
                self.kick(DisconnectReason::ShardDisconnect, "district reset");
            }
            return;
        }

        if !self.object_exists(do_id) {
            if self.queue_pending(do_id, bytes) {
                debug!("Queued deletion for pending object {}", do_id);
            } else {
                debug!("Client {} got delete for unknown object {}", self.channel, do_id);
            }
            return;
        }

        // Already shown, so a held-back generate must not bring it back.
        self.forget_pending(do_id);
        let visible = self.visible.remove(&do_id).is_some();
        let owned = self.owned.remove(&do_id).is_some();
        if visible || owned {
            self.send_disable(do_id);
        }
    }

    /// `QUERY_ZONE_OBJECT_ALL_DONE(handle, context)`: replays what the
    /// interest held back, then acknowledges it.
    fn handle_interest_done(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let handle = dgi.get_uint16()?;
        let context = dgi.get_uint32()?;

        let Some(index) = self
            .interests
            .iter()
            .position(|i| i.handle == handle && i.context == context)
        else {
            debug!("Client {} got done for unknown interest {} {}", self.channel, handle, context);
            return Ok(());
        };

        let interest = &mut self.interests[index];
        if interest.done {
            debug!("Client {} got a duplicate done for interest {}", self.channel, handle);
            return Ok(());
        }
        interest.done = true;
        let ai = interest.ai;
        let candidates = std::mem::take(&mut interest.pending);

        let mut ready = Vec::with_capacity(candidates.len());
        for do_id in candidates {
            let still_waiting = self.interests.iter().any(|i| !i.done && i.pending.contains(&do_id));
            if still_waiting {
                continue;
            }
            if let Some(pending) = self.pending.remove(&do_id) {
                ready.push(pending);
            }
        }
        // Stable: objects of one class keep their arrival order.
        ready.sort_by_key(|pending| pending.dc_id);
        debug!(
            "Replaying {:?} for interest {}",
            ready.iter().map(|p| p.do_id).collect::<Vec<_>>(),
            handle
        );

        for pending in ready {
            for datagram in pending.datagrams {
                if self.closed {
                    return Ok(());
                }
                if let Err(e) = self.receive_server(&datagram) {
                    warn!("Replay for {} failed: {}", pending.do_id, e);
                }
            }
        }

        if !ai {
            self.send_done_interest(handle, context);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANNEL: u64 = 1_000_000_005;
    const ROOT: u32 = OTP_DO_ID_TOONTOWN;

    fn session() -> ClientSession {
        let schema = Arc::new(Schema::builtin().unwrap());
        let mut session = ClientSession::new(CHANNEL, schema, ClientAgentConfig::default());
        session.open();
        session
    }

    fn toon_class() -> u16 {
        Schema::builtin().unwrap().class_by_name("DistributedToon").unwrap().number
    }

    fn field(class: &str, name: &str) -> u16 {
        let schema = Schema::builtin().unwrap();
        let dclass = schema.class_by_name(class).unwrap();
        dclass.field_number(name).unwrap()
    }

    fn client_msg(msg_type: u16, body: impl FnOnce(&mut Datagram)) -> Vec<u8> {
        let mut dg = Datagram::client(msg_type);
        body(&mut dg);
        dg.into_bytes()
    }

    fn server_msg(sender: u64, msg_type: u16, body: impl FnOnce(&mut Datagram)) -> Vec<u8> {
        let mut dg = Datagram::server(&[CHANNEL], sender, msg_type).unwrap();
        body(&mut dg);
        dg.into_bytes()
    }

    fn add_interest(handle: u16, context: u32, parent: u32, zones: &[u32]) -> Vec<u8> {
        client_msg(CLIENT_ADD_INTEREST, |dg| {
            dg.add_uint16(handle);
            dg.add_uint32(context);
            dg.add_uint32(parent);
            for zone in zones {
                dg.add_uint32(*zone);
            }
        })
    }

    fn enter_zone(do_id: u32, parent: u32, zone: u32, dc_id: u16) -> Vec<u8> {
        server_msg(do_id as u64, STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER, |dg| {
            dg.add_uint8(0);
            dg.add_uint32(do_id);
            dg.add_uint32(parent);
            dg.add_uint32(zone);
            dg.add_uint16(dc_id);
            dg.add_bytes(&[0xAB, 0xCD]);
        })
    }

    fn update(do_id: u32, field: u16, payload: &[u8]) -> Vec<u8> {
        server_msg(4_000_001, STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(do_id);
            dg.add_uint16(field);
            dg.add_bytes(payload);
        })
    }

    fn done(handle: u16, context: u32) -> Vec<u8> {
        server_msg(ROOT as u64, STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE, |dg| {
            dg.add_uint16(handle);
            dg.add_uint32(context);
        })
    }

    fn change_zone(do_id: u32, new: (u32, u32), old: (u32, u32)) -> Vec<u8> {
        server_msg(do_id as u64, STATESERVER_OBJECT_CHANGE_ZONE, |dg| {
            dg.add_uint32(do_id);
            dg.add_uint32(new.0);
            dg.add_uint32(new.1);
            dg.add_uint32(old.0);
            dg.add_uint32(old.1);
        })
    }

    fn client_types(effects: &[SessionEffect]) -> Vec<u16> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::ToClient(bytes) => Some(u16::from_le_bytes([bytes[0], bytes[1]])),
                _ => None,
            })
            .collect()
    }

    fn server_headers(effects: &[SessionEffect]) -> Vec<(Vec<u64>, u16)> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::ToServer(bytes) => {
                    let header = DatagramIterator::new(bytes).read_server_header().unwrap();
                    Some((header.recipients, header.msg_type))
                }
                _ => None,
            })
            .collect()
    }

    fn login(session: &mut ClientSession, username: &str, disl_id: u32, avatars: &[(u32, u8)]) -> Vec<SessionEffect> {
        let effects = session.handle_client(&client_msg(CLIENT_LOGIN_2, |dg| {
            dg.add_string16(username).unwrap();
            dg.add_string16(crate::config::DEFAULT_SERVER_VERSION).unwrap();
            dg.add_uint32(0);
            dg.add_int32(1);
            dg.add_string16("").unwrap();
        }));
        let query = effects
            .iter()
            .find_map(|effect| match effect {
                SessionEffect::ToServer(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        let mut dgi = DatagramIterator::new(&query);
        assert_eq!(dgi.read_server_header().unwrap().msg_type, DBSERVER_ACCOUNT_QUERY);
        let context = dgi.get_uint32().unwrap();
        assert_eq!(dgi.get_string16().unwrap(), username);

        session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_ACCOUNT_QUERY_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint32(disl_id);
            dg.add_uint8(avatars.len() as u8);
            for (av_id, pos) in avatars {
                dg.add_uint32(*av_id);
                dg.add_string16("Toon").unwrap();
                dg.add_blob16(&[1, 2, 3]).unwrap();
                dg.add_uint8(*pos);
            }
        }))
    }

    /// Logs in and plays avatar `av_id`.
    fn playing(av_id: u32) -> ClientSession {
        let mut session = chooser(&[(av_id, 0)]);

        let effects = session.handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(av_id)));
        let context = reply_context(&effects);
        session.handle_server(&server_msg(STATESERVERS_CHANNEL, STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint8(0);
            dg.add_uint32(av_id);
        }));
        session.handle_server(&server_msg(av_id as u64, STATESERVER_OBJECT_ENTER_OWNER_RECV, |dg| {
            dg.add_uint32(av_id);
            dg.add_uint32(0);
            dg.add_uint32(0);
            dg.add_uint16(toon_class());
            dg.add_bytes(&[9, 9]);
        }));
        assert_eq!(session.state(), ClientState::PlayGame);
        session
    }

    /// Context of the first request a session sent.
    fn reply_context(effects: &[SessionEffect]) -> u32 {
        effects
            .iter()
            .find_map(|effect| match effect {
                SessionEffect::ToServer(bytes) => {
                    let mut dgi = DatagramIterator::new(bytes);
                    let header = dgi.read_server_header().unwrap();
                    match header.msg_type {
                        STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT => {
                            dgi.skip(4 + 4 + 4 + 8 + 2).unwrap();
                            Some(dgi.get_uint32().unwrap())
                        }
                        _ => Some(dgi.get_uint32().unwrap()),
                    }
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_open_subscribes_session_and_clients_channel() {
        let schema = Arc::new(Schema::builtin().unwrap());
        let mut session = ClientSession::new(CHANNEL, schema, ClientAgentConfig::default());
        assert_eq!(
            session.open(),
            vec![SessionEffect::Subscribe(CHANNEL), SessionEffect::Subscribe(CLIENTS_CHANNEL)]
        );
    }

    #[test]
    fn test_heartbeat_is_echoed_in_any_state() {
        let mut session = session();
        let heartbeat = client_msg(CLIENT_HEARTBEAT, |_| {});
        assert_eq!(session.handle_client(&heartbeat), vec![SessionEffect::ToClient(heartbeat.clone())]);
    }

    #[test]
    fn test_out_of_state_message_is_ignored() {
        let mut session = session();
        let effects = session.handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(5)));
        assert!(effects.is_empty());
        assert_eq!(session.state(), ClientState::New);
    }

    #[test]
    fn test_outdated_client_is_booted() {
        let mut session = session();
        let effects = session.handle_client(&client_msg(CLIENT_LOGIN_2, |dg| {
            dg.add_string16("flippy").unwrap();
            dg.add_string16("sv0.0.0").unwrap();
            dg.add_uint32(0);
            dg.add_int32(1);
            dg.add_string16("").unwrap();
        }));
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
        assert_eq!(effects.last(), Some(&SessionEffect::Close));
        let SessionEffect::ToClient(bytes) = &effects[0] else { panic!() };
        let mut dgi = DatagramIterator::new(bytes);
        dgi.get_uint16().unwrap();
        assert_eq!(dgi.get_uint16().unwrap(), DisconnectReason::OutdatedClient.code());
    }

    #[test]
    fn test_login_flow() {
        let mut session = session();
        let effects = login(&mut session, "flippy", 7, &[(100_000_001, 2)]);

        assert_eq!(session.state(), ClientState::Authenticated);
        assert_eq!(session.account().unwrap().disl_id, 7);
        assert_eq!(session.account().unwrap().avatars[0].pos, 2);
        assert_eq!(
            server_headers(&effects),
            vec![(vec![account_channel(7)], CLIENT_AGENT_EJECT)]
        );
        assert!(effects.contains(&SessionEffect::Subscribe(account_channel(7))));
        assert_eq!(client_types(&effects), vec![CLIENT_LOGIN_2_RESP]);
    }

    #[test]
    fn test_login_timeout_boots_client() {
        let mut session = session();
        session.handle_client(&client_msg(CLIENT_LOGIN_2, |dg| {
            dg.add_string16("flippy").unwrap();
            dg.add_string16(crate::config::DEFAULT_SERVER_VERSION).unwrap();
            dg.add_uint32(0);
            dg.add_int32(1);
            dg.add_string16("").unwrap();
        }));
        assert!(session.prune_requests(Instant::now()).is_empty());

        let effects = session.prune_requests(Instant::now() + std::time::Duration::from_secs(60));
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
        assert!(session.is_closed());
    }

    #[test]
    fn test_anonymous_login_limits_interest_to_root() {
        let schema = Arc::new(Schema::builtin().unwrap());
        let config = ClientAgentConfig {
            allow_anonymous: true,
            ..ClientAgentConfig::default()
        };
        let mut session = ClientSession::new(CHANNEL, schema, config);
        session.handle_client(&client_msg(CLIENT_LOGIN_2, |dg| {
            dg.add_string16("").unwrap();
            dg.add_string16(crate::config::DEFAULT_SERVER_VERSION).unwrap();
            dg.add_uint32(0);
            dg.add_int32(1);
            dg.add_string16("").unwrap();
        }));
        assert_eq!(session.state(), ClientState::Anonymous);

        assert!(session.handle_client(&add_interest(1, 1, 5000, &[1])).is_empty());
        let effects = session.handle_client(&add_interest(1, 1, ROOT, &[3]));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![ROOT as u64], STATESERVER_QUERY_ZONE_OBJECT_ALL)]
        );
    }

    #[test]
    fn test_interest_subscribes_before_query_then_generates_after_done() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);

        let effects = session.handle_client(&add_interest(1, 5, ROOT, &[2000]));
        assert_eq!(
            effects[0],
            SessionEffect::Subscribe(location_as_channel(ROOT, 2000))
        );
        assert_eq!(
            server_headers(&effects[1..]),
            vec![(vec![ROOT as u64], STATESERVER_QUERY_ZONE_OBJECT_ALL)]
        );

        // Nothing reaches the client before the query completes.
        assert!(session.handle_server(&enter_zone(500_001, ROOT, 2000, 4)).is_empty());
        assert!(session.is_pending(500_001));

        let effects = session.handle_server(&done(1, 5));
        assert_eq!(
            client_types(&effects),
            vec![CLIENT_CREATE_OBJECT_REQUIRED, CLIENT_DONE_INTEREST_RESP]
        );
        let SessionEffect::ToClient(generate) = &effects[0] else { panic!() };
        let mut dgi = DatagramIterator::new(generate);
        dgi.get_uint16().unwrap();
        assert_eq!(dgi.get_uint32().unwrap(), ROOT);
        assert_eq!(dgi.get_uint32().unwrap(), 2000);
        assert_eq!(dgi.get_uint16().unwrap(), 4);
        assert_eq!(dgi.get_uint32().unwrap(), 500_001);
        assert_eq!(dgi.remaining_bytes(), &[0xAB, 0xCD]);
        assert!(session.is_visible(500_001));
        assert!(!session.is_pending(500_001));
    }

    #[test]
    fn test_pending_update_replays_after_generate() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 5, ROOT, &[2000]));

        let set_x = field("DistributedToon", "setX");
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        assert!(session.handle_server(&update(500_001, set_x, &1.5f64.to_le_bytes())).is_empty());
        // Updates for objects nobody announced are dropped.
        assert!(session.handle_server(&update(500_002, set_x, &1.5f64.to_le_bytes())).is_empty());

        let effects = session.handle_server(&done(1, 5));
        assert_eq!(
            client_types(&effects),
            vec![
                CLIENT_CREATE_OBJECT_REQUIRED,
                CLIENT_OBJECT_UPDATE_FIELD,
                CLIENT_DONE_INTEREST_RESP
            ]
        );
    }

    #[test]
    fn test_pending_replay_sorted_by_class() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 5, ROOT, &[2000]));

        session.handle_server(&enter_zone(500_003, ROOT, 2000, 4));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 3));
        session.handle_server(&enter_zone(500_002, ROOT, 2000, 4));

        let effects = session.handle_server(&done(1, 5));
        let ids: Vec<u32> = effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::ToClient(bytes) if bytes[..2] == CLIENT_CREATE_OBJECT_REQUIRED.to_le_bytes() => {
                    Some(u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]))
                }
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![500_001, 500_003, 500_002]);
    }

    #[test]
    fn test_done_with_wrong_context_is_ignored() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 5, ROOT, &[2000]));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));

        assert!(session.handle_server(&done(1, 6)).is_empty());
        assert!(session.is_pending(500_001));
    }

    #[test]
    fn test_empty_interest_is_done_immediately() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        let effects = session.handle_client(&add_interest(3, 9, ROOT, &[]));
        assert_eq!(client_types(&effects), vec![CLIENT_DONE_INTEREST_RESP]);
        assert!(server_headers(&effects).is_empty());
    }

    #[test]
    fn test_remove_interest_keeps_zones_covered_elsewhere() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000, 2001]));
        session.handle_server(&done(1, 1));
        session.handle_client(&add_interest(2, 2, ROOT, &[2001]));
        session.handle_server(&done(2, 2));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        session.handle_server(&enter_zone(500_002, ROOT, 2001, 4));
        assert!(session.is_visible(500_001) && session.is_visible(500_002));

        let effects = session.handle_client(&client_msg(CLIENT_REMOVE_INTEREST, |dg| {
            dg.add_uint16(1);
            dg.add_uint32(1);
        }));
        assert!(!session.is_visible(500_001));
        assert!(session.is_visible(500_002));
        assert!(effects.contains(&SessionEffect::Unsubscribe(location_as_channel(ROOT, 2000))));
        assert!(!effects.contains(&SessionEffect::Unsubscribe(location_as_channel(ROOT, 2001))));
        assert_eq!(
            client_types(&effects),
            vec![CLIENT_OBJECT_DISABLE, CLIENT_DONE_INTEREST_RESP]
        );
    }

    #[test]
    fn test_altering_interest_kills_only_dropped_zones() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000, 2001]));
        session.handle_server(&done(1, 1));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        session.handle_server(&enter_zone(500_002, ROOT, 2001, 4));

        let effects = session.handle_client(&add_interest(1, 2, ROOT, &[2001, 2002]));
        assert!(!session.is_visible(500_001));
        assert!(session.is_visible(500_002));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_DISABLE]);
        assert!(effects.contains(&SessionEffect::Unsubscribe(location_as_channel(ROOT, 2000))));
        assert_eq!(session.interests().len(), 1);
        assert_eq!(session.interests()[0].context, 2);
    }

    #[test]
    fn test_altering_pending_interest_drops_its_pending_objects() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        assert!(session.is_pending(500_001));

        session.handle_client(&add_interest(1, 2, ROOT, &[2001]));
        assert!(!session.is_pending(500_001));
    }

    #[test]
    fn test_object_pending_for_two_interests_waits_for_both() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_client(&add_interest(2, 2, ROOT, &[2000]));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));

        let effects = session.handle_server(&done(1, 1));
        assert_eq!(client_types(&effects), vec![CLIENT_DONE_INTEREST_RESP]);
        assert!(session.is_pending(500_001));

        let effects = session.handle_server(&done(2, 2));
        assert_eq!(
            client_types(&effects),
            vec![CLIENT_CREATE_OBJECT_REQUIRED, CLIENT_DONE_INTEREST_RESP]
        );
    }

    #[test]
    fn test_deleted_object_not_regenerated_by_second_interest() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&done(1, 1));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        assert!(session.is_visible(500_001));

        session.handle_client(&add_interest(2, 2, ROOT, &[2000]));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        assert!(session.is_pending(500_001));

        // Still visible, so updates go straight through.
        let set_x = field("DistributedToon", "setX");
        let effects = session.handle_server(&update(500_001, set_x, &2.5f64.to_le_bytes()));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_UPDATE_FIELD]);

        let effects = session.handle_server(&server_msg(500_001, STATESERVER_OBJECT_DELETE_RAM, |dg| {
            dg.add_uint32(500_001)
        }));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_DISABLE]);
        assert!(!session.is_pending(500_001));
        assert!(session.interests().iter().all(|i| i.pending.is_empty()));

        let effects = session.handle_server(&done(2, 2));
        assert_eq!(client_types(&effects), vec![CLIENT_DONE_INTEREST_RESP]);
        assert!(!session.is_visible(500_001));
    }

    #[test]
    fn test_delete_of_unshown_pending_object_cancels_its_generate() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));
        let effects = session.handle_server(&server_msg(500_001, STATESERVER_OBJECT_DELETE_RAM, |dg| {
            dg.add_uint32(500_001)
        }));
        assert!(client_types(&effects).is_empty());

        let effects = session.handle_server(&done(1, 1));
        assert_eq!(
            client_types(&effects),
            vec![
                CLIENT_CREATE_OBJECT_REQUIRED,
                CLIENT_OBJECT_DISABLE,
                CLIENT_DONE_INTEREST_RESP
            ]
        );
        assert!(!session.is_visible(500_001));
    }

    #[test]
    fn test_ai_interest_gets_no_ack() {
        let mut session = playing(100_000_001);
        let effects = session.handle_server(&server_msg(4_000_001, CLIENT_AGENT_SET_INTEREST, |dg| {
            dg.add_uint16(10);
            dg.add_uint32(3);
            dg.add_uint32(ROOT);
            dg.add_uint32(2000);
        }));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![ROOT as u64], STATESERVER_QUERY_ZONE_OBJECT_ALL)]
        );
        assert!(client_types(&session.handle_server(&done(10, 3))).is_empty());

        let effects = session.handle_server(&server_msg(4_000_001, CLIENT_AGENT_REMOVE_INTEREST, |dg| {
            dg.add_uint16(10);
        }));
        assert!(client_types(&effects).is_empty());
        assert!(session.interests().is_empty());
    }

    #[test]
    fn test_location_change_visibility() {
        let mut session = playing(100_000_001);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000, 2001]));
        session.handle_server(&done(1, 1));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, 4));

        // Still covered: relocation notice.
        let effects = session.handle_server(&change_zone(500_001, (ROOT, 2001), (ROOT, 2000)));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_LOCATION]);

        // Out of every interest: disabled.
        let effects = session.handle_server(&change_zone(500_001, (ROOT, 3000), (ROOT, 2001)));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_DISABLE]);
        assert!(!session.is_visible(500_001));

        // Unknown objects are ignored.
        assert!(session.handle_server(&change_zone(500_009, (ROOT, 2000), (ROOT, 1))).is_empty());
    }

    #[test]
    fn test_owned_object_never_disabled_by_location() {
        let mut session = playing(100_000_001);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&done(1, 1));
        session.handle_server(&change_zone(100_000_001, (ROOT, 2000), (0, 0)));

        let effects = session.handle_server(&change_zone(100_000_001, (ROOT, 9000), (ROOT, 2000)));
        assert_eq!(client_types(&effects), vec![CLIENT_OBJECT_LOCATION]);
        assert!(session.is_owned(100_000_001));
    }

    #[test]
    fn test_nonsendable_field_disconnects() {
        let mut session = playing(100_000_001);
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&done(1, 1));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, toon_class()));

        // setX is ownsend, and 500001 belongs to someone else.
        let set_x = field("DistributedToon", "setX");
        let effects = session.handle_client(&client_msg(CLIENT_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(set_x);
            dg.add_float64(1.0);
        }));
        assert!(server_headers(&effects).is_empty());
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
        assert_eq!(effects.last(), Some(&SessionEffect::Close));
    }

    #[test]
    fn test_sendable_fields_reach_the_object() {
        let mut session = playing(100_000_001);
        let set_x = field("DistributedToon", "setX");
        let effects = session.handle_client(&client_msg(CLIENT_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(100_000_001);
            dg.add_uint16(set_x);
            dg.add_float64(1.0);
        }));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![100_000_001], STATESERVER_OBJECT_UPDATE_FIELD)]
        );

        let talk = field("DistributedToon", "setTalk");
        session.handle_client(&add_interest(1, 1, ROOT, &[2000]));
        session.handle_server(&done(1, 1));
        session.handle_server(&enter_zone(500_001, ROOT, 2000, toon_class()));
        let effects = session.handle_client(&client_msg(CLIENT_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(talk);
            dg.add_uint32(0);
            dg.add_string16("hi").unwrap();
        }));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![500_001], STATESERVER_OBJECT_UPDATE_FIELD)]
        );
    }

    #[test]
    fn test_truncated_field_payload_disconnects() {
        let mut session = playing(100_000_001);
        let set_x = field("DistributedToon", "setX");
        let effects = session.handle_client(&client_msg(CLIENT_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(100_000_001);
            dg.add_uint16(set_x);
            dg.add_uint16(1);
        }));
        assert!(server_headers(&effects).is_empty());
        assert!(session.is_closed());
    }

    #[test]
    fn test_chooser_may_only_update_uberdogs() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[]);
        let effects = session.handle_client(&client_msg(CLIENT_GET_AVATARS, |_| {}));
        let context = reply_context(&effects);
        session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_ACCOUNT_QUERY_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint32(7);
            dg.add_uint8(0);
        }));

        let send_message = field("CentralLogger", "sendMessage");
        let log_update = |do_id: u32| {
            client_msg(CLIENT_OBJECT_UPDATE_FIELD, |dg| {
                dg.add_uint32(do_id);
                dg.add_uint16(send_message);
                dg.add_string16("cat").unwrap();
                dg.add_string16("event").unwrap();
                dg.add_uint32(0);
                dg.add_uint32(0);
            })
        };
        let effects = session.handle_client(&log_update(OTP_DO_ID_CENTRAL_LOGGER));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![OTP_DO_ID_CENTRAL_LOGGER as u64], STATESERVER_OBJECT_UPDATE_FIELD)]
        );
        assert!(session.handle_client(&log_update(500_001)).is_empty());
    }

    #[test]
    fn test_set_avatar_flow() {
        let mut session = playing(100_000_001);
        assert_eq!(session.avatar_id(), 100_000_001);
        assert!(session.is_owned(100_000_001));

        let effects = session.handle_client(&client_msg(CLIENT_OBJECT_LOCATION, |dg| {
            dg.add_uint32(100_000_001);
            dg.add_uint32(ROOT);
            dg.add_uint32(2000);
        }));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![100_000_001], STATESERVER_OBJECT_SET_ZONE)]
        );

        let effects = session.handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(0)));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![100_000_001], STATESERVER_OBJECT_DELETE_RAM)]
        );
        assert_eq!(session.state(), ClientState::AvatarChooser);
        assert_eq!(session.avatar_id(), 0);
    }

    #[test]
    fn test_set_foreign_avatar_disconnects() {
        let mut session = session();
        login(&mut session, "flippy", 7, &[(100_000_001, 0)]);
        let effects = session.handle_client(&client_msg(CLIENT_GET_AVATARS, |_| {}));
        let context = reply_context(&effects);
        session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_ACCOUNT_QUERY_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint32(7);
            dg.add_uint8(0);
        }));

        let effects = session.handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(100_000_999)));
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
    }

    fn account_response(context: u32, avatars: &[(u32, u8)]) -> Vec<u8> {
        server_msg(DBSERVERS_CHANNEL, DBSERVER_ACCOUNT_QUERY_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint32(7);
            dg.add_uint8(avatars.len() as u8);
            for (av_id, pos) in avatars {
                dg.add_uint32(*av_id);
                dg.add_string16("Toon").unwrap();
                dg.add_blob16(&[1, 2, 3]).unwrap();
                dg.add_uint8(*pos);
            }
        })
    }

    /// Logs in and opens the avatar chooser on `(av_id, slot)` avatars.
    fn chooser(avatars: &[(u32, u8)]) -> ClientSession {
        let mut session = session();
        login(&mut session, "flippy", 7, avatars);
        let effects = session.handle_client(&client_msg(CLIENT_GET_AVATARS, |_| {}));
        let context = reply_context(&effects);
        session.handle_server(&account_response(context, avatars));
        assert_eq!(session.state(), ClientState::AvatarChooser);
        session
    }

    fn create_avatar(pos: u8) -> Vec<u8> {
        client_msg(CLIENT_CREATE_AVATAR, |dg| {
            dg.add_blob16(&[1, 2, 3]).unwrap();
            dg.add_uint8(pos);
        })
    }

    /// A session that has just created avatar `av_id` in slot 0.
    fn created(av_id: u32) -> ClientSession {
        let mut session = chooser(&[]);
        let effects = session.handle_client(&create_avatar(0));
        let context = reply_context(&effects);
        session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_CREATE_STORED_OBJECT_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint8(0);
            dg.add_uint32(av_id);
        }));
        session
    }

    /// `(do_id, field, name)` from a one-field `SET_STORED_VALUES`.
    fn stored_name(effects: &[SessionEffect]) -> (u32, u16, String) {
        let bytes = effects
            .iter()
            .find_map(|effect| match effect {
                SessionEffect::ToServer(bytes) => Some(bytes),
                _ => None,
            })
            .unwrap();
        let mut dgi = DatagramIterator::new(bytes);
        assert_eq!(dgi.read_server_header().unwrap().msg_type, DBSERVER_SET_STORED_VALUES);
        let do_id = dgi.get_uint32().unwrap();
        assert_eq!(dgi.get_uint16().unwrap(), 1);
        (do_id, dgi.get_uint16().unwrap(), dgi.get_string16().unwrap())
    }

    /// The client reply body after its message type.
    fn client_body(effects: &[SessionEffect], msg_type: u16) -> Vec<u8> {
        effects
            .iter()
            .find_map(|effect| match effect {
                SessionEffect::ToClient(bytes) if u16::from_le_bytes([bytes[0], bytes[1]]) == msg_type => {
                    Some(bytes[2..].to_vec())
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_create_avatar_flow() {
        let mut session = chooser(&[]);

        let effects = session.handle_client(&create_avatar(1));
        assert_eq!(session.state(), ClientState::CreatingAvatar);
        assert_eq!(
            server_headers(&effects),
            vec![(vec![DBSERVERS_CHANNEL], DBSERVER_CREATE_STORED_OBJECT)]
        );
        let context = reply_context(&effects);

        // Playing the new avatar has to wait for the database.
        assert!(session
            .handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(100_000_002)))
            .is_empty());

        let effects = session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_CREATE_STORED_OBJECT_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint8(0);
            dg.add_uint32(100_000_002);
        }));
        assert_eq!(session.state(), ClientState::CreatingAvatar);
        assert_eq!(
            server_headers(&effects),
            vec![(vec![DBSERVERS_CHANNEL], DBSERVER_ACCOUNT_SET_AVATAR)]
        );
        assert_eq!(client_types(&effects), vec![CLIENT_CREATE_AVATAR_RESP]);
        assert_eq!(session.account().unwrap().avatars.len(), 1);

        // Naming comes next, not another avatar.
        assert!(session.handle_client(&create_avatar(2)).is_empty());

        let effects = session.handle_client(&client_msg(CLIENT_SET_AVATAR, |dg| dg.add_uint32(100_000_002)));
        assert_eq!(session.state(), ClientState::SettingAvatar);
        assert_eq!(
            server_headers(&effects),
            vec![(vec![STATESERVERS_CHANNEL], STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT)]
        );
    }

    #[test]
    fn test_create_avatar_in_bad_slot_fails() {
        let mut session = chooser(&[(100_000_001, 1)]);

        for pos in [1, MAX_AVATARS] {
            let effects = session.handle_client(&create_avatar(pos));
            assert!(server_headers(&effects).is_empty());
            // (context u16, return_code u8, av_id u32)
            assert_eq!(client_body(&effects, CLIENT_CREATE_AVATAR_RESP)[2], 1);
            assert_eq!(session.state(), ClientState::AvatarChooser);
        }
    }

    #[test]
    fn test_failed_create_returns_to_chooser() {
        let mut session = chooser(&[]);
        let effects = session.handle_client(&create_avatar(0));
        let context = reply_context(&effects);
        let effects = session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_CREATE_STORED_OBJECT_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint8(1);
            dg.add_uint32(0);
        }));
        assert_eq!(client_body(&effects, CLIENT_CREATE_AVATAR_RESP)[2], 1);
        assert_eq!(session.state(), ClientState::AvatarChooser);
        assert!(session.account().unwrap().avatars.is_empty());
    }

    fn wish_name(av_id: u32, name: &str) -> Vec<u8> {
        client_msg(CLIENT_SET_WISHNAME, |dg| {
            dg.add_uint32(av_id);
            dg.add_string16(name).unwrap();
        })
    }

    /// `(av_id, approved, rejected)` from a wish name reply.
    fn wish_name_answer(effects: &[SessionEffect]) -> (u32, String, String) {
        let body = client_body(effects, CLIENT_SET_WISHNAME_RESP);
        let mut dgi = DatagramIterator::new(&body);
        let av_id = dgi.get_uint32().unwrap();
        assert_eq!(dgi.get_uint16().unwrap(), 0);
        assert_eq!(dgi.get_string16().unwrap(), "");
        (av_id, dgi.get_string16().unwrap(), dgi.get_string16().unwrap())
    }

    #[test]
    fn test_wish_name_checked_then_stored() {
        let mut session = chooser(&[(100_000_001, 0)]);
        let set_name = field("DistributedToon", "setName");

        // A zero avatar only asks whether the name would pass.
        let effects = session.handle_client(&wish_name(0, " Flippy Doodle "));
        assert!(server_headers(&effects).is_empty());
        assert_eq!(
            wish_name_answer(&effects),
            (0, "Flippy Doodle".to_string(), String::new())
        );

        let effects = session.handle_client(&wish_name(100_000_001, "Toon!"));
        assert!(server_headers(&effects).is_empty());
        assert_eq!(
            wish_name_answer(&effects),
            (100_000_001, String::new(), "Toon!".to_string())
        );

        let effects = session.handle_client(&wish_name(100_000_001, "Flippy"));
        assert_eq!(stored_name(&effects), (100_000_001, set_name, "Flippy".to_string()));
        assert_eq!(
            wish_name_answer(&effects),
            (100_000_001, "Flippy".to_string(), String::new())
        );
        assert_eq!(session.account().unwrap().avatars[0].name, "Flippy");

        let effects = session.handle_client(&wish_name(100_000_999, "Flippy"));
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
        assert!(session.is_closed());
    }

    fn name_pattern(av_id: u32, pattern: NamePattern) -> Vec<u8> {
        client_msg(CLIENT_SET_NAME_PATTERN, |dg| {
            dg.add_uint32(av_id);
            for (index, flag) in pattern {
                dg.add_int16(index);
                dg.add_int16(flag);
            }
        })
    }

    #[test]
    fn test_name_pattern_names_new_avatar() {
        let mut session = created(100_000_002);
        assert_eq!(session.state(), ClientState::CreatingAvatar);

        let effects = session.handle_client(&name_pattern(100_000_002, [(-1, 0); 4]));
        assert!(server_headers(&effects).is_empty());
        let mut rejected = 100_000_002u32.to_le_bytes().to_vec();
        rejected.push(1);
        assert_eq!(client_body(&effects, CLIENT_SET_NAME_PATTERN_ANSWER), rejected);

        let effects = session.handle_client(&name_pattern(100_000_001, [(0, 0), (3, 0), (4, 0), (2, 0)]));
        assert!(server_headers(&effects).is_empty());
        assert_eq!(client_body(&effects, CLIENT_SET_NAME_PATTERN_ANSWER)[4], 1);

        let effects = session.handle_client(&name_pattern(100_000_002, [(0, 0), (3, 0), (4, 0), (2, 0)]));
        assert_eq!(
            stored_name(&effects),
            (
                100_000_002,
                field("DistributedToon", "setName"),
                "Captain Flappy Nuttyfish".to_string()
            )
        );
        assert_eq!(client_body(&effects, CLIENT_SET_NAME_PATTERN_ANSWER)[4], 0);
        assert_eq!(session.account().unwrap().avatars[0].name, "Captain Flappy Nuttyfish");

        // Patterns are part of making an avatar, not of the chooser.
        let mut session = chooser(&[(100_000_001, 0)]);
        assert!(session
            .handle_client(&name_pattern(100_000_001, [(0, 0), (3, 0), (4, 0), (2, 0)]))
            .is_empty());
    }

    #[test]
    fn test_delete_avatar_refreshes_list() {
        let mut session = chooser(&[(100_000_001, 0), (100_000_002, 3)]);
        let delete = client_msg(CLIENT_DELETE_AVATAR, |dg| dg.add_uint32(100_000_002));

        let effects = session.handle_client(&delete);
        assert_eq!(
            server_headers(&effects),
            vec![
                (vec![DBSERVERS_CHANNEL], DBSERVER_DELETE_STORED_OBJECT),
                (vec![DBSERVERS_CHANNEL], DBSERVER_ACCOUNT_QUERY),
            ]
        );
        let SessionEffect::ToServer(query) = &effects[1] else { panic!() };
        let mut dgi = DatagramIterator::new(query);
        dgi.read_server_header().unwrap();
        let context = dgi.get_uint32().unwrap();

        // Asking twice before the answer sends nothing more.
        assert!(session.handle_client(&delete).is_empty());

        let effects = session.handle_server(&account_response(context, &[(100_000_001, 0)]));
        assert_eq!(client_types(&effects), vec![CLIENT_DELETE_AVATAR_RESP]);
        let body = client_body(&effects, CLIENT_DELETE_AVATAR_RESP);
        assert_eq!(body[0], 0);
        assert_eq!(u16::from_le_bytes([body[1], body[2]]), 1);
        assert_eq!(session.account().unwrap().avatars.len(), 1);
        assert_eq!(session.state(), ClientState::AvatarChooser);

        let effects = session.handle_client(&client_msg(CLIENT_DELETE_AVATAR, |dg| dg.add_uint32(100_000_002)));
        assert!(server_headers(&effects).is_empty());
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
    }

    #[test]
    fn test_delete_avatar_timeout_reports_failure() {
        let mut session = chooser(&[(100_000_001, 0)]);
        session.handle_client(&client_msg(CLIENT_DELETE_AVATAR, |dg| dg.add_uint32(100_000_001)));

        let effects = session.prune_requests(Instant::now() + std::time::Duration::from_secs(60));
        assert_eq!(client_body(&effects, CLIENT_DELETE_AVATAR_RESP)[0], 1);
        assert!(!session.is_closed());
    }

    #[test]
    fn test_friend_list_from_database() {
        let mut session = playing(100_000_001);
        assert!(chooser(&[])
            .handle_client(&client_msg(CLIENT_GET_FRIEND_LIST, |_| {}))
            .is_empty());

        let effects = session.handle_client(&client_msg(CLIENT_GET_FRIEND_LIST, |_| {}));
        assert_eq!(
            server_headers(&effects),
            vec![(vec![DBSERVERS_CHANNEL], DBSERVER_GET_FRIEND_LIST)]
        );
        let SessionEffect::ToServer(ask) = &effects[0] else { panic!() };
        let mut dgi = DatagramIterator::new(ask);
        dgi.read_server_header().unwrap();
        let context = dgi.get_uint32().unwrap();
        assert_eq!(dgi.get_uint32().unwrap(), 100_000_001);

        let effects = session.handle_server(&server_msg(DBSERVERS_CHANNEL, DBSERVER_GET_FRIEND_LIST_RESP, |dg| {
            dg.add_uint32(context);
            dg.add_uint8(0);
            dg.add_uint16(1);
            dg.add_uint32(100_000_005);
            dg.add_string16("Lil Oldman").unwrap();
            dg.add_blob16(&[4, 5]).unwrap();
        }));
        let body = client_body(&effects, CLIENT_GET_FRIEND_LIST_RESP);
        let mut dgi = DatagramIterator::new(&body);
        assert_eq!(dgi.get_uint8().unwrap(), 0);
        assert_eq!(dgi.get_uint16().unwrap(), 1);
        assert_eq!(dgi.get_uint32().unwrap(), 100_000_005);
        assert_eq!(dgi.get_string16().unwrap(), "Lil Oldman");
        assert_eq!(dgi.get_blob16().unwrap(), &[4, 5]);
        assert_eq!(dgi.get_uint32().unwrap(), 0);
        assert_eq!(dgi.remaining(), 0);
    }

    #[test]
    fn test_friend_list_timeout_reports_error() {
        let mut session = playing(100_000_001);
        session.handle_client(&client_msg(CLIENT_GET_FRIEND_LIST, |_| {}));
        assert!(session
            .handle_client(&client_msg(CLIENT_GET_FRIEND_LIST, |_| {}))
            .is_empty());

        let effects = session.prune_requests(Instant::now() + std::time::Duration::from_secs(60));
        assert_eq!(client_body(&effects, CLIENT_GET_FRIEND_LIST_RESP), vec![1, 0, 0]);
        assert_eq!(session.state(), ClientState::PlayGame);
    }

    #[test]
    fn test_avatar_deleted_by_district_reset() {
        let mut session = playing(100_000_001);
        let effects = session.handle_server(&server_msg(4_000_001, STATESERVER_OBJECT_DELETE_RAM, |dg| {
            dg.add_uint32(100_000_001);
        }));
        let SessionEffect::ToClient(bytes) = &effects[0] else { panic!() };
        assert_eq!(
            u16::from_le_bytes([bytes[2], bytes[3]]),
            DisconnectReason::ShardDisconnect.code()
        );
        // No second delete for an object that is already gone.
        assert!(server_headers(&session.on_disconnect()).is_empty());
    }

    #[test]
    fn test_avatar_deleted_by_own_account_is_relog() {
        let mut session = playing(100_000_001);
        let effects = session.handle_server(&server_msg(
            client_sender_channel(7, 0),
            STATESERVER_OBJECT_DELETE_RAM,
            |dg| dg.add_uint32(100_000_001),
        ));
        let SessionEffect::ToClient(bytes) = &effects[0] else { panic!() };
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), DisconnectReason::Relogged.code());
    }

    #[test]
    fn test_disconnect_deletes_avatar() {
        let mut session = playing(100_000_001);
        let effects = session.on_disconnect();
        assert_eq!(
            server_headers(&effects),
            vec![(vec![100_000_001], STATESERVER_OBJECT_DELETE_RAM)]
        );
    }

    #[test]
    fn test_eject_and_forwarded_messages() {
        let mut session = playing(100_000_001);
        let effects = session.handle_server(&server_msg(4_000_001, CLIENT_SYSTEM_MESSAGE, |dg| {
            dg.add_string16("hello").unwrap();
        }));
        assert_eq!(client_types(&effects), vec![CLIENT_SYSTEM_MESSAGE]);

        let effects = session.handle_server(&server_msg(1_000_000_009, CLIENT_AGENT_EJECT, |dg| {
            dg.add_uint16(DisconnectReason::Relogged.code());
            dg.add_string16("elsewhere").unwrap();
        }));
        assert_eq!(client_types(&effects), vec![CLIENT_GO_GET_LOST]);
        assert!(session.is_closed());
    }

    #[test]
    fn test_own_datagrams_are_skipped() {
        let mut session = playing(100_000_001);
        let effects = session.handle_server(&server_msg(CHANNEL, CLIENT_SYSTEM_MESSAGE, |dg| {
            dg.add_string16("echo").unwrap();
        }));
        assert!(effects.is_empty());
    }
}
