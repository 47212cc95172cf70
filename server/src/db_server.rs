//! Database server: stored objects and accounts.
//!
//! Rows are kept in memory as `do_id -> (dclass, field name -> packed bytes)`.
//! When a snapshot path is configured the whole store is written with
//! bincode after every mutation and read back on start.

use crate::config::DbServerConfig;
use crate::context::AppContext;
use crate::local::{LocalDirector, ServiceParticipant};
use crate::network::{connect_upstream, ConnectionHandle, NetworkEvent};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::channels::DBSERVERS_CHANNEL;
use shared::msgtypes::*;
use shared::{
    AllocatorError, ChannelAllocator, Datagram, DatagramError, DatagramIterator, Schema, SchemaError, Value,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unknown dclass {0}")]
    UnknownClass(u16),
    #[error("unknown field {0}")]
    UnknownField(u16),
    #[error("field {field} is not part of dclass {dclass}")]
    FieldNotInClass { field: u16, dclass: u16 },
    #[error("dclass {0} needs a value for {1}")]
    MissingRequired(u16, String),
    #[error("allocated id {0} does not fit a do_id")]
    IdOutOfRange(u64),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub dclass: u16,
    pub fields: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub disl_id: u32,
    /// Avatar id by slot.
    pub avatars: BTreeMap<u8, u32>,
}

/// Everything the database persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStore {
    pub objects: BTreeMap<u32, StoredObject>,
    pub accounts: BTreeMap<String, AccountRecord>,
    pub next_disl_id: u32,
}

impl DbStore {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Writes to a sibling file first so a crash never leaves half a snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Fetches or creates the account for `username`.
    pub fn account(&mut self, username: &str) -> &AccountRecord {
        if !self.accounts.contains_key(username) {
            let disl_id = self.next_disl_id.max(1);
            self.next_disl_id = disl_id + 1;
            info!("Created account {} for {}", disl_id, username);
            self.accounts.insert(
                username.to_string(),
                AccountRecord {
                    disl_id,
                    avatars: BTreeMap::new(),
                },
            );
        }
        &self.accounts[username]
    }

    pub fn set_avatar(&mut self, disl_id: u32, pos: u8, av_id: u32) -> bool {
        match self.accounts.values_mut().find(|a| a.disl_id == disl_id) {
            Some(account) => {
                if av_id == 0 {
                    account.avatars.remove(&pos);
                } else {
                    account.avatars.insert(pos, av_id);
                }
                true
            }
            None => false,
        }
    }

    /// Removes a row and every account slot pointing at it.
    pub fn delete(&mut self, do_id: u32) -> bool {
        let removed = self.objects.remove(&do_id).is_some();
        for account in self.accounts.values_mut() {
            account.avatars.retain(|_, av_id| *av_id != do_id);
        }
        removed
    }
}

/// One account slot as reported to the client agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarListing {
    pub av_id: u32,
    pub name: String,
    pub dna: Vec<u8>,
    pub pos: u8,
}

pub struct DbServer {
    schema: Arc<Schema>,
    config: DbServerConfig,
    store: DbStore,
    ids: ChannelAllocator,
    local: LocalDirector<ServiceParticipant>,
}

impl DbServer {
    /// Loads the snapshot if one is configured and present.
    pub fn new(ctx: &AppContext, upstream: ConnectionHandle) -> Result<Self> {
        let config = ctx.config.db_server.clone();
        let mut store = match &config.snapshot_path {
            Some(path) if path.exists() => {
                let store = DbStore::load(path)?;
                info!(
                    "Loaded {} objects and {} accounts from {}",
                    store.objects.len(),
                    store.accounts.len(),
                    path.display()
                );
                store
            }
            _ => DbStore::default(),
        };
        store.next_disl_id = store.next_disl_id.max(config.first_disl_id);

        let mut ids = ChannelAllocator::new(config.id_min, config.id_max);
        for do_id in store.objects.keys() {
            ids.claim(u64::from(*do_id));
        }

        Ok(Self {
            schema: Arc::clone(&ctx.schema),
            config,
            store,
            ids,
            local: LocalDirector::new(upstream),
        })
    }

    pub fn start(&mut self) {
        self.local.subscribe(ServiceParticipant, DBSERVERS_CHANNEL);
        info!("Database server online");
    }

    pub fn store(&self) -> &DbStore {
        &self.store
    }

    fn persist(&self) {
        if let Some(path) = &self.config.snapshot_path {
            if let Err(e) = self.store.save(path) {
                error!("Failed to write snapshot {}: {}", path.display(), e);
            }
        }
    }

    /// Creates a row from the given fields plus defaults for the rest of the
    /// class's `db` fields.
    pub fn create_object(&mut self, dclass: u16, values: Vec<(u16, Vec<u8>)>) -> Result<u32> {
        let schema = Arc::clone(&self.schema);
        let class = schema.class(dclass).ok_or(DbError::UnknownClass(dclass))?;

        let mut fields = BTreeMap::new();
        for (number, data) in values {
            let field = schema.field(number).ok_or(DbError::UnknownField(number))?;
            if !class.has_field(number) {
                return Err(DbError::FieldNotInClass { field: number, dclass });
            }
            fields.insert(field.name.clone(), data);
        }

        for field in schema.fields_of(class).filter(|f| f.keywords.db && !f.is_molecular()) {
            if fields.contains_key(&field.name) {
                continue;
            }
            match &field.default {
                Some(default) => {
                    fields.insert(field.name.clone(), default.clone());
                }
                None if field.keywords.required => {
                    return Err(DbError::MissingRequired(dclass, field.name.clone()));
                }
                None => {}
            }
        }

        let id = self.ids.allocate()?;
        let do_id = u32::try_from(id).map_err(|_| DbError::IdOutOfRange(id))?;
        self.store.objects.insert(do_id, StoredObject { dclass, fields });
        self.persist();
        Ok(do_id)
    }

    /// Stored values for the requested fields; fields the row lacks are left
    /// out. `None` when there is no such row.
    pub fn get_values(&self, do_id: u32, numbers: &[u16]) -> Option<Vec<(u16, Vec<u8>)>> {
        let row = self.store.objects.get(&do_id)?;
        Some(
            numbers
                .iter()
                .filter_map(|number| {
                    let field = self.schema.field(*number)?;
                    row.fields.get(&field.name).map(|data| (*number, data.clone()))
                })
                .collect(),
        )
    }

    pub fn set_values(&mut self, do_id: u32, values: Vec<(u16, Vec<u8>)>) -> bool {
        let Some(row) = self.store.objects.get_mut(&do_id) else {
            return false;
        };
        for (number, data) in values {
            if let Some(field) = self.schema.field(number) {
                row.fields.insert(field.name.clone(), data);
            }
        }
        self.persist();
        true
    }

    pub fn delete_object(&mut self, do_id: u32) -> bool {
        if !self.store.delete(do_id) {
            return false;
        }
        self.ids.free(u64::from(do_id));
        self.persist();
        true
    }

    /// Account id and avatar slots for `username`, creating the account on
    /// first sight.
    pub fn query_account(&mut self, username: &str) -> (u32, Vec<AvatarListing>) {
        let existed = self.store.accounts.contains_key(username);
        let account = self.store.account(username).clone();
        if !existed {
            self.persist();
        }

        let avatars = account
            .avatars
            .iter()
            .filter_map(|(pos, av_id)| {
                let (name, dna) = self.name_and_dna(*av_id)?;
                Some(AvatarListing {
                    av_id: *av_id,
                    name,
                    dna,
                    pos: *pos,
                })
            })
            .collect();
        (account.disl_id, avatars)
    }

    fn name_and_dna(&self, do_id: u32) -> Option<(String, Vec<u8>)> {
        let row = self.store.objects.get(&do_id)?;
        let name = row
            .fields
            .get("setName")
            .and_then(|bytes| DatagramIterator::new(bytes).get_string16().ok())
            .unwrap_or_default();
        let dna = row
            .fields
            .get("setDNAString")
            .and_then(|bytes| DatagramIterator::new(bytes).get_blob16().ok().map(<[u8]>::to_vec))
            .unwrap_or_default();
        Some((name, dna))
    }

    /// Friends stored on an avatar as `(do_id, name, dna)`. Friends whose
    /// rows are gone are skipped; `None` when the avatar itself is missing.
    pub fn friend_list(&self, av_id: u32) -> Result<Option<Vec<(u32, String, Vec<u8>)>>> {
        let Some(row) = self.store.objects.get(&av_id) else {
            return Ok(None);
        };
        let Some(bytes) = row.fields.get("setFriendsList") else {
            return Ok(Some(Vec::new()));
        };
        let field = self
            .schema
            .class(row.dclass)
            .and_then(|dclass| dclass.field_number("setFriendsList"))
            .and_then(|number| self.schema.field(number))
            .ok_or(DbError::UnknownClass(row.dclass))?;

        let values = field.unpack(&mut DatagramIterator::new(bytes))?;
        let ids = match values.first() {
            Some(Value::Array(ids)) => ids.iter().filter_map(Value::as_u64).collect::<Vec<_>>(),
            _ => Vec::new(),
        };

        let friends = ids
            .into_iter()
            .filter_map(|id| u32::try_from(id).ok())
            .filter_map(|id| {
                let (name, dna) = self.name_and_dna(id)?;
                Some((id, name, dna))
            })
            .collect();
        Ok(Some(friends))
    }

    pub fn set_account_avatar(&mut self, disl_id: u32, pos: u8, av_id: u32) -> bool {
        let updated = self.store.set_avatar(disl_id, pos, av_id);
        if updated {
            self.persist();
        }
        updated
    }

    /// `(field u16, bytes)` pairs, sized by the schema.
    fn read_values(&self, dgi: &mut DatagramIterator<'_>, count: u16) -> Result<Vec<(u16, Vec<u8>)>> {
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let number = dgi.get_uint16()?;
            let field = self.schema.field(number).ok_or(DbError::UnknownField(number))?;
            values.push((number, field.unpack_bytes(dgi)?));
        }
        Ok(values)
    }

    /// Handles a datagram routed to us by the master director.
    pub fn handle_upstream(&mut self, bytes: &[u8]) {
        let mut dgi = DatagramIterator::new(bytes);
        let header = match dgi.read_server_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping malformed datagram from upstream: {}", e);
                return;
            }
        };
        debug!("Database received {} from {}", msg_name(header.msg_type), header.sender);

        if let Err(e) = self.handle_message(header.sender, header.msg_type, &mut dgi) {
            warn!("{} from {} failed: {}", msg_name(header.msg_type), header.sender, e);
        }
    }

    fn handle_message(&mut self, sender: u64, msg_type: u16, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        match msg_type {
            DBSERVER_CREATE_STORED_OBJECT => {
                let context = dgi.get_uint32()?;
                let dclass = dgi.get_uint16()?;
                let count = dgi.get_uint16()?;
                let result = self
                    .read_values(dgi, count)
                    .and_then(|values| self.create_object(dclass, values));
                let do_id = match result {
                    Ok(do_id) => {
                        info!("Created stored object {} of dclass {}", do_id, dclass);
                        Some(do_id)
                    }
                    Err(e) => {
                        warn!("Could not create stored object for {}: {}", sender, e);
                        None
                    }
                };

                let mut dg = Datagram::server(&[sender], DBSERVERS_CHANNEL, DBSERVER_CREATE_STORED_OBJECT_RESP)?;
                dg.add_uint32(context);
                dg.add_uint8(u8::from(do_id.is_none()));
                dg.add_uint32(do_id.unwrap_or(0));
                self.local.send_upstream(dg.into_bytes());
            }
            DBSERVER_GET_STORED_VALUES => {
                let context = dgi.get_uint32()?;
                let do_id = dgi.get_uint32()?;
                let count = dgi.get_uint16()?;
                let mut numbers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    numbers.push(dgi.get_uint16()?);
                }

                let values = self.get_values(do_id, &numbers);
                if values.is_none() {
                    debug!("No stored object {} for {}", do_id, sender);
                }
                let mut dg = Datagram::server(&[sender], DBSERVERS_CHANNEL, DBSERVER_GET_STORED_VALUES_RESP)?;
                dg.add_uint32(context);
                dg.add_uint32(do_id);
                dg.add_uint8(u8::from(values.is_some()));
                let values = values.unwrap_or_default();
                dg.add_uint16(values.len() as u16);
                for (number, data) in &values {
                    dg.add_uint16(*number);
                    dg.add_bytes(data);
                }
                self.local.send_upstream(dg.into_bytes());
            }
            DBSERVER_SET_STORED_VALUES => {
                let do_id = dgi.get_uint32()?;
                let count = dgi.get_uint16()?;
                let values = self.read_values(dgi, count)?;
                if !self.set_values(do_id, values) {
                    debug!("Write to missing stored object {} from {}", do_id, sender);
                }
            }
            DBSERVER_DELETE_STORED_OBJECT => {
                let do_id = dgi.get_uint32()?;
                if self.delete_object(do_id) {
                    info!("Deleted stored object {}", do_id);
                } else {
                    debug!("Delete of missing stored object {}", do_id);
                }
            }
            DBSERVER_ACCOUNT_QUERY => {
                let context = dgi.get_uint32()?;
                let username = dgi.get_string16()?;
                let (disl_id, avatars) = self.query_account(&username);

                let mut dg = Datagram::server(&[sender], DBSERVERS_CHANNEL, DBSERVER_ACCOUNT_QUERY_RESP)?;
                dg.add_uint32(context);
                dg.add_uint32(disl_id);
                dg.add_uint8(avatars.len() as u8);
                for avatar in &avatars {
                    dg.add_uint32(avatar.av_id);
                    dg.add_string16(&avatar.name)?;
                    dg.add_blob16(&avatar.dna)?;
                    dg.add_uint8(avatar.pos);
                }
                self.local.send_upstream(dg.into_bytes());
            }
            DBSERVER_GET_FRIEND_LIST => {
                let context = dgi.get_uint32()?;
                let av_id = dgi.get_uint32()?;
                let friends = match self.friend_list(av_id) {
                    Ok(Some(friends)) => Some(friends),
                    Ok(None) => {
                        debug!("Friend list asked for missing avatar {}", av_id);
                        None
                    }
                    Err(e) => {
                        warn!("Could not read friends of {}: {}", av_id, e);
                        None
                    }
                };

                let mut dg = Datagram::server(&[sender], DBSERVERS_CHANNEL, DBSERVER_GET_FRIEND_LIST_RESP)?;
                dg.add_uint32(context);
                dg.add_uint8(u8::from(friends.is_none()));
                let friends = friends.unwrap_or_default();
                dg.add_uint16(friends.len() as u16);
                for (do_id, name, dna) in &friends {
                    dg.add_uint32(*do_id);
                    dg.add_string16(name)?;
                    dg.add_blob16(dna)?;
                }
                self.local.send_upstream(dg.into_bytes());
            }
            DBSERVER_ACCOUNT_SET_AVATAR => {
                let disl_id = dgi.get_uint32()?;
                let pos = dgi.get_uint8()?;
                let av_id = dgi.get_uint32()?;
                if !self.set_account_avatar(disl_id, pos, av_id) {
                    warn!("Avatar {} set on unknown account {}", av_id, disl_id);
                }
            }
            _ => debug!("Unhandled database message {} from {}", msg_type, sender),
        }
        Ok(())
    }

    pub async fn run(ctx: AppContext) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (server, events) = Self::connect(&ctx).await?;
        server.serve(events).await;
        Err("lost connection to the message director".into())
    }

    pub async fn spawn(ctx: AppContext) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (server, events) = Self::connect(&ctx).await?;
        tokio::spawn(server.serve(events));
        Ok(())
    }

    async fn connect(
        ctx: &AppContext,
    ) -> std::result::Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), Box<dyn std::error::Error>> {
        let (upstream, events) = connect_upstream(&ctx.config.db_server.md_addr).await?;
        let mut server = DbServer::new(ctx, upstream)?;
        server.start();
        Ok((server, events))
    }

    pub async fn serve(mut self, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::Frame { bytes, .. } => self.handle_upstream(&bytes),
                NetworkEvent::Connected { .. } => {}
                NetworkEvent::Disconnected { .. } => break,
            }
        }
        error!("Lost connection to the message director");
    }
}
