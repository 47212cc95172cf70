//! State server: the single owner of every live distributed object.
//!
//! The service itself listens on `STATESERVERS_CHANNEL` for generates, DB
//! activations and AI/owner assignment. Each object listens on its own
//! `do_id` channel and on its parent's children channel. All of them hang off
//! one `LocalDirector`, so a datagram sent by one object to another on this
//! server is delivered locally and also forwarded to the master director.

use crate::config::StateServerConfig;
use crate::context::AppContext;
use crate::local::LocalDirector;
use crate::network::{connect_upstream, ConnectionHandle, NetworkEvent};
use crate::object::DistributedObject;
use log::{debug, error, info, warn};
use shared::channels::{location_as_channel, parent_to_children, DBSERVERS_CHANNEL, STATESERVERS_CHANNEL};
use shared::msgtypes::*;
use shared::{Datagram, DatagramError, DatagramIterator, Schema, SchemaError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Debug, Error)]
pub enum StateServerError {
    #[error("object {0} cannot be parented to itself")]
    SelfParent(u32),
    #[error("unknown object {0}")]
    UnknownObject(u32),
    #[error("object {0} already exists")]
    DuplicateObject(u32),
    #[error("unknown dclass {0}")]
    UnknownClass(u16),
    #[error("unknown field {0}")]
    UnknownField(u16),
    #[error("field {field} is not part of dclass {dclass}")]
    FieldNotInClass { field: u16, dclass: u16 },
    #[error("object {0} has no value for required field {1}")]
    MissingRequired(u32, String),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

type Result<T> = std::result::Result<T, StateServerError>;

/// Anything on this server that can receive a routed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Participant {
    Service,
    Object(u32),
}

/// A DB-backed object waiting for its stored values.
#[derive(Debug, Clone)]
struct PendingActivation {
    parent_id: u32,
    zone_id: u32,
    owner: Option<u64>,
    dclass: u16,
    context: u32,
    requester: u64,
    response_type: u16,
    ram: Vec<(u16, Vec<u8>)>,
    deadline: Instant,
}

pub struct StateServer {
    schema: Arc<Schema>,
    config: StateServerConfig,
    local: LocalDirector<Participant>,
    objects: HashMap<u32, DistributedObject>,
    db_objects: HashSet<u32>,
    pending_db: HashMap<u32, PendingActivation>,
    outbox: VecDeque<(Participant, Vec<u8>)>,
}

impl StateServer {
    pub fn new(ctx: &AppContext, upstream: ConnectionHandle) -> Self {
        Self {
            schema: Arc::clone(&ctx.schema),
            config: ctx.config.state_server.clone(),
            local: LocalDirector::new(upstream),
            objects: HashMap::new(),
            db_objects: HashSet::new(),
            pending_db: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Subscribes the service channel and creates the root object.
    pub fn start(&mut self) -> Result<()> {
        self.local.subscribe(Participant::Service, STATESERVERS_CHANNEL);

        let root = self.config.root_do_id;
        let dclass = self
            .schema
            .class_by_name("DistributedDirectory")
            .map(|c| c.number)
            .ok_or(StateServerError::UnknownClass(0))?;
        self.create_object(
            root,
            dclass,
            0,
            shared::channels::OTP_ZONE_ID_MANAGEMENT,
            HashMap::new(),
            HashMap::new(),
            None,
            STATESERVERS_CHANNEL,
        )?;
        self.flush();
        info!("State server online, root object {}", root);
        Ok(())
    }

    pub fn object(&self, do_id: u32) -> Option<&DistributedObject> {
        self.objects.get(&do_id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_db_backed(&self, do_id: u32) -> bool {
        self.db_objects.contains(&do_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_db.len()
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

    /// Queues a datagram sent by a local participant.
    fn send(&mut self, origin: Participant, bytes: Vec<u8>) {
        self.outbox.push_back((origin, bytes));
    }

    /// Routes everything queued, locally first and then upstream.
    fn flush(&mut self) {
        while let Some((origin, bytes)) = self.outbox.pop_front() {
            match self.local.receivers(&bytes, Some(origin)) {
                Ok(receivers) => {
                    for receiver in receivers {
                        self.deliver(receiver, &bytes);
                    }
                }
                Err(e) => {
                    error!("Built an unroutable datagram: {}", e);
                    continue;
                }
            }
            self.local.send_upstream(bytes);
        }
    }

    fn deliver(&mut self, receiver: Participant, bytes: &[u8]) {
        let mut dgi = DatagramIterator::new(bytes);
        let header = match dgi.read_server_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping datagram with bad header: {}", e);
                return;
            }
        };

        let result = match receiver {
            Participant::Service => self.handle_service_message(header.sender, header.msg_type, &mut dgi),
            Participant::Object(do_id) => {
                self.handle_object_message(do_id, header.sender, header.msg_type, &mut dgi)
            }
        };

        if let Err(e) = result {
            match e {
                StateServerError::UnknownObject(_) | StateServerError::UnknownClass(_) => {
                    debug!("{} from {} dropped: {}", msg_name(header.msg_type), header.sender, e)
                }
                _ => warn!("{} from {} failed: {}", msg_name(header.msg_type), header.sender, e),
            }
        }
    }

    fn handle_service_message(&mut self, sender: u64, msg_type: u16, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        debug!("State server received {} from {}", msg_name(msg_type), sender);
        match msg_type {
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED => self.handle_generate(dgi, sender, false),
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER => self.handle_generate(dgi, sender, true),
            STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT => {
                self.handle_db_generate(dgi, sender, STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP)
            }
            STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT => self.handle_db_generate(
                dgi,
                sender,
                STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT_RESP,
            ),
            DBSERVER_GET_STORED_VALUES_RESP => self.handle_stored_values(dgi),
            STATESERVER_ADD_AI_RECV => {
                let do_id = dgi.get_uint32()?;
                let ai_channel = dgi.get_channel()?;
                self.handle_add_ai(do_id, ai_channel)
            }
            STATESERVER_OBJECT_SET_OWNER_RECV => {
                let do_id = dgi.get_uint32()?;
                let owner_channel = dgi.get_channel()?;
                self.handle_set_owner(do_id, owner_channel)
            }
            STATESERVER_SHARD_RESET => {
                let ai_channel = dgi.get_channel()?;
                self.handle_shard_reset(ai_channel, sender);
                Ok(())
            }
            _ => {
                debug!("Unhandled service message {} from {}", msg_type, sender);
                Ok(())
            }
        }
    }

    fn handle_object_message(
        &mut self,
        do_id: u32,
        sender: u64,
        msg_type: u16,
        dgi: &mut DatagramIterator<'_>,
    ) -> Result<()> {
        if !self.objects.contains_key(&do_id) {
            return Err(StateServerError::UnknownObject(do_id));
        }
        debug!("Object {} received {} from {}", do_id, msg_name(msg_type), sender);

        match msg_type {
            STATESERVER_OBJECT_DELETE_RAM => {
                if dgi.get_uint32()? == do_id {
                    self.annihilate(do_id, sender);
                }
                Ok(())
            }
            STATESERVER_OBJECT_UPDATE_FIELD => {
                if dgi.get_uint32()? != do_id {
                    return Ok(());
                }
                self.handle_one_update(do_id, dgi, sender)
            }
            STATESERVER_OBJECT_UPDATE_FIELD_MULTIPLE => {
                if dgi.get_uint32()? != do_id {
                    return Ok(());
                }
                let count = dgi.get_uint16()?;
                for _ in 0..count {
                    self.handle_one_update(do_id, dgi, sender)?;
                }
                Ok(())
            }
            STATESERVER_OBJECT_SET_ZONE => {
                let new_parent = dgi.get_uint32()?;
                let new_zone = dgi.get_uint32()?;
                self.handle_location_change(do_id, new_parent, new_zone, sender)
            }
            STATESERVER_OBJECT_CHANGE_ZONE => {
                let child_id = dgi.get_uint32()?;
                let new_parent = dgi.get_uint32()?;
                let new_zone = dgi.get_uint32()?;
                let old_parent = dgi.get_uint32()?;
                let old_zone = dgi.get_uint32()?;
                self.handle_child_change(do_id, child_id, (new_parent, new_zone), (old_parent, old_zone));
                Ok(())
            }
            STATESERVER_QUERY_ZONE_OBJECT_ALL => self.handle_query_zone(do_id, dgi, sender),
            STATESERVER_QUERY_OBJECT_ALL => {
                let context = dgi.get_uint32()?;
                let response = self.object_ref(do_id)?.query_all_response(&self.schema, sender, context)?;
                self.send(Participant::Object(do_id), response);
                Ok(())
            }
            _ => {
                debug!("Object {} ignoring {} from {}", do_id, msg_name(msg_type), sender);
                Ok(())
            }
        }
    }

    fn object_ref(&self, do_id: u32) -> Result<&DistributedObject> {
        self.objects.get(&do_id).ok_or(StateServerError::UnknownObject(do_id))
    }

    fn object_mut(&mut self, do_id: u32) -> Result<&mut DistributedObject> {
        self.objects.get_mut(&do_id).ok_or(StateServerError::UnknownObject(do_id))
    }

    /// `GENERATE_WITH_REQUIRED[_OTHER](parent, zone, dclass, do_id, required..., [count, (field, bytes)...])`
    fn handle_generate(&mut self, dgi: &mut DatagramIterator<'_>, sender: u64, other: bool) -> Result<()> {
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;
        let dclass_number = dgi.get_uint16()?;
        let do_id = dgi.get_uint32()?;

        if self.objects.contains_key(&do_id) || self.pending_db.contains_key(&do_id) {
            debug!("Received duplicate generate for object {}", do_id);
            return Ok(());
        }

        let schema = Arc::clone(&self.schema);
        let dclass = schema
            .class(dclass_number)
            .ok_or(StateServerError::UnknownClass(dclass_number))?;

        let mut required = HashMap::new();
        for field in schema.required_fields(dclass) {
            required.insert(field.name.clone(), field.unpack_bytes(dgi)?);
        }

        let mut ram = HashMap::new();
        if other {
            let count = dgi.get_uint16()?;
            for _ in 0..count {
                let number = dgi.get_uint16()?;
                let field = schema.field(number).ok_or(StateServerError::UnknownField(number))?;
                if !dclass.has_field(number) {
                    return Err(StateServerError::FieldNotInClass {
                        field: number,
                        dclass: dclass_number,
                    });
                }
                let data = field.unpack_bytes(dgi)?;
                if field.keywords.ram {
                    ram.insert(field.name.clone(), data);
                } else {
                    debug!("Received non-RAM field {} within an OTHER section", field.name);
                }
            }
        }

        self.create_object(do_id, dclass_number, parent_id, zone_id, required, ram, None, sender)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_object(
        &mut self,
        do_id: u32,
        dclass: u16,
        parent_id: u32,
        zone_id: u32,
        required: HashMap<String, Vec<u8>>,
        ram: HashMap<String, Vec<u8>>,
        owner: Option<u64>,
        sender: u64,
    ) -> Result<()> {
        if parent_id == do_id {
            return Err(StateServerError::SelfParent(do_id));
        }
        if self.objects.contains_key(&do_id) {
            return Err(StateServerError::DuplicateObject(do_id));
        }

        let mut obj = DistributedObject::new(do_id, dclass, required, ram);
        obj.owner_channel = owner;
        self.objects.insert(do_id, obj);
        self.local.subscribe(Participant::Object(do_id), do_id as u64);

        debug!("Generating object {} with dclass {} in ({}, {})", do_id, dclass, parent_id, zone_id);
        self.handle_location_change(do_id, parent_id, zone_id, sender)
    }

    /// Moves an object in the location tree and tells everyone who cares.
    pub fn handle_location_change(&mut self, do_id: u32, new_parent: u32, new_zone: u32, sender: u64) -> Result<()> {
        if new_parent == do_id {
            return Err(StateServerError::SelfParent(do_id));
        }

        let obj = self.object_ref(do_id)?;
        let (old_parent, old_zone) = obj.location();
        let (old_ai, owner, pinned) = (obj.ai_channel, obj.owner_channel, obj.ai_explicitly_set);

        if new_parent == old_parent && new_zone == old_zone {
            return Ok(());
        }

        let me = Participant::Object(do_id);
        let mut targets: Vec<u64> = old_ai.into_iter().chain(owner).collect();

        if new_parent != old_parent {
            if old_parent != 0 {
                self.local.unsubscribe(me, parent_to_children(old_parent));
                targets.push(old_parent as u64);
                targets.push(location_as_channel(old_parent, old_zone));
            }

            let obj = self.object_mut(do_id)?;
            obj.parent_id = new_parent;
            obj.zone_id = new_zone;

            if new_parent != 0 {
                self.local.subscribe(me, parent_to_children(new_parent));
                targets.push(new_parent as u64);
            }

            if !pinned {
                // Unparented objects have no AI; the old one still hears the CHANGE_ZONE.
                let resolved = match new_parent {
                    0 => None,
                    parent => self.resolve_ai_channel(parent),
                };
                if resolved != old_ai {
                    self.object_mut(do_id)?.ai_channel = resolved;
                    if let Some(ai_channel) = resolved {
                        let entry = self.object_ref(do_id)?.ai_entry(&self.schema, ai_channel)?;
                        self.send(me, entry);
                    }
                }
            }
        } else {
            self.object_mut(do_id)?.zone_id = new_zone;

            // Unparented objects have no observers to tell.
            if old_parent == 0 {
                return Ok(());
            }
            targets.push(old_parent as u64);
            targets.push(location_as_channel(old_parent, old_zone));
        }

        let mut seen = HashSet::new();
        targets.retain(|channel| seen.insert(*channel));

        let mut dg = Datagram::server(&targets, sender, STATESERVER_OBJECT_CHANGE_ZONE)?;
        dg.add_uint32(do_id);
        dg.add_uint32(new_parent);
        dg.add_uint32(new_zone);
        dg.add_uint32(old_parent);
        dg.add_uint32(old_zone);
        self.send(me, dg.into_bytes());

        self.sync_child(old_parent, do_id);
        if new_parent != old_parent {
            self.sync_child(new_parent, do_id);
        }

        if new_parent != 0 {
            let entry = self
                .object_ref(do_id)?
                .location_entry(&self.schema, location_as_channel(new_parent, new_zone))?;
            self.send(me, entry);
        }
        Ok(())
    }

    /// Files `child_id` under `parent_id` according to where the child
    /// actually is now. No-op if the parent is not on this server.
    fn sync_child(&mut self, parent_id: u32, child_id: u32) {
        if parent_id == 0 {
            return;
        }
        let location = self.objects.get(&child_id).map(DistributedObject::location);
        if let Some(parent) = self.objects.get_mut(&parent_id) {
            parent.remove_child(child_id);
            if let Some((child_parent, child_zone)) = location {
                if child_parent == parent_id {
                    parent.add_child(child_zone, child_id);
                }
            }
        }
    }

    /// A parent hearing `CHANGE_ZONE` about one of its children.
    fn handle_child_change(&mut self, parent_id: u32, child_id: u32, new: (u32, u32), old: (u32, u32)) {
        if self.objects.contains_key(&child_id) {
            self.sync_child(parent_id, child_id);
            return;
        }

        let Some(parent) = self.objects.get_mut(&parent_id) else {
            return;
        };
        if new.0 == parent_id {
            if old.0 == parent_id && old.1 == new.1 {
                return;
            }
            parent.remove_child(child_id);
            parent.add_child(new.1, child_id);
        } else if old.0 == parent_id {
            parent.remove_child(child_id);
        } else {
            debug!(
                "Object {} got a location change from {} naming parent {}",
                parent_id, child_id, old.0
            );
        }
    }

    /// Nearest AI channel up the tree from `parent_id`, inclusive.
    pub fn resolve_ai_channel(&self, mut parent_id: u32) -> Option<u64> {
        // Bounded walk; a malformed tree must not hang the server.
        for _ in 0..=self.objects.len() {
            let obj = self.objects.get(&parent_id)?;
            if obj.ai_channel.is_some() {
                return obj.ai_channel;
            }
            if obj.parent_id == 0 {
                return None;
            }
            parent_id = obj.parent_id;
        }
        None
    }

    fn handle_add_ai(&mut self, do_id: u32, ai_channel: u64) -> Result<()> {
        let obj = self.object_mut(do_id)?;
        obj.ai_channel = Some(ai_channel);
        obj.ai_explicitly_set = true;
        info!("AI for object {} set to {}", do_id, ai_channel);

        let entry = self.object_ref(do_id)?.ai_entry(&self.schema, ai_channel)?;
        self.send(Participant::Object(do_id), entry);
        Ok(())
    }

    fn handle_set_owner(&mut self, do_id: u32, owner_channel: u64) -> Result<()> {
        self.object_mut(do_id)?.owner_channel = Some(owner_channel);
        debug!("Owner for object {} set to {}", do_id, owner_channel);

        let entry = self.object_ref(do_id)?.owner_entry(&self.schema, owner_channel)?;
        self.send(Participant::Object(do_id), entry);
        Ok(())
    }

    /// Deletes every object managed by an AI that went away.
    fn handle_shard_reset(&mut self, ai_channel: u64, sender: u64) {
        let mut owned: Vec<u32> = self
            .objects
            .values()
            .filter(|obj| obj.ai_channel == Some(ai_channel))
            .map(|obj| obj.do_id)
            .collect();
        owned.sort_unstable();
        info!("Shard reset for AI {}: {} objects", ai_channel, owned.len());

        for do_id in owned {
            self.annihilate(do_id, sender);
        }
    }

    /// Deletes an object and, recursively, everything parented under it.
    pub fn annihilate(&mut self, do_id: u32, sender: u64) {
        let mut worklist = VecDeque::from([(do_id, true)]);

        while let Some((id, notify_parent)) = worklist.pop_front() {
            let Some(obj) = self.objects.remove(&id) else {
                continue;
            };
            let me = Participant::Object(id);
            let (parent_id, zone_id) = obj.location();

            if notify_parent && parent_id != 0 {
                if let Ok(mut dg) = Datagram::server(&[parent_id as u64], sender, STATESERVER_OBJECT_CHANGE_ZONE) {
                    dg.add_uint32(id);
                    dg.add_uint32(0);
                    dg.add_uint32(0);
                    dg.add_uint32(parent_id);
                    dg.add_uint32(zone_id);
                    self.send(me, dg.into_bytes());
                }
            }

            let mut targets = Vec::new();
            if parent_id != 0 {
                targets.push(location_as_channel(parent_id, zone_id));
            }
            targets.extend(obj.owner_channel);
            targets.extend(obj.ai_channel);
            let mut seen = HashSet::new();
            targets.retain(|channel| seen.insert(*channel));

            if !targets.is_empty() {
                if let Ok(mut dg) = Datagram::server(&targets, sender, STATESERVER_OBJECT_DELETE_RAM) {
                    dg.add_uint32(id);
                    self.send(me, dg.into_bytes());
                }
            }

            // Children go in the next rounds; they need not tell a dying parent.
            worklist.extend(obj.all_children().into_iter().map(|child| (child, false)));

            self.db_objects.remove(&id);
            self.local.unsubscribe_all(me);
            if notify_parent {
                self.sync_child(parent_id, id);
            }
            debug!("Object {} has been deleted", id);
        }
    }

    fn handle_one_update(&mut self, do_id: u32, dgi: &mut DatagramIterator<'_>, sender: u64) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let number = dgi.get_uint16()?;
        let field = schema.field(number).ok_or(StateServerError::UnknownField(number))?;

        let obj = self.object_ref(do_id)?;
        let dclass = obj.dclass;
        if !schema.class(dclass).map_or(false, |c| c.has_field(number)) {
            return Err(StateServerError::FieldNotInClass { field: number, dclass });
        }

        let data = field.unpack_bytes(dgi)?;
        let parts = schema.split_molecular(field, &data)?;

        let obj = self.object_mut(do_id)?;
        for (part_number, bytes) in &parts {
            if let Some(part) = schema.field(*part_number) {
                obj.save_field(part, bytes.clone());
            }
        }

        let mut targets = Vec::new();
        if field.keywords.broadcast && obj.parent_id != 0 {
            targets.push(location_as_channel(obj.parent_id, obj.zone_id));
        }
        if let Some(ai_channel) = obj.ai_channel.filter(|ch| field.keywords.airecv && *ch != sender) {
            targets.push(ai_channel);
        }
        if let Some(owner) = obj.owner_channel.filter(|ch| field.keywords.ownrecv && *ch != sender) {
            targets.push(owner);
        }

        let me = Participant::Object(do_id);
        if !targets.is_empty() {
            let mut dg = Datagram::server(&targets, sender, STATESERVER_OBJECT_UPDATE_FIELD)?;
            dg.add_uint32(do_id);
            dg.add_uint16(number);
            dg.add_bytes(&data);
            self.send(me, dg.into_bytes());
        }

        if field.keywords.db && self.db_objects.contains(&do_id) {
            let stored: Vec<&(u16, Vec<u8>)> = parts
                .iter()
                .filter(|(n, _)| schema.field(*n).map_or(false, |f| f.keywords.db))
                .collect();
            let mut dg = Datagram::server(&[DBSERVERS_CHANNEL], do_id as u64, DBSERVER_SET_STORED_VALUES)?;
            dg.add_uint32(do_id);
            dg.add_uint16(stored.len() as u16);
            for (n, bytes) in stored {
                dg.add_uint16(*n);
                dg.add_bytes(bytes);
            }
            self.send(me, dg.into_bytes());
        }
        Ok(())
    }

    /// `QUERY_ZONE_OBJECT_ALL(handle, context, parent, zones...)`
    fn handle_query_zone(&mut self, do_id: u32, dgi: &mut DatagramIterator<'_>, sender: u64) -> Result<()> {
        let handle = dgi.get_uint16()?;
        let context = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        if parent_id != do_id {
            return Ok(());
        }

        let mut zones = Vec::with_capacity(dgi.remaining() / 4);
        while dgi.remaining() >= 4 {
            zones.push(dgi.get_uint32()?);
        }

        let me = Participant::Object(do_id);
        let parent = self.object_ref(do_id)?;
        let children = parent.children_in(&zones);
        debug!(
            "Zone query {}/{} on {} for {:?} matched {} objects",
            handle,
            context,
            do_id,
            zones,
            children.len()
        );

        let mut entries = Vec::with_capacity(children.len() + 1);
        if !children.is_empty() && parent.parent_id != 0 {
            entries.push(parent.location_entry(&self.schema, sender)?);
        }
        for child in &children {
            match self.objects.get(child) {
                Some(obj) => entries.push(obj.location_entry(&self.schema, sender)?),
                None => debug!("Zone index of {} names missing child {}", do_id, child),
            }
        }
        for entry in entries {
            self.send(me, entry);
        }

        let mut done = Datagram::server(&[sender], do_id as u64, STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE)?;
        done.add_uint16(handle);
        done.add_uint32(context);
        self.send(me, done.into_bytes());
        Ok(())
    }

    /// `CREATE_WITH_REQUIRED[_OTHER]_CONTEXT(do_id, parent, zone, owner, dclass, context, [count, (field, bytes)...])`
    fn handle_db_generate(&mut self, dgi: &mut DatagramIterator<'_>, sender: u64, response_type: u16) -> Result<()> {
        let do_id = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;
        let owner = dgi.get_channel()?;
        let dclass_number = dgi.get_uint16()?;
        let context = dgi.get_uint32()?;

        if self.objects.contains_key(&do_id) || self.pending_db.contains_key(&do_id) {
            warn!("Rejecting duplicate activation of object {} from {}", do_id, sender);
            return Ok(());
        }

        let schema = Arc::clone(&self.schema);
        let Some(dclass) = schema.class(dclass_number) else {
            self.send_activation_result(sender, response_type, context, None)?;
            return Err(StateServerError::UnknownClass(dclass_number));
        };

        let mut ram = Vec::new();
        if dgi.remaining() >= 2 {
            let count = dgi.get_uint16()?;
            for _ in 0..count {
                let number = dgi.get_uint16()?;
                let field = schema.field(number).ok_or(StateServerError::UnknownField(number))?;
                let data = field.unpack_bytes(dgi)?;
                if field.keywords.ram && dclass.has_field(number) {
                    ram.push((number, data));
                } else {
                    debug!("Ignoring field {} in activation of {}", field.name, do_id);
                }
            }
        }

        let db_fields: Vec<u16> = schema
            .fields_of(dclass)
            .filter(|f| f.keywords.db && !f.is_molecular())
            .map(|f| f.number)
            .collect();

        self.pending_db.insert(
            do_id,
            PendingActivation {
                parent_id,
                zone_id,
                owner: (owner != 0).then_some(owner),
                dclass: dclass_number,
                context,
                requester: sender,
                response_type,
                ram,
                deadline: Instant::now() + self.config.db_timeout,
            },
        );

        let mut query = Datagram::server(&[DBSERVERS_CHANNEL], STATESERVERS_CHANNEL, DBSERVER_GET_STORED_VALUES)?;
        query.add_uint32(context);
        query.add_uint32(do_id);
        query.add_uint16(db_fields.len() as u16);
        for number in db_fields {
            query.add_uint16(number);
        }
        self.send(Participant::Service, query.into_bytes());
        debug!("Activating object {} from the database for {}", do_id, sender);
        Ok(())
    }

    /// `GET_STORED_VALUES_RESP(context, do_id, found, count, (field, bytes)...)`
    fn handle_stored_values(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let _context = dgi.get_uint32()?;
        let do_id = dgi.get_uint32()?;
        let Some(pending) = self.pending_db.remove(&do_id) else {
            debug!("Stored values for {} with no pending activation", do_id);
            return Ok(());
        };

        match self.activate(do_id, &pending, dgi) {
            Ok(()) => {
                self.send_activation_result(pending.requester, pending.response_type, pending.context, Some(do_id))?;
                if let Some(owner) = pending.owner {
                    let entry = self.object_ref(do_id)?.owner_entry(&self.schema, owner)?;
                    self.send(Participant::Object(do_id), entry);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Activation of object {} failed: {}", do_id, e);
                if self.objects.contains_key(&do_id) {
                    self.annihilate(do_id, STATESERVERS_CHANNEL);
                }
                self.send_activation_result(pending.requester, pending.response_type, pending.context, None)
            }
        }
    }

    fn activate(&mut self, do_id: u32, pending: &PendingActivation, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let dclass = schema
            .class(pending.dclass)
            .ok_or(StateServerError::UnknownClass(pending.dclass))?;

        let found = dgi.get_uint8()? != 0;
        if !found {
            return Err(StateServerError::UnknownObject(do_id));
        }

        let mut stored = HashMap::new();
        let count = dgi.get_uint16()?;
        for _ in 0..count {
            let number = dgi.get_uint16()?;
            let field = schema.field(number).ok_or(StateServerError::UnknownField(number))?;
            stored.insert(number, field.unpack_bytes(dgi)?);
        }

        let mut required = HashMap::new();
        for field in schema.required_fields(dclass) {
            let data = stored
                .remove(&field.number)
                .or_else(|| field.default.clone())
                .ok_or_else(|| StateServerError::MissingRequired(do_id, field.name.clone()))?;
            required.insert(field.name.clone(), data);
        }

        let mut ram = HashMap::new();
        for (number, data) in stored.into_iter().chain(pending.ram.iter().cloned()) {
            if let Some(field) = schema.field(number).filter(|f| f.keywords.ram) {
                ram.insert(field.name.clone(), data);
            }
        }

        let mut obj = DistributedObject::new(do_id, pending.dclass, required, ram);
        obj.owner_channel = pending.owner;
        obj.db_backed = true;
        self.objects.insert(do_id, obj);
        self.db_objects.insert(do_id);
        self.local.subscribe(Participant::Object(do_id), do_id as u64);

        self.handle_location_change(do_id, pending.parent_id, pending.zone_id, STATESERVERS_CHANNEL)
    }

    fn send_activation_result(&mut self, requester: u64, response_type: u16, context: u32, do_id: Option<u32>) -> Result<()> {
        let mut dg = Datagram::server(&[requester], STATESERVERS_CHANNEL, response_type)?;
        dg.add_uint32(context);
        dg.add_uint8(u8::from(do_id.is_none()));
        dg.add_uint32(do_id.unwrap_or(0));
        self.send(Participant::Service, dg.into_bytes());
        Ok(())
    }

    /// Fails activations whose stored values never arrived.
    pub fn prune_pending(&mut self, now: Instant) {
        let mut expired: Vec<u32> = self
            .pending_db
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(do_id, _)| *do_id)
            .collect();
        expired.sort_unstable();

        for do_id in expired {
            if let Some(pending) = self.pending_db.remove(&do_id) {
                warn!("Activation of object {} timed out", do_id);
                if let Err(e) =
                    self.send_activation_result(pending.requester, pending.response_type, pending.context, None)
                {
                    error!("Could not report activation timeout: {}", e);
                }
            }
        }
        self.flush();
    }

    /// Connects upstream, creates the root object and serves until the
    /// message director goes away.
    pub async fn run(ctx: AppContext) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (server, events) = Self::connect(&ctx).await?;
        server.serve(events).await;
        Err("lost connection to the message director".into())
    }

    /// Like `run`, but serves in the background once the root exists.
    pub async fn spawn(ctx: AppContext) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (server, events) = Self::connect(&ctx).await?;
        tokio::spawn(server.serve(events));
        Ok(())
    }

    async fn connect(
        ctx: &AppContext,
    ) -> std::result::Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), Box<dyn std::error::Error>> {
        let (upstream, events) = connect_upstream(&ctx.config.state_server.md_addr).await?;
        let mut server = StateServer::new(ctx, upstream);
        server.start()?;
        Ok((server, events))
    }

    pub async fn serve(mut self, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
        let mut prune_interval = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(NetworkEvent::Frame { bytes, .. }) => self.handle_upstream(&bytes),
                    Some(NetworkEvent::Connected { .. }) => {}
                    Some(NetworkEvent::Disconnected { .. }) | None => {
                        error!("Lost connection to the message director");
                        break;
                    }
                },
                _ = prune_interval.tick() => self.prune_pending(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::director::ControlMessage;
    use crate::network::{ConnectionId, Outgoing};
    use shared::channels::OTP_DO_ID_TOONTOWN;
    use shared::datagram::is_control;
    use shared::{ServerHeader, Value};

    const AI: u64 = 4_000_001;
    const CLIENT: u64 = 1_000_000_001;

    struct Harness {
        ss: StateServer,
        rx: mpsc::UnboundedReceiver<Outgoing>,
        schema: Arc<Schema>,
    }

    #[derive(Debug)]
    struct Sent {
        header: ServerHeader,
        body: Vec<u8>,
    }

    impl Sent {
        fn body(&self) -> DatagramIterator<'_> {
            DatagramIterator::new(&self.body)
        }
    }

    impl Harness {
        fn new() -> Self {
            let ctx = AppContext::builtin().unwrap();
            let (tx, rx) = mpsc::unbounded_channel();
            let upstream = ConnectionHandle::new(ConnectionId(0), "127.0.0.1:1".parse().unwrap(), tx);
            let mut ss = StateServer::new(&ctx, upstream);
            ss.start().unwrap();
            let mut harness = Self {
                ss,
                rx,
                schema: ctx.schema,
            };
            harness.drain();
            harness
        }

        fn class(&self, name: &str) -> u16 {
            self.schema.class_by_name(name).unwrap().number
        }

        fn field(&self, class: &str, name: &str) -> u16 {
            let dclass = self.schema.class_by_name(class).unwrap();
            dclass.field_number(name).unwrap()
        }

        /// Everything sent upstream since the last drain, controls split out.
        fn drain_all(&mut self) -> (Vec<Sent>, Vec<ControlMessage>) {
            let mut sent = Vec::new();
            let mut controls = Vec::new();
            while let Ok(Outgoing::Frame(bytes)) = self.rx.try_recv() {
                if is_control(&bytes) {
                    controls.push(ControlMessage::parse(&bytes).unwrap());
                    continue;
                }
                let mut dgi = DatagramIterator::new(&bytes);
                let header = dgi.read_server_header().unwrap();
                let body = dgi.remaining_bytes().to_vec();
                sent.push(Sent { header, body });
            }
            (sent, controls)
        }

        fn drain(&mut self) -> Vec<Sent> {
            self.drain_all().0
        }

        fn inject(&mut self, recipients: &[u64], sender: u64, msg_type: u16, body: impl FnOnce(&mut Datagram)) {
            let mut dg = Datagram::server(recipients, sender, msg_type).unwrap();
            body(&mut dg);
            self.ss.handle_upstream(dg.bytes());
        }

        fn generate_district(&mut self, do_id: u32, parent: u32, zone: u32) {
            let dclass = self.class("ToontownDistrict");
            let schema = Arc::clone(&self.schema);
            let district = schema.class(dclass).unwrap();
            self.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_OBJECT_GENERATE_WITH_REQUIRED, |dg| {
                dg.add_uint32(parent);
                dg.add_uint32(zone);
                dg.add_uint16(dclass);
                dg.add_uint32(do_id);
                for field in schema.required_fields(district) {
                    dg.add_bytes(field.default.as_ref().unwrap());
                }
            });
        }

        fn generate_toon(&mut self, do_id: u32, parent: u32, zone: u32, ram: &[(u16, Vec<u8>)]) {
            let dclass = self.class("DistributedToon");
            let schema = Arc::clone(&self.schema);
            let toon = schema.class(dclass).unwrap();
            let msg = if ram.is_empty() {
                STATESERVER_OBJECT_GENERATE_WITH_REQUIRED
            } else {
                STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER
            };
            self.inject(&[STATESERVERS_CHANNEL], AI, msg, |dg| {
                dg.add_uint32(parent);
                dg.add_uint32(zone);
                dg.add_uint16(dclass);
                dg.add_uint32(do_id);
                for field in schema.required_fields(toon) {
                    dg.add_bytes(field.default.as_ref().unwrap());
                }
                if !ram.is_empty() {
                    dg.add_uint16(ram.len() as u16);
                    for (number, bytes) in ram {
                        dg.add_uint16(*number);
                        dg.add_bytes(bytes);
                    }
                }
            });
        }

        fn set_zone(&mut self, do_id: u32, parent: u32, zone: u32, sender: u64) {
            self.inject(&[do_id as u64], sender, STATESERVER_OBJECT_SET_ZONE, |dg| {
                dg.add_uint32(parent);
                dg.add_uint32(zone);
            });
        }
    }

    fn of_type(sent: &[Sent], msg_type: u16) -> Vec<&Sent> {
        sent.iter().filter(|s| s.header.msg_type == msg_type).collect()
    }

    #[test]
    fn test_root_object_exists_without_broadcast() {
        let mut h = Harness::new();
        let root = h.ss.object(OTP_DO_ID_TOONTOWN).unwrap();
        assert_eq!(root.location(), (0, 2));
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_start_subscribes_service_and_root() {
        let ctx = AppContext::builtin().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let upstream = ConnectionHandle::new(ConnectionId(0), "127.0.0.1:1".parse().unwrap(), tx);
        let mut ss = StateServer::new(&ctx, upstream);
        ss.start().unwrap();

        let mut controls = Vec::new();
        while let Ok(Outgoing::Frame(bytes)) = rx.try_recv() {
            controls.push(ControlMessage::parse(&bytes).unwrap());
        }
        assert!(controls.contains(&ControlMessage::SetChannel(STATESERVERS_CHANNEL)));
        assert!(controls.contains(&ControlMessage::SetChannel(OTP_DO_ID_TOONTOWN as u64)));
    }

    #[test]
    fn test_generate_places_object_and_broadcasts_entry() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);

        let obj = h.ss.object(500_001).unwrap();
        assert_eq!(obj.location(), (OTP_DO_ID_TOONTOWN, 2000));
        assert_eq!(
            h.ss.object(OTP_DO_ID_TOONTOWN).unwrap().children_in(&[2000]),
            vec![500_001]
        );

        let (sent, controls) = h.drain_all();
        assert!(controls.contains(&ControlMessage::SetChannel(500_001)));
        assert!(controls.contains(&ControlMessage::SetChannel(parent_to_children(OTP_DO_ID_TOONTOWN))));

        let change = of_type(&sent, STATESERVER_OBJECT_CHANGE_ZONE);
        assert_eq!(change.len(), 1);
        assert_eq!(change[0].header.recipients, vec![OTP_DO_ID_TOONTOWN as u64]);

        let entry = of_type(&sent, STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER);
        assert_eq!(entry.len(), 1);
        assert_eq!(
            entry[0].header.recipients,
            vec![location_as_channel(OTP_DO_ID_TOONTOWN, 2000)]
        );
        let mut body = entry[0].body();
        assert_eq!(body.get_uint8().unwrap(), 0);
        assert_eq!(body.get_uint32().unwrap(), 500_001);
    }

    #[test]
    fn test_duplicate_generate_is_dropped() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 3000, &[]);
        assert_eq!(h.ss.object(500_001).unwrap().zone_id, 2000);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_generate_other_keeps_only_ram_fields() {
        let mut h = Harness::new();
        let anim = h.field("DistributedToon", "setAnimState");
        let talk = h.field("DistributedToon", "setTalk");
        let mut talk_bytes = vec![1, 0, 0, 0];
        talk_bytes.extend([2, 0, b'h', b'i']);
        h.generate_toon(
            500_001,
            OTP_DO_ID_TOONTOWN,
            2000,
            &[(anim, vec![3, 0, b'r', b'u', b'n']), (talk, talk_bytes)],
        );

        let obj = h.ss.object(500_001).unwrap();
        assert!(obj.ram.contains_key("setAnimState"));
        assert!(!obj.ram.contains_key("setTalk"));
    }

    #[test]
    fn test_self_parenting_is_rejected() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        let result = h.ss.handle_location_change(500_001, 500_001, 1, CLIENT);
        assert!(matches!(result, Err(StateServerError::SelfParent(500_001))));
        assert_eq!(h.ss.object(500_001).unwrap().location(), (OTP_DO_ID_TOONTOWN, 2000));

        // Over the wire it is logged and dropped.
        h.set_zone(500_001, 500_001, 1, CLIENT);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_zone_change_notifies_old_location_and_parent() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        h.set_zone(500_001, OTP_DO_ID_TOONTOWN, 2001, CLIENT);
        let sent = h.drain();

        let change = of_type(&sent, STATESERVER_OBJECT_CHANGE_ZONE);
        assert_eq!(change.len(), 1);
        assert_eq!(change[0].header.sender, CLIENT);
        assert_eq!(
            change[0].header.recipients,
            vec![
                OTP_DO_ID_TOONTOWN as u64,
                location_as_channel(OTP_DO_ID_TOONTOWN, 2000)
            ]
        );
        let mut body = change[0].body();
        assert_eq!(body.get_uint32().unwrap(), 500_001);
        assert_eq!(body.get_uint32().unwrap(), OTP_DO_ID_TOONTOWN);
        assert_eq!(body.get_uint32().unwrap(), 2001);
        assert_eq!(body.get_uint32().unwrap(), OTP_DO_ID_TOONTOWN);
        assert_eq!(body.get_uint32().unwrap(), 2000);

        let entry = of_type(&sent, STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER);
        assert_eq!(
            entry[0].header.recipients,
            vec![location_as_channel(OTP_DO_ID_TOONTOWN, 2001)]
        );

        let root = h.ss.object(OTP_DO_ID_TOONTOWN).unwrap();
        assert!(root.children_in(&[2000]).is_empty());
        assert_eq!(root.children_in(&[2001]), vec![500_001]);
    }

    #[test]
    fn test_same_location_is_a_no_op() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();
        h.set_zone(500_001, OTP_DO_ID_TOONTOWN, 2000, CLIENT);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_location_invariant_across_reparenting() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.set_zone(500_001, 600_000, 7, CLIENT);

        let root = h.ss.object(OTP_DO_ID_TOONTOWN).unwrap();
        assert_eq!(root.children_in(&[2000]), Vec::<u32>::new());
        assert_eq!(root.children_in(&[3]), vec![600_000]);
        let district = h.ss.object(600_000).unwrap();
        assert_eq!(district.children_in(&[7]), vec![500_001]);

        // Exactly one parent files the object, under its current zone.
        let filings: usize = [OTP_DO_ID_TOONTOWN, 600_000]
            .iter()
            .map(|p| {
                h.ss.object(*p)
                    .unwrap()
                    .zone_objects
                    .values()
                    .filter(|c| c.contains(&500_001))
                    .count()
            })
            .sum();
        assert_eq!(filings, 1);
    }

    #[test]
    fn test_ai_resolution_follows_ancestors() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_ADD_AI_RECV, |dg| {
            dg.add_uint32(600_000);
            dg.add_channel(AI);
        });
        let sent = h.drain();
        let entry = of_type(&sent, STATESERVER_OBJECT_ENTER_AI_RECV);
        assert_eq!(entry.len(), 1);
        assert_eq!(entry[0].header.recipients, vec![AI]);

        // A child generated under the district inherits the AI.
        h.generate_toon(500_001, 600_000, 7, &[]);
        assert_eq!(h.ss.object(500_001).unwrap().ai_channel, Some(AI));
        let sent = h.drain();
        let entry = of_type(&sent, STATESERVER_OBJECT_ENTER_AI_RECV);
        assert_eq!(entry.len(), 1);
        assert_eq!(entry[0].body().get_uint32().unwrap(), 500_001);

        // A grandchild resolves through the child.
        h.generate_toon(500_002, 500_001, 1, &[]);
        assert_eq!(h.ss.object(500_002).unwrap().ai_channel, Some(AI));

        // Under the root there is no AI at all, which is fine.
        h.generate_toon(500_003, OTP_DO_ID_TOONTOWN, 2000, &[]);
        assert_eq!(h.ss.object(500_003).unwrap().ai_channel, None);
        assert_eq!(h.ss.resolve_ai_channel(OTP_DO_ID_TOONTOWN), None);
    }

    #[test]
    fn test_reparent_to_ailess_chain_clears_ai() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_ADD_AI_RECV, |dg| {
            dg.add_uint32(600_000);
            dg.add_channel(AI);
        });
        h.generate_toon(500_001, 600_000, 2000, &[]);
        h.generate_toon(500_002, 600_000, 2001, &[]);
        assert_eq!(h.ss.object(500_001).unwrap().ai_channel, Some(AI));
        h.drain();

        // The root has no AI anywhere above it.
        h.set_zone(500_001, OTP_DO_ID_TOONTOWN, 2000, CLIENT);
        assert_eq!(h.ss.object(500_001).unwrap().ai_channel, None);
        let sent = h.drain();
        assert!(of_type(&sent, STATESERVER_OBJECT_ENTER_AI_RECV).is_empty());
        // The old AI is told the object left.
        let change = of_type(&sent, STATESERVER_OBJECT_CHANGE_ZONE);
        assert_eq!(change.len(), 1);
        assert!(change[0].header.recipients.contains(&AI));

        // Dropping out of the tree entirely clears it as well.
        h.set_zone(500_002, 0, 0, CLIENT);
        assert_eq!(h.ss.object(500_002).unwrap().ai_channel, None);
        assert!(of_type(&h.drain(), STATESERVER_OBJECT_ENTER_AI_RECV).is_empty());

        // Moving back under the district picks the AI up again.
        h.set_zone(500_001, 600_000, 2000, CLIENT);
        assert_eq!(h.ss.object(500_001).unwrap().ai_channel, Some(AI));
        assert_eq!(of_type(&h.drain(), STATESERVER_OBJECT_ENTER_AI_RECV).len(), 1);
    }

    #[test]
    fn test_pinned_ai_survives_moves() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_ADD_AI_RECV, |dg| {
            dg.add_uint32(500_001);
            dg.add_channel(AI + 1);
        });
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.set_zone(500_001, 600_000, 1, CLIENT);
        assert_eq!(h.ss.object(500_001).unwrap().ai_channel, Some(AI + 1));
    }

    #[test]
    fn test_update_fan_out_rules() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_ADD_AI_RECV, |dg| {
            dg.add_uint32(500_001);
            dg.add_channel(AI);
        });
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_OBJECT_SET_OWNER_RECV, |dg| {
            dg.add_uint32(500_001);
            dg.add_channel(CLIENT);
        });
        h.drain();

        // broadcast + airecv, sent by the owner.
        let set_x = h.field("DistributedToon", "setX");
        h.inject(&[500_001], CLIENT, STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(set_x);
            dg.add_float64(4.0);
        });
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].header.recipients,
            vec![location_as_channel(OTP_DO_ID_TOONTOWN, 2000), AI]
        );
        assert_eq!(sent[0].header.sender, CLIENT);
        assert!(h.ss.object(500_001).unwrap().ram.contains_key("setX"));

        // ownrecv + airecv, sent by the AI: only the owner hears it.
        let money = h.field("DistributedToon", "setMoney");
        h.inject(&[500_001], AI, STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(money);
            dg.add_uint16(99);
        });
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.recipients, vec![CLIENT]);
        assert_eq!(h.ss.object(500_001).unwrap().required.get("setMoney"), Some(&vec![99, 0]));
    }

    #[test]
    fn test_molecular_update_stores_parts() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        let set_xy = h.field("DistributedToon", "setXY");
        h.inject(&[500_001], CLIENT, STATESERVER_OBJECT_UPDATE_FIELD_MULTIPLE, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(1);
            dg.add_uint16(set_xy);
            dg.add_float64(1.0);
            dg.add_float64(2.0);
        });

        let obj = h.ss.object(500_001).unwrap();
        assert_eq!(obj.ram.get("setX"), Some(&1.0f64.to_le_bytes().to_vec()));
        assert_eq!(obj.ram.get("setY"), Some(&2.0f64.to_le_bytes().to_vec()));
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        let mut body = sent[0].body();
        body.get_uint32().unwrap();
        assert_eq!(body.get_uint16().unwrap(), set_xy);
    }

    #[test]
    fn test_update_for_foreign_field_is_dropped() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        let logger = h.field("CentralLogger", "sendMessage");
        h.inject(&[500_001], CLIENT, STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(500_001);
            dg.add_uint16(logger);
            dg.add_string16("a").unwrap();
            dg.add_string16("b").unwrap();
            dg.add_uint32(0);
            dg.add_uint32(0);
        });
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_zone_query_sends_entries_then_done() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.generate_toon(500_002, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.generate_toon(500_003, OTP_DO_ID_TOONTOWN, 3000, &[]);
        h.drain();

        h.inject(&[OTP_DO_ID_TOONTOWN as u64], CLIENT, STATESERVER_QUERY_ZONE_OBJECT_ALL, |dg| {
            dg.add_uint16(1);
            dg.add_uint32(5);
            dg.add_uint32(OTP_DO_ID_TOONTOWN);
            dg.add_uint32(2000);
        });
        let sent = h.drain();
        assert_eq!(sent.len(), 3);
        // The root is unparented, so it does not describe itself.
        let ids: Vec<u32> = sent[..2]
            .iter()
            .map(|s| {
                assert_eq!(s.header.msg_type, STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER);
                assert_eq!(s.header.recipients, vec![CLIENT]);
                let mut body = s.body();
                body.get_uint8().unwrap();
                body.get_uint32().unwrap()
            })
            .collect();
        assert_eq!(ids, vec![500_001, 500_002]);

        assert_eq!(sent[2].header.msg_type, STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE);
        let mut body = sent[2].body();
        assert_eq!(body.get_uint16().unwrap(), 1);
        assert_eq!(body.get_uint32().unwrap(), 5);
    }

    #[test]
    fn test_zone_query_includes_parented_parent() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.generate_toon(500_001, 600_000, 7, &[]);
        h.drain();

        h.inject(&[600_000], CLIENT, STATESERVER_QUERY_ZONE_OBJECT_ALL, |dg| {
            dg.add_uint16(2);
            dg.add_uint32(9);
            dg.add_uint32(600_000);
            dg.add_uint32(7);
        });
        let sent = h.drain();
        assert_eq!(sent.len(), 3);
        let mut first = sent[0].body();
        first.get_uint8().unwrap();
        assert_eq!(first.get_uint32().unwrap(), 600_000);

        // Nothing in the zone: only the sentinel.
        h.inject(&[600_000], CLIENT, STATESERVER_QUERY_ZONE_OBJECT_ALL, |dg| {
            dg.add_uint16(3);
            dg.add_uint32(10);
            dg.add_uint32(600_000);
            dg.add_uint32(8);
        });
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.msg_type, STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE);
    }

    #[test]
    fn test_query_object_all() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        h.inject(&[500_001], CLIENT, STATESERVER_QUERY_OBJECT_ALL, |dg| dg.add_uint32(44));
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.msg_type, STATESERVER_QUERY_OBJECT_ALL_RESP);
        let mut body = sent[0].body();
        assert_eq!(body.get_uint32().unwrap(), 44);
        assert_eq!(body.get_uint32().unwrap(), 500_001);
        assert_eq!(body.get_uint32().unwrap(), OTP_DO_ID_TOONTOWN);
        assert_eq!(body.get_uint32().unwrap(), 2000);
    }

    #[test]
    fn test_cascading_delete() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.generate_toon(500_001, 600_000, 7, &[]);
        h.generate_toon(500_002, 500_001, 1, &[]);
        h.generate_toon(500_003, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.drain();

        h.inject(&[600_000], AI, STATESERVER_OBJECT_DELETE_RAM, |dg| dg.add_uint32(600_000));

        assert!(h.ss.object(600_000).is_none());
        assert!(h.ss.object(500_001).is_none());
        assert!(h.ss.object(500_002).is_none());
        assert!(h.ss.object(500_003).is_some());
        assert!(h.ss.object(OTP_DO_ID_TOONTOWN).unwrap().children_in(&[3]).is_empty());

        let (sent, controls) = h.drain_all();
        let deletes: Vec<u32> = of_type(&sent, STATESERVER_OBJECT_DELETE_RAM)
            .iter()
            .map(|s| s.body().get_uint32().unwrap())
            .collect();
        assert_eq!(deletes, vec![600_000, 500_001, 500_002]);
        assert!(controls.contains(&ControlMessage::RemoveChannel(600_000)));
        assert!(controls.contains(&ControlMessage::RemoveChannel(500_002)));

        // Later references are harmless.
        h.set_zone(500_001, OTP_DO_ID_TOONTOWN, 1, CLIENT);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_delete_ram_for_other_object_is_ignored() {
        let mut h = Harness::new();
        h.generate_toon(500_001, OTP_DO_ID_TOONTOWN, 2000, &[]);
        h.inject(&[500_001], AI, STATESERVER_OBJECT_DELETE_RAM, |dg| dg.add_uint32(123));
        assert!(h.ss.object(500_001).is_some());
    }

    #[test]
    fn test_shard_reset_removes_ai_objects() {
        let mut h = Harness::new();
        h.generate_district(600_000, OTP_DO_ID_TOONTOWN, 3);
        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_ADD_AI_RECV, |dg| {
            dg.add_uint32(600_000);
            dg.add_channel(AI);
        });
        h.generate_toon(500_001, 600_000, 7, &[]);
        h.generate_toon(500_002, OTP_DO_ID_TOONTOWN, 2000, &[]);

        h.inject(&[STATESERVERS_CHANNEL], AI, STATESERVER_SHARD_RESET, |dg| dg.add_channel(AI));
        assert!(h.ss.object(600_000).is_none());
        assert!(h.ss.object(500_001).is_none());
        assert!(h.ss.object(500_002).is_some());
    }

    fn request_activation(h: &mut Harness, do_id: u32, owner: u64, context: u32) {
        let dclass = h.class("DistributedToon");
        h.inject(&[STATESERVERS_CHANNEL], CLIENT, STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT, |dg| {
            dg.add_uint32(do_id);
            dg.add_uint32(OTP_DO_ID_TOONTOWN);
            dg.add_uint32(2000);
            dg.add_channel(owner);
            dg.add_uint16(dclass);
            dg.add_uint32(context);
        });
    }

    #[test]
    fn test_db_activation() {
        let mut h = Harness::new();
        request_activation(&mut h, 100_000_001, CLIENT, 7);

        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.msg_type, DBSERVER_GET_STORED_VALUES);
        assert_eq!(sent[0].header.recipients, vec![DBSERVERS_CHANNEL]);
        assert_eq!(sent[0].header.sender, STATESERVERS_CHANNEL);
        let mut body = sent[0].body();
        assert_eq!(body.get_uint32().unwrap(), 7);
        assert_eq!(body.get_uint32().unwrap(), 100_000_001);
        assert_eq!(body.get_uint16().unwrap(), 8);
        assert_eq!(h.ss.pending_count(), 1);
        assert!(h.ss.object(100_000_001).is_none());

        // Duplicate request while pending is not re-queried.
        request_activation(&mut h, 100_000_001, CLIENT, 8);
        assert!(h.drain().is_empty());

        let name = h.field("DistributedToon", "setName");
        let schema = Arc::clone(&h.schema);
        let name_bytes = schema.field(name).unwrap().pack(&[Value::String("Dimm".into())]).unwrap();
        h.inject(&[STATESERVERS_CHANNEL], DBSERVERS_CHANNEL, DBSERVER_GET_STORED_VALUES_RESP, |dg| {
            dg.add_uint32(7);
            dg.add_uint32(100_000_001);
            dg.add_uint8(1);
            dg.add_uint16(1);
            dg.add_uint16(name);
            dg.add_bytes(&name_bytes);
        });

        let obj = h.ss.object(100_000_001).unwrap();
        assert_eq!(obj.required.get("setName"), Some(&name_bytes));
        assert_eq!(obj.owner_channel, Some(CLIENT));
        assert!(h.ss.is_db_backed(100_000_001));

        let sent = h.drain();
        let resp = of_type(&sent, STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP);
        assert_eq!(resp.len(), 1);
        assert_eq!(resp[0].header.recipients, vec![CLIENT]);
        let mut body = resp[0].body();
        assert_eq!(body.get_uint32().unwrap(), 7);
        assert_eq!(body.get_uint8().unwrap(), 0);
        assert_eq!(body.get_uint32().unwrap(), 100_000_001);

        let owner = of_type(&sent, STATESERVER_OBJECT_ENTER_OWNER_RECV);
        assert_eq!(owner.len(), 1);
        assert_eq!(owner[0].header.recipients, vec![CLIENT]);

        // db fields of a DB-backed object are written back.
        let hp = h.field("DistributedToon", "setHp");
        h.inject(&[100_000_001], AI, STATESERVER_OBJECT_UPDATE_FIELD, |dg| {
            dg.add_uint32(100_000_001);
            dg.add_uint16(hp);
            dg.add_int16(3);
        });
        let sent = h.drain();
        let write = of_type(&sent, DBSERVER_SET_STORED_VALUES);
        assert_eq!(write.len(), 1);
        let mut body = write[0].body();
        assert_eq!(body.get_uint32().unwrap(), 100_000_001);
        assert_eq!(body.get_uint16().unwrap(), 1);
        assert_eq!(body.get_uint16().unwrap(), hp);
        assert_eq!(body.get_int16().unwrap(), 3);
    }

    #[test]
    fn test_db_activation_not_found_fails() {
        let mut h = Harness::new();
        request_activation(&mut h, 100_000_001, CLIENT, 7);
        h.drain();

        h.inject(&[STATESERVERS_CHANNEL], DBSERVERS_CHANNEL, DBSERVER_GET_STORED_VALUES_RESP, |dg| {
            dg.add_uint32(7);
            dg.add_uint32(100_000_001);
            dg.add_uint8(0);
            dg.add_uint16(0);
        });
        assert!(h.ss.object(100_000_001).is_none());
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        let mut body = sent[0].body();
        assert_eq!(body.get_uint32().unwrap(), 7);
        assert_eq!(body.get_uint8().unwrap(), 1);
        assert_eq!(body.get_uint32().unwrap(), 0);
    }

    #[test]
    fn test_db_activation_times_out() {
        let mut h = Harness::new();
        request_activation(&mut h, 100_000_001, CLIENT, 7);
        h.drain();

        h.ss.prune_pending(Instant::now());
        assert_eq!(h.ss.pending_count(), 1);

        h.ss.prune_pending(Instant::now() + Duration::from_secs(60));
        assert_eq!(h.ss.pending_count(), 0);
        let sent = h.drain();
        assert_eq!(sent.len(), 1);
        let mut body = sent[0].body();
        body.get_uint32().unwrap();
        assert_eq!(body.get_uint8().unwrap(), 1);
    }
}
