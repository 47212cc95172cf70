//! AI repository: the server-side game logic process of one district.
//!
//! Only the wire glue lives here. The repository owns a channel and a do_id
//! range, generates objects through the state server, receives the objects
//! it is AI for, and can steer client interests through the client agent.

use crate::config::AiConfig;
use crate::context::AppContext;
use crate::local::{LocalDirector, ServiceParticipant};
use crate::network::{connect_upstream, ConnectionHandle, NetworkEvent};
use log::{debug, error, info, warn};
use shared::channels::{OTP_DO_ID_TOONTOWN, OTP_ZONE_ID_DISTRICTS, STATESERVERS_CHANNEL};
use shared::msgtypes::*;
use shared::{
    AllocatorError, ChannelAllocator, Datagram, DatagramError, DatagramIterator, Schema, SchemaError, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("unknown class '{0}'")]
    UnknownClass(String),
    #[error("class '{class}' has no field '{field}'")]
    UnknownField { class: String, field: String },
    #[error("required field '{0}' has no value and no default")]
    MissingRequired(String),
    #[error("unknown object {0}")]
    UnknownObject(u32),
    #[error("allocated id {0} does not fit a do_id")]
    IdOutOfRange(u64),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

type Result<T> = std::result::Result<T, AiError>;

/// What the AI knows about an object it hears about.
#[derive(Debug, Clone, PartialEq)]
pub struct AiObject {
    pub do_id: u32,
    pub dclass: u16,
    pub parent_id: u32,
    pub zone_id: u32,
    pub fields: HashMap<String, Vec<u8>>,
}

pub struct AiRepository {
    schema: Arc<Schema>,
    config: AiConfig,
    channel: u64,
    ids: ChannelAllocator,
    local: LocalDirector<ServiceParticipant>,
    objects: HashMap<u32, AiObject>,
    district_id: Option<u32>,
}

impl AiRepository {
    /// Takes the first id of the configured range as the AI channel.
    pub fn new(ctx: &AppContext, upstream: ConnectionHandle) -> Result<Self> {
        let config = ctx.config.ai.clone();
        let mut ids = ChannelAllocator::new(config.channel_min, config.channel_max);
        let channel = ids.allocate()?;
        Ok(Self {
            schema: Arc::clone(&ctx.schema),
            config,
            channel,
            ids,
            local: LocalDirector::new(upstream),
            objects: HashMap::new(),
            district_id: None,
        })
    }

    pub fn channel(&self) -> u64 {
        self.channel
    }

    pub fn district_id(&self) -> Option<u32> {
        self.district_id
    }

    pub fn object(&self, do_id: u32) -> Option<&AiObject> {
        self.objects.get(&do_id)
    }

    /// Registers the AI channel and the shard reset the director sends on
    /// our behalf if this connection drops.
    pub fn start(&mut self) -> Result<()> {
        self.local.subscribe(ServiceParticipant, self.channel);

        let mut reset = Datagram::server(&[STATESERVERS_CHANNEL], self.channel, STATESERVER_SHARD_RESET)?;
        reset.add_channel(self.channel);
        self.local.add_post_remove(reset.into_bytes());

        info!("AI repository online on channel {}", self.channel);
        Ok(())
    }

    pub fn allocate_do_id(&mut self) -> Result<u32> {
        let id = self.ids.allocate()?;
        u32::try_from(id).map_err(|_| AiError::IdOutOfRange(id))
    }

    fn pack(&self, class: &str, field: &str, values: &[Value]) -> Result<(u16, Vec<u8>)> {
        let dclass = self
            .schema
            .class_by_name(class)
            .ok_or_else(|| AiError::UnknownClass(class.to_string()))?;
        let field = self.schema.class_field(dclass, field).ok_or_else(|| AiError::UnknownField {
            class: class.to_string(),
            field: field.to_string(),
        })?;
        Ok((field.number, field.pack(values)?))
    }

    /// Generates a new object at `(parent, zone)`.
    ///
    /// Required fields not in `values` fall back to their defaults; any other
    /// field given goes into the OTHER section.
    pub fn generate_with_required(
        &mut self,
        class: &str,
        parent_id: u32,
        zone_id: u32,
        values: &[(&str, Vec<Value>)],
    ) -> Result<u32> {
        let schema = Arc::clone(&self.schema);
        let dclass = schema
            .class_by_name(class)
            .ok_or_else(|| AiError::UnknownClass(class.to_string()))?;

        let mut packed = HashMap::new();
        for (name, field_values) in values {
            let (number, data) = self.pack(class, name, field_values)?;
            packed.insert(number, data);
        }

        let do_id = self.allocate_do_id()?;
        let mut fields = HashMap::new();
        let mut required = Datagram::new();
        for field in schema.required_fields(dclass) {
            let data = packed
                .remove(&field.number)
                .or_else(|| field.default.clone())
                .ok_or_else(|| AiError::MissingRequired(field.name.clone()))?;
            required.add_bytes(&data);
            fields.insert(field.name.clone(), data);
        }

        let msg_type = if packed.is_empty() {
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED
        } else {
            STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER
        };
        let mut dg = Datagram::server(&[STATESERVERS_CHANNEL], self.channel, msg_type)?;
        dg.add_uint32(parent_id);
        dg.add_uint32(zone_id);
        dg.add_uint16(dclass.number);
        dg.add_uint32(do_id);
        dg.add_bytes(required.bytes());
        if !packed.is_empty() {
            let mut other: Vec<(u16, Vec<u8>)> = packed.into_iter().collect();
            other.sort_by_key(|(number, _)| *number);
            dg.add_uint16(other.len() as u16);
            for (number, data) in other {
                dg.add_uint16(number);
                dg.add_bytes(&data);
                if let Some(field) = schema.field(number) {
                    fields.insert(field.name.clone(), data);
                }
            }
        }
        self.local.send_upstream(dg.into_bytes());

        self.objects.insert(
            do_id,
            AiObject {
                do_id,
                dclass: dclass.number,
                parent_id,
                zone_id,
                fields,
            },
        );
        debug!("Generated {} {} in ({}, {})", class, do_id, parent_id, zone_id);
        Ok(do_id)
    }

    /// Pins this AI as the object's AI.
    pub fn set_ai(&mut self, do_id: u32) -> Result<()> {
        let mut dg = Datagram::server(&[STATESERVERS_CHANNEL], self.channel, STATESERVER_ADD_AI_RECV)?;
        dg.add_uint32(do_id);
        dg.add_channel(self.channel);
        self.local.send_upstream(dg.into_bytes());
        Ok(())
    }

    pub fn send_update(&mut self, do_id: u32, field: &str, values: &[Value]) -> Result<()> {
        let class = self
            .objects
            .get(&do_id)
            .and_then(|obj| self.schema.class(obj.dclass))
            .map(|dclass| dclass.name.clone())
            .ok_or(AiError::UnknownObject(do_id))?;
        let (number, data) = self.pack(&class, field, values)?;

        let mut dg = Datagram::server(&[do_id as u64], self.channel, STATESERVER_OBJECT_UPDATE_FIELD)?;
        dg.add_uint32(do_id);
        dg.add_uint16(number);
        dg.add_bytes(&data);
        self.local.send_upstream(dg.into_bytes());

        if let Some(obj) = self.objects.get_mut(&do_id) {
            obj.fields.insert(field.to_string(), data);
        }
        Ok(())
    }

    pub fn set_location(&mut self, do_id: u32, parent_id: u32, zone_id: u32) -> Result<()> {
        let mut dg = Datagram::server(&[do_id as u64], self.channel, STATESERVER_OBJECT_SET_ZONE)?;
        dg.add_uint32(parent_id);
        dg.add_uint32(zone_id);
        self.local.send_upstream(dg.into_bytes());
        Ok(())
    }

    pub fn delete_object(&mut self, do_id: u32) -> Result<()> {
        let mut dg = Datagram::server(&[do_id as u64], self.channel, STATESERVER_OBJECT_DELETE_RAM)?;
        dg.add_uint32(do_id);
        self.local.send_upstream(dg.into_bytes());
        Ok(())
    }

    /// Opens an interest on a client's behalf. The client gets no ack.
    pub fn set_interest(&mut self, client: u64, handle: u16, context: u32, parent_id: u32, zones: &[u32]) -> Result<()> {
        let mut dg = Datagram::server(&[client], self.channel, CLIENT_AGENT_SET_INTEREST)?;
        dg.add_uint16(handle);
        dg.add_uint32(context);
        dg.add_uint32(parent_id);
        for zone in zones {
            dg.add_uint32(*zone);
        }
        self.local.send_upstream(dg.into_bytes());
        Ok(())
    }

    pub fn remove_interest(&mut self, client: u64, handle: u16, context: u32) -> Result<()> {
        let mut dg = Datagram::server(&[client], self.channel, CLIENT_AGENT_REMOVE_INTEREST)?;
        dg.add_uint16(handle);
        dg.add_uint32(context);
        self.local.send_upstream(dg.into_bytes());
        Ok(())
    }

    /// Creates this AI's district under the root and takes ownership of it.
    pub fn create_district(&mut self) -> Result<u32> {
        let name = self.config.district_name.clone();
        let do_id = self.generate_with_required(
            "ToontownDistrict",
            OTP_DO_ID_TOONTOWN,
            OTP_ZONE_ID_DISTRICTS,
            &[("setName", vec![Value::String(name.clone())])],
        )?;
        self.set_ai(do_id)?;
        self.district_id = Some(do_id);
        info!("District {} ({}) created", name, do_id);
        Ok(do_id)
    }

    pub fn handle_upstream(&mut self, bytes: &[u8]) {
        let mut dgi = DatagramIterator::new(bytes);
        let header = match dgi.read_server_header() {
            Ok(header) => header,
            Err(e) => {
                warn!("Dropping malformed datagram from upstream: {}", e);
                return;
            }
        };
        if header.sender == self.channel {
            return;
        }
        if let Err(e) = self.handle_message(header.sender, header.msg_type, &mut dgi) {
            warn!("{} from {} failed: {}", msg_name(header.msg_type), header.sender, e);
        }
    }

    fn handle_message(&mut self, sender: u64, msg_type: u16, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        match msg_type {
            STATESERVER_OBJECT_ENTER_AI_RECV => self.handle_enter(dgi),
            STATESERVER_OBJECT_CHANGE_ZONE => {
                let do_id = dgi.get_uint32()?;
                let parent_id = dgi.get_uint32()?;
                let zone_id = dgi.get_uint32()?;
                if let Some(obj) = self.objects.get_mut(&do_id) {
                    obj.parent_id = parent_id;
                    obj.zone_id = zone_id;
                }
                Ok(())
            }
            STATESERVER_OBJECT_UPDATE_FIELD => {
                let do_id = dgi.get_uint32()?;
                let number = dgi.get_uint16()?;
                let field = self
                    .schema
                    .field(number)
                    .ok_or_else(|| AiError::UnknownField {
                        class: String::new(),
                        field: number.to_string(),
                    })?;
                let data = field.unpack_bytes(dgi)?;
                match self.objects.get_mut(&do_id) {
                    Some(obj) => {
                        debug!("{} updated {} on {}", sender, field.name, do_id);
                        obj.fields.insert(field.name.clone(), data);
                    }
                    None => debug!("Update for unknown object {} from {}", do_id, sender),
                }
                Ok(())
            }
            STATESERVER_OBJECT_DELETE_RAM => {
                let do_id = dgi.get_uint32()?;
                if self.objects.remove(&do_id).is_some() {
                    debug!("Object {} deleted by {}", do_id, sender);
                    self.ids.free(u64::from(do_id));
                    if self.district_id == Some(do_id) {
                        warn!("Our district {} was deleted", do_id);
                        self.district_id = None;
                    }
                }
                Ok(())
            }
            _ => {
                debug!("AI ignoring {} from {}", msg_name(msg_type), sender);
                Ok(())
            }
        }
    }

    /// `ENTER_AI_RECV(do_id, parent, zone, dclass, required..., count, (field, bytes)...)`
    fn handle_enter(&mut self, dgi: &mut DatagramIterator<'_>) -> Result<()> {
        let do_id = dgi.get_uint32()?;
        let parent_id = dgi.get_uint32()?;
        let zone_id = dgi.get_uint32()?;
        let dclass_number = dgi.get_uint16()?;

        let schema = Arc::clone(&self.schema);
        let dclass = schema
            .class(dclass_number)
            .ok_or_else(|| AiError::UnknownClass(dclass_number.to_string()))?;

        let mut fields = HashMap::new();
        for field in schema.required_fields(dclass) {
            fields.insert(field.name.clone(), field.unpack_bytes(dgi)?);
        }
        let count = dgi.get_uint16()?;
        for _ in 0..count {
            let number = dgi.get_uint16()?;
            let field = schema.field(number).ok_or_else(|| AiError::UnknownField {
                class: dclass.name.clone(),
                field: number.to_string(),
            })?;
            fields.insert(field.name.clone(), field.unpack_bytes(dgi)?);
        }

        debug!("Now AI for {} {} in ({}, {})", dclass.name, do_id, parent_id, zone_id);
        self.objects.insert(
            do_id,
            AiObject {
                do_id,
                dclass: dclass_number,
                parent_id,
                zone_id,
                fields,
            },
        );
        Ok(())
    }

    /// Connects, creates the district and serves until the director goes away.
    pub async fn run(ctx: AppContext) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (upstream, mut events) = connect_upstream(&ctx.config.ai.md_addr).await?;
        let mut ai = AiRepository::new(&ctx, upstream)?;
        ai.start()?;
        ai.create_district()?;

        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::Frame { bytes, .. } => ai.handle_upstream(&bytes),
                NetworkEvent::Connected { .. } => {}
                NetworkEvent::Disconnected { .. } => break,
            }
        }
        error!("Lost connection to the message director");
        Err("lost connection to the message director".into())
    }
}
