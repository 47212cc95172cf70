//! Uberdogs: cluster-global objects living outside any district.
//!
//! An uberdog generates itself under the root object's management zone,
//! listens on its own do_id, and leaves a `DELETE_RAM` with the director so
//! the object dies with the connection. Field updates addressed to it are
//! decoded and handed to an `UberdogHandler`.

use crate::context::AppContext;
use crate::local::{LocalDirector, ServiceParticipant};
use crate::network::{connect_upstream, ConnectionHandle, NetworkEvent};
use log::{debug, error, info, warn};
use shared::channels::{OTP_DO_ID_CENTRAL_LOGGER, OTP_DO_ID_TOONTOWN, OTP_ZONE_ID_MANAGEMENT, STATESERVERS_CHANNEL};
use shared::msgtypes::*;
use shared::{Datagram, DatagramIterator, Field, Schema, SchemaError, Value};
use std::sync::Arc;

/// Game logic behind an uberdog.
pub trait UberdogHandler: Send {
    fn do_id(&self) -> u32;

    fn dclass_name(&self) -> &str;

    /// Handles one decoded field update. Returns server datagrams to send.
    fn handle_update(&mut self, sender: u64, field: &Field, values: &[Value]) -> Vec<Vec<u8>>;
}

/// Logs client-reported events.
#[derive(Debug, Default)]
pub struct CentralLogger {
    logged: u64,
}

impl CentralLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logged(&self) -> u64 {
        self.logged
    }
}

impl UberdogHandler for CentralLogger {
    fn do_id(&self) -> u32 {
        OTP_DO_ID_CENTRAL_LOGGER
    }

    fn dclass_name(&self) -> &str {
        "CentralLogger"
    }

    fn handle_update(&mut self, sender: u64, field: &Field, values: &[Value]) -> Vec<Vec<u8>> {
        if field.name != "sendMessage" {
            debug!("Central logger ignoring {} from {}", field.name, sender);
            return Vec::new();
        }
        match values {
            [category, event, target_disl, target_av] => {
                self.logged += 1;
                info!(
                    "[{}] {} (sender {}, account {}, avatar {})",
                    category.as_str().unwrap_or_default(),
                    event.as_str().unwrap_or_default(),
                    sender,
                    target_disl.as_u64().unwrap_or_default(),
                    target_av.as_u64().unwrap_or_default()
                );
            }
            _ => warn!("Malformed sendMessage from {}", sender),
        }
        Vec::new()
    }
}

pub struct Uberdog {
    schema: Arc<Schema>,
    local: LocalDirector<ServiceParticipant>,
    handler: Box<dyn UberdogHandler>,
}

impl Uberdog {
    pub fn new(ctx: &AppContext, upstream: ConnectionHandle, handler: Box<dyn UberdogHandler>) -> Self {
        Self {
            schema: Arc::clone(&ctx.schema),
            local: LocalDirector::new(upstream),
            handler,
        }
    }

    pub fn do_id(&self) -> u32 {
        self.handler.do_id()
    }

    /// Subscribes the object channel, generates the object and arranges for
    /// its deletion when this connection drops.
    pub fn start(&mut self) -> Result<(), SchemaError> {
        let do_id = self.do_id();
        let dclass = self
            .schema
            .class_by_name(self.handler.dclass_name())
            .ok_or_else(|| SchemaError::UnknownClass(self.handler.dclass_name().to_string()))?;

        self.local.subscribe(ServiceParticipant, do_id as u64);

        let mut generate = Datagram::server(&[STATESERVERS_CHANNEL], do_id as u64, STATESERVER_OBJECT_GENERATE_WITH_REQUIRED)?;
        generate.add_uint32(OTP_DO_ID_TOONTOWN);
        generate.add_uint32(OTP_ZONE_ID_MANAGEMENT);
        generate.add_uint16(dclass.number);
        generate.add_uint32(do_id);
        for field in self.schema.required_fields(dclass) {
            let Some(default) = &field.default else {
                return Err(SchemaError::MissingDefault(field.name.clone()));
            };
            generate.add_bytes(default);
        }

        let mut delete = Datagram::server(&[do_id as u64], do_id as u64, STATESERVER_OBJECT_DELETE_RAM)?;
        delete.add_uint32(do_id);
        self.local.add_post_remove(delete.into_bytes());
        self.local.send_upstream(generate.into_bytes());

        info!("Uberdog {} ({}) online", do_id, dclass.name);
        Ok(())
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
        if header.msg_type != STATESERVER_OBJECT_UPDATE_FIELD {
            debug!("Uberdog {} ignoring {} from {}", self.do_id(), msg_name(header.msg_type), header.sender);
            return;
        }

        match self.decode_update(&mut dgi) {
            Ok(Some((field, values))) => {
                for datagram in self.handler.handle_update(header.sender, &field, &values) {
                    self.local.send_upstream(datagram);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Bad update for uberdog {} from {}: {}", self.do_id(), header.sender, e),
        }
    }

    fn decode_update(&self, dgi: &mut DatagramIterator<'_>) -> Result<Option<(Field, Vec<Value>)>, SchemaError> {
        let do_id = dgi.get_uint32()?;
        if do_id != self.do_id() {
            return Ok(None);
        }
        let number = dgi.get_uint16()?;
        let Some(field) = self.schema.field(number) else {
            debug!("Uberdog {} got unknown field {}", do_id, number);
            return Ok(None);
        };
        let in_class = self
            .schema
            .class_by_name(self.handler.dclass_name())
            .map_or(false, |dclass| dclass.has_field(number));
        if !in_class {
            debug!("Uberdog {} got foreign field {}", do_id, field.name);
            return Ok(None);
        }
        let values = field.unpack(dgi)?;
        Ok(Some((field.clone(), values)))
    }

    pub async fn run(ctx: AppContext, handler: Box<dyn UberdogHandler>) -> Result<(), Box<dyn std::error::Error>> {
        let (upstream, mut events) = connect_upstream(&ctx.config.uberdog.md_addr).await?;
        let mut uberdog = Uberdog::new(&ctx, upstream, handler);
        uberdog.start()?;

        while let Some(event) = events.recv().await {
            match event {
                NetworkEvent::Frame { bytes, .. } => uberdog.handle_upstream(&bytes),
                NetworkEvent::Connected { .. } => {}
                NetworkEvent::Disconnected { .. } => break,
            }
        }
        error!("Lost connection to the message director");
        Err("lost connection to the message director".into())
    }
}
