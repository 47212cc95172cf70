//! A live distributed object as held by the state server.
//!
//! The object owns its field storage, its place in the location tree and its
//! AI/owner routing. Building the entry datagrams that describe it to other
//! parties also lives here; deciding when to send them is the state server's
//! job.

use crate::state_server::StateServerError;
use shared::msgtypes::{
    STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER, STATESERVER_OBJECT_ENTER_AI_RECV,
    STATESERVER_OBJECT_ENTER_OWNER_RECV, STATESERVER_QUERY_OBJECT_ALL_RESP,
};
use shared::{Datagram, Field, Keywords, Schema};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Who a snapshot of the object is being built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Clients watching the object's zone.
    Zone,
    /// The owning client.
    Owner,
    /// The AI, or anything else server side; sees every field.
    Server,
}

impl Audience {
    pub fn sees(self, keywords: &Keywords) -> bool {
        match self {
            Audience::Zone => keywords.client_visible(false),
            Audience::Owner => keywords.client_visible(true),
            Audience::Server => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DistributedObject {
    pub do_id: u32,
    pub dclass: u16,
    pub parent_id: u32,
    pub zone_id: u32,
    pub required: HashMap<String, Vec<u8>>,
    pub ram: HashMap<String, Vec<u8>>,
    pub ai_channel: Option<u64>,
    pub owner_channel: Option<u64>,
    /// Set by `ADD_AI_RECV`; a pinned AI is never re-resolved on a move.
    pub ai_explicitly_set: bool,
    /// Children by zone.
    pub zone_objects: BTreeMap<u32, BTreeSet<u32>>,
    pub db_backed: bool,
}

impl DistributedObject {
    /// Creates an unparented object. It is placed in the tree afterwards by a
    /// location change so that observers hear about it.
    pub fn new(
        do_id: u32,
        dclass: u16,
        required: HashMap<String, Vec<u8>>,
        ram: HashMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            do_id,
            dclass,
            parent_id: 0,
            zone_id: 0,
            required,
            ram,
            ai_channel: None,
            owner_channel: None,
            ai_explicitly_set: false,
            zone_objects: BTreeMap::new(),
            db_backed: false,
        }
    }

    pub fn location(&self) -> (u32, u32) {
        (self.parent_id, self.zone_id)
    }

    /// Stores a field's raw bytes. Fields that are neither `required` nor
    /// `ram` are transient and are not kept.
    pub fn save_field(&mut self, field: &Field, data: Vec<u8>) -> bool {
        if field.keywords.required {
            self.required.insert(field.name.clone(), data);
            true
        } else if field.keywords.ram {
            self.ram.insert(field.name.clone(), data);
            true
        } else {
            false
        }
    }

    pub fn field_bytes(&self, name: &str) -> Option<&[u8]> {
        self.required
            .get(name)
            .or_else(|| self.ram.get(name))
            .map(Vec::as_slice)
    }

    pub fn add_child(&mut self, zone: u32, child: u32) {
        self.zone_objects.entry(zone).or_default().insert(child);
    }

    /// Forgets a child wherever it was filed.
    pub fn remove_child(&mut self, child: u32) {
        self.zone_objects.retain(|_, children| {
            children.remove(&child);
            !children.is_empty()
        });
    }

    /// Children located in any of `zones`, each once, ascending.
    pub fn children_in(&self, zones: &[u32]) -> Vec<u32> {
        let mut found = BTreeSet::new();
        for zone in zones {
            if let Some(children) = self.zone_objects.get(zone) {
                found.extend(children.iter().copied());
            }
        }
        found.into_iter().collect()
    }

    pub fn all_children(&self) -> Vec<u32> {
        let all: BTreeSet<u32> = self.zone_objects.values().flatten().copied().collect();
        all.into_iter().collect()
    }

    /// Appends `do_id, parent, zone, dclass` followed by the required fields
    /// the audience may see, in class order.
    pub fn append_required_data(
        &self,
        schema: &Schema,
        dg: &mut Datagram,
        audience: Audience,
    ) -> Result<(), StateServerError> {
        let dclass = schema
            .class(self.dclass)
            .ok_or(StateServerError::UnknownClass(self.dclass))?;

        dg.add_uint32(self.do_id);
        dg.add_uint32(self.parent_id);
        dg.add_uint32(self.zone_id);
        dg.add_uint16(self.dclass);

        for field in schema.required_fields(dclass) {
            if !audience.sees(&field.keywords) {
                continue;
            }
            let data = self
                .required
                .get(&field.name)
                .or(field.default.as_ref())
                .ok_or_else(|| StateServerError::MissingRequired(self.do_id, field.name.clone()))?;
            dg.add_bytes(data);
        }
        Ok(())
    }

    /// Stored `ram` fields the audience may see, in class order.
    pub fn other_fields<'a>(&'a self, schema: &'a Schema, audience: Audience) -> Vec<(u16, &'a [u8])> {
        let Some(dclass) = schema.class(self.dclass) else {
            return Vec::new();
        };
        schema
            .fields_of(dclass)
            .filter(|field| audience.sees(&field.keywords))
            .filter_map(|field| {
                self.ram
                    .get(&field.name)
                    .map(|data| (field.number, data.as_slice()))
            })
            .collect()
    }

    fn append_other_data(dg: &mut Datagram, other: &[(u16, &[u8])]) {
        dg.add_uint16(other.len() as u16);
        for (number, data) in other {
            dg.add_uint16(*number);
            dg.add_bytes(data);
        }
    }

    /// `ENTERZONE_WITH_REQUIRED_OTHER` for clients watching `location`.
    pub fn location_entry(&self, schema: &Schema, location: u64) -> Result<Vec<u8>, StateServerError> {
        let other = self.other_fields(schema, Audience::Zone);
        let mut dg = Datagram::server(
            &[location],
            self.do_id as u64,
            STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER,
        )?;
        dg.add_uint8(u8::from(!other.is_empty()));
        self.append_required_data(schema, &mut dg, Audience::Zone)?;
        if !other.is_empty() {
            Self::append_other_data(&mut dg, &other);
        }
        Ok(dg.into_bytes())
    }

    /// `ENTER_AI_RECV` carrying every stored field.
    pub fn ai_entry(&self, schema: &Schema, ai_channel: u64) -> Result<Vec<u8>, StateServerError> {
        let mut dg = Datagram::server(&[ai_channel], self.do_id as u64, STATESERVER_OBJECT_ENTER_AI_RECV)?;
        self.append_required_data(schema, &mut dg, Audience::Server)?;
        Self::append_other_data(&mut dg, &self.other_fields(schema, Audience::Server));
        Ok(dg.into_bytes())
    }

    /// `ENTER_OWNER_RECV` carrying what the owner may see.
    pub fn owner_entry(&self, schema: &Schema, owner_channel: u64) -> Result<Vec<u8>, StateServerError> {
        let mut dg = Datagram::server(
            &[owner_channel],
            self.do_id as u64,
            STATESERVER_OBJECT_ENTER_OWNER_RECV,
        )?;
        self.append_required_data(schema, &mut dg, Audience::Owner)?;
        Self::append_other_data(&mut dg, &self.other_fields(schema, Audience::Owner));
        Ok(dg.into_bytes())
    }

    /// Full required snapshot for a direct query, regardless of keywords.
    pub fn query_all_response(
        &self,
        schema: &Schema,
        requester: u64,
        context: u32,
    ) -> Result<Vec<u8>, StateServerError> {
        let mut dg = Datagram::server(&[requester], self.do_id as u64, STATESERVER_QUERY_OBJECT_ALL_RESP)?;
        dg.add_uint32(context);
        self.append_required_data(schema, &mut dg, Audience::Server)?;
        Ok(dg.into_bytes())
    }
}
