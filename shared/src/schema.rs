//! Distributed class schema.
//!
//! The schema replaces a DC file: it names every distributed class, the
//! fields each class carries (own fields after inherited ones), the wire
//! type of every field parameter and the keyword flags that decide who may
//! send or receive a field. It is loaded once from JSON and then shared
//! read-only, so field dispatch is a table lookup by field number.
//!
//! Field numbers are global across the schema and assigned in declaration
//! order, class numbers likewise.

use crate::datagram::{Datagram, DatagramError, DatagramIterator};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const BUILTIN_SCHEMA: &str = include_str!("../schema/otp.json");

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown parameter type '{0}'")]
    UnknownType(String),
    #[error("unknown keyword '{0}'")]
    UnknownKeyword(String),
    #[error("class '{class}' inherits unknown class '{parent}'")]
    UnknownParent { class: String, parent: String },
    #[error("duplicate class '{0}'")]
    DuplicateClass(String),
    #[error("molecular field '{field}' references unknown field '{subfield}'")]
    UnknownSubfield { field: String, subfield: String },
    #[error("field '{field}' expects {expected} values, got {got}")]
    Arity {
        field: String,
        expected: usize,
        got: usize,
    },
    #[error("value {value} does not fit {expected}")]
    TypeMismatch { expected: String, value: String },
    #[error("bad default for field '{0}'")]
    BadDefault(String),
    #[error("field '{0}' has no default")]
    MissingDefault(String),
    #[error("unknown class '{0}'")]
    UnknownClass(String),
    #[error("too many {0} for 16-bit numbering")]
    Overflow(&'static str),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
}

/// Wire type of one field parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float64,
    String,
    Blob,
    /// `[u16 byte length][elements]`
    Array(Box<ParamType>),
}

impl ParamType {
    pub fn parse(name: &str) -> Result<Self, SchemaError> {
        if let Some(inner) = name.strip_suffix("[]") {
            return Ok(ParamType::Array(Box::new(ParamType::parse(inner)?)));
        }
        Ok(match name {
            "int8" => ParamType::Int8,
            "int16" => ParamType::Int16,
            "int32" => ParamType::Int32,
            "int64" => ParamType::Int64,
            "uint8" | "bool" => ParamType::UInt8,
            "uint16" => ParamType::UInt16,
            "uint32" => ParamType::UInt32,
            "uint64" => ParamType::UInt64,
            "float64" => ParamType::Float64,
            "string" => ParamType::String,
            "blob" => ParamType::Blob,
            other => return Err(SchemaError::UnknownType(other.to_string())),
        })
    }

    pub fn pack(&self, value: &Value, dg: &mut Datagram) -> Result<(), SchemaError> {
        match self {
            ParamType::Int8 => dg.add_int8(value.signed(i8::MIN as i64, i8::MAX as i64, self)? as i8),
            ParamType::Int16 => {
                dg.add_int16(value.signed(i16::MIN as i64, i16::MAX as i64, self)? as i16)
            }
            ParamType::Int32 => {
                dg.add_int32(value.signed(i32::MIN as i64, i32::MAX as i64, self)? as i32)
            }
            ParamType::Int64 => dg.add_int64(value.signed(i64::MIN, i64::MAX, self)?),
            ParamType::UInt8 => dg.add_uint8(value.unsigned(u8::MAX as u64, self)? as u8),
            ParamType::UInt16 => dg.add_uint16(value.unsigned(u16::MAX as u64, self)? as u16),
            ParamType::UInt32 => dg.add_uint32(value.unsigned(u32::MAX as u64, self)? as u32),
            ParamType::UInt64 => dg.add_uint64(value.unsigned(u64::MAX, self)?),
            ParamType::Float64 => match value {
                Value::Float(f) => dg.add_float64(*f),
                Value::Int(i) => dg.add_float64(*i as f64),
                Value::UInt(u) => dg.add_float64(*u as f64),
                _ => return Err(mismatch(self, value)),
            },
            ParamType::String => match value {
                Value::String(s) => dg.add_string16(s)?,
                _ => return Err(mismatch(self, value)),
            },
            ParamType::Blob => match value {
                Value::Blob(b) => dg.add_blob16(b)?,
                Value::String(s) => dg.add_blob16(s.as_bytes())?,
                _ => return Err(mismatch(self, value)),
            },
            ParamType::Array(inner) => match value {
                Value::Array(items) => {
                    let mut body = Datagram::new();
                    for item in items {
                        inner.pack(item, &mut body)?;
                    }
                    dg.add_blob16(body.bytes())?;
                }
                _ => return Err(mismatch(self, value)),
            },
        }
        Ok(())
    }

    pub fn unpack(&self, dgi: &mut DatagramIterator<'_>) -> Result<Value, SchemaError> {
        Ok(match self {
            ParamType::Int8 => Value::Int(dgi.get_int8()? as i64),
            ParamType::Int16 => Value::Int(dgi.get_int16()? as i64),
            ParamType::Int32 => Value::Int(dgi.get_int32()? as i64),
            ParamType::Int64 => Value::Int(dgi.get_int64()?),
            ParamType::UInt8 => Value::UInt(dgi.get_uint8()? as u64),
            ParamType::UInt16 => Value::UInt(dgi.get_uint16()? as u64),
            ParamType::UInt32 => Value::UInt(dgi.get_uint32()? as u64),
            ParamType::UInt64 => Value::UInt(dgi.get_uint64()?),
            ParamType::Float64 => Value::Float(dgi.get_float64()?),
            ParamType::String => Value::String(dgi.get_string16()?),
            ParamType::Blob => Value::Blob(dgi.get_blob16()?.to_vec()),
            ParamType::Array(inner) => {
                let body = dgi.get_blob16()?;
                let mut inner_dgi = DatagramIterator::new(body);
                let mut items = Vec::new();
                while inner_dgi.remaining() > 0 {
                    items.push(inner.unpack(&mut inner_dgi)?);
                }
                Value::Array(items)
            }
        })
    }

    /// Advances past one encoded parameter without decoding it.
    pub fn skip(&self, dgi: &mut DatagramIterator<'_>) -> Result<(), SchemaError> {
        match self {
            ParamType::Int8 | ParamType::UInt8 => dgi.skip(1)?,
            ParamType::Int16 | ParamType::UInt16 => dgi.skip(2)?,
            ParamType::Int32 | ParamType::UInt32 => dgi.skip(4)?,
            ParamType::Int64 | ParamType::UInt64 | ParamType::Float64 => dgi.skip(8)?,
            ParamType::String | ParamType::Blob | ParamType::Array(_) => {
                dgi.get_blob16()?;
            }
        }
        Ok(())
    }

    fn value_from_json(&self, json: &serde_json::Value) -> Option<Value> {
        match self {
            ParamType::Int8 | ParamType::Int16 | ParamType::Int32 | ParamType::Int64 => {
                json.as_i64().map(Value::Int)
            }
            ParamType::UInt8 | ParamType::UInt16 | ParamType::UInt32 | ParamType::UInt64 => {
                json.as_u64().or_else(|| json.as_bool().map(u64::from)).map(Value::UInt)
            }
            ParamType::Float64 => json.as_f64().map(Value::Float),
            ParamType::String => json.as_str().map(|s| Value::String(s.to_string())),
            ParamType::Blob => match json {
                serde_json::Value::String(s) => Some(Value::Blob(s.as_bytes().to_vec())),
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Value::Blob),
                _ => None,
            },
            ParamType::Array(inner) => json
                .as_array()?
                .iter()
                .map(|item| inner.value_from_json(item))
                .collect::<Option<Vec<Value>>>()
                .map(Value::Array),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Int8 => write!(f, "int8"),
            ParamType::Int16 => write!(f, "int16"),
            ParamType::Int32 => write!(f, "int32"),
            ParamType::Int64 => write!(f, "int64"),
            ParamType::UInt8 => write!(f, "uint8"),
            ParamType::UInt16 => write!(f, "uint16"),
            ParamType::UInt32 => write!(f, "uint32"),
            ParamType::UInt64 => write!(f, "uint64"),
            ParamType::Float64 => write!(f, "float64"),
            ParamType::String => write!(f, "string"),
            ParamType::Blob => write!(f, "blob"),
            ParamType::Array(inner) => write!(f, "{}[]", inner),
        }
    }
}

fn mismatch(expected: &ParamType, value: &Value) -> SchemaError {
    SchemaError::TypeMismatch {
        expected: expected.to_string(),
        value: format!("{:?}", value),
    }
}

/// A decoded field parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    fn signed(&self, min: i64, max: i64, ty: &ParamType) -> Result<i64, SchemaError> {
        let v = match self {
            Value::Int(i) => *i,
            Value::UInt(u) => i64::try_from(*u).map_err(|_| mismatch(ty, self))?,
            _ => return Err(mismatch(ty, self)),
        };
        if v < min || v > max {
            return Err(mismatch(ty, self));
        }
        Ok(v)
    }

    fn unsigned(&self, max: u64, ty: &ParamType) -> Result<u64, SchemaError> {
        let v = match self {
            Value::UInt(u) => *u,
            Value::Int(i) => u64::try_from(*i).map_err(|_| mismatch(ty, self))?,
            _ => return Err(mismatch(ty, self)),
        };
        if v > max {
            return Err(mismatch(ty, self));
        }
        Ok(v)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Send/receive flags of a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Keywords {
    pub required: bool,
    pub ram: bool,
    pub broadcast: bool,
    pub airecv: bool,
    pub ownrecv: bool,
    pub clrecv: bool,
    pub ownsend: bool,
    pub clsend: bool,
    pub db: bool,
}

impl Keywords {
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, SchemaError> {
        let mut kw = Keywords::default();
        for name in names {
            match name.as_ref() {
                "required" => kw.required = true,
                "ram" => kw.ram = true,
                "broadcast" => kw.broadcast = true,
                "airecv" => kw.airecv = true,
                "ownrecv" => kw.ownrecv = true,
                "clrecv" => kw.clrecv = true,
                "ownsend" => kw.ownsend = true,
                "clsend" => kw.clsend = true,
                "db" => kw.db = true,
                other => return Err(SchemaError::UnknownKeyword(other.to_string())),
            }
        }
        Ok(kw)
    }

    /// Whether a client observing the zone (or owning the object) may see it.
    pub fn client_visible(&self, also_owner: bool) -> bool {
        self.broadcast || self.clrecv || (also_owner && self.ownrecv)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let flags = [
            (self.required, "required"),
            (self.ram, "ram"),
            (self.broadcast, "broadcast"),
            (self.airecv, "airecv"),
            (self.ownrecv, "ownrecv"),
            (self.clrecv, "clrecv"),
            (self.ownsend, "ownsend"),
            (self.clsend, "clsend"),
            (self.db, "db"),
        ];
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for Keywords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names().join(" "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Atomic,
    /// Concatenation of the listed atomic fields.
    Molecular(Vec<u16>),
}

#[derive(Debug, Clone)]
pub struct Field {
    pub number: u16,
    pub name: String,
    pub kind: FieldKind,
    pub keywords: Keywords,
    /// Flattened parameter list; for molecular fields, every subfield's params in order.
    pub params: Vec<ParamType>,
    /// Packed default, used when a required field is missing from storage.
    pub default: Option<Vec<u8>>,
}

impl Field {
    pub fn is_molecular(&self) -> bool {
        matches!(self.kind, FieldKind::Molecular(_))
    }

    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>, SchemaError> {
        if values.len() != self.params.len() {
            return Err(SchemaError::Arity {
                field: self.name.clone(),
                expected: self.params.len(),
                got: values.len(),
            });
        }
        let mut dg = Datagram::new();
        for (param, value) in self.params.iter().zip(values) {
            param.pack(value, &mut dg)?;
        }
        Ok(dg.into_bytes())
    }

    pub fn unpack(&self, dgi: &mut DatagramIterator<'_>) -> Result<Vec<Value>, SchemaError> {
        self.params.iter().map(|p| p.unpack(dgi)).collect()
    }

    /// Consumes exactly this field's encoded bytes and returns them raw.
    pub fn unpack_bytes(&self, dgi: &mut DatagramIterator<'_>) -> Result<Vec<u8>, SchemaError> {
        let start = dgi.tell();
        for param in &self.params {
            param.skip(dgi)?;
        }
        let end = dgi.tell();
        dgi.seek(start);
        Ok(dgi.get_bytes(end - start)?.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct DClass {
    pub number: u16,
    pub name: String,
    pub parents: Vec<u16>,
    /// Inherited fields first, then own fields, in declaration order.
    pub fields: Vec<u16>,
    by_name: HashMap<String, u16>,
}

impl DClass {
    pub fn has_field(&self, number: u16) -> bool {
        self.fields.contains(&number)
    }

    pub fn field_number(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    classes: Vec<DClass>,
    fields: Vec<Field>,
    class_names: HashMap<String, u16>,
}

#[derive(Deserialize)]
struct SchemaFile {
    classes: Vec<ClassDef>,
}

#[derive(Deserialize)]
struct ClassDef {
    name: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    fields: Vec<FieldDef>,
}

#[derive(Deserialize)]
struct FieldDef {
    name: String,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    molecular: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    default: Option<Vec<serde_json::Value>>,
}

impl Schema {
    /// The schema shipped with the server.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_json_str(BUILTIN_SCHEMA)
    }

    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_json::from_str(json)?;
        let mut schema = Schema {
            classes: Vec::new(),
            fields: Vec::new(),
            class_names: HashMap::new(),
        };
        for def in file.classes {
            schema.add_class(def)?;
        }
        Ok(schema)
    }

    fn add_class(&mut self, def: ClassDef) -> Result<(), SchemaError> {
        if self.class_names.contains_key(&def.name) {
            return Err(SchemaError::DuplicateClass(def.name));
        }
        let number =
            u16::try_from(self.classes.len()).map_err(|_| SchemaError::Overflow("classes"))?;

        let mut parents = Vec::new();
        let mut fields: Vec<u16> = Vec::new();
        for parent in &def.parents {
            let parent_number =
                self.class_names
                    .get(parent)
                    .copied()
                    .ok_or_else(|| SchemaError::UnknownParent {
                        class: def.name.clone(),
                        parent: parent.clone(),
                    })?;
            parents.push(parent_number);
            for field in &self.classes[parent_number as usize].fields {
                if !fields.contains(field) {
                    fields.push(*field);
                }
            }
        }

        let mut by_name: HashMap<String, u16> = fields
            .iter()
            .map(|n| (self.fields[*n as usize].name.clone(), *n))
            .collect();

        for fdef in def.fields {
            let field_number =
                u16::try_from(self.fields.len()).map_err(|_| SchemaError::Overflow("fields"))?;
            let field = self.build_field(field_number, fdef, &by_name)?;
            by_name.insert(field.name.clone(), field_number);
            fields.push(field_number);
            self.fields.push(field);
        }

        self.class_names.insert(def.name.clone(), number);
        self.classes.push(DClass {
            number,
            name: def.name,
            parents,
            fields,
            by_name,
        });
        Ok(())
    }

    fn build_field(
        &self,
        number: u16,
        def: FieldDef,
        scope: &HashMap<String, u16>,
    ) -> Result<Field, SchemaError> {
        let mut keywords = Keywords::parse(&def.keywords)?;

        if !def.molecular.is_empty() {
            let mut subfields = Vec::new();
            let mut params = Vec::new();
            for sub in &def.molecular {
                let sub_number =
                    scope
                        .get(sub)
                        .copied()
                        .ok_or_else(|| SchemaError::UnknownSubfield {
                            field: def.name.clone(),
                            subfield: sub.clone(),
                        })?;
                let sub_field = &self.fields[sub_number as usize];
                params.extend(sub_field.params.iter().cloned());
                subfields.push(sub_number);
            }
            if def.keywords.is_empty() {
                keywords = self.fields[subfields[0] as usize].keywords;
            }
            return Ok(Field {
                number,
                name: def.name,
                kind: FieldKind::Molecular(subfields),
                keywords,
                params,
                default: None,
            });
        }

        let params = def
            .params
            .iter()
            .map(|p| ParamType::parse(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut field = Field {
            number,
            name: def.name,
            kind: FieldKind::Atomic,
            keywords,
            params,
            default: None,
        };

        if let Some(json_values) = def.default {
            if json_values.len() != field.params.len() {
                return Err(SchemaError::BadDefault(field.name));
            }
            let values = field
                .params
                .iter()
                .zip(&json_values)
                .map(|(p, j)| p.value_from_json(j))
                .collect::<Option<Vec<Value>>>()
                .ok_or_else(|| SchemaError::BadDefault(field.name.clone()))?;
            field.default = Some(field.pack(&values)?);
        }

        Ok(field)
    }

    pub fn class(&self, number: u16) -> Option<&DClass> {
        self.classes.get(number as usize)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&DClass> {
        self.class_names.get(name).and_then(|n| self.class(*n))
    }

    pub fn field(&self, number: u16) -> Option<&Field> {
        self.fields.get(number as usize)
    }

    /// Looks a field up by name within a class, inherited fields included.
    pub fn class_field(&self, dclass: &DClass, name: &str) -> Option<&Field> {
        dclass.field_number(name).and_then(|n| self.field(n))
    }

    pub fn fields_of<'a>(&'a self, dclass: &'a DClass) -> impl Iterator<Item = &'a Field> + 'a {
        dclass.fields.iter().filter_map(move |n| self.field(*n))
    }

    /// Atomic required fields, in wire order.
    pub fn required_fields<'a>(&'a self, dclass: &'a DClass) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields_of(dclass)
            .filter(|f| !f.is_molecular() && f.keywords.required)
    }

    /// Splits a molecular field's raw bytes into its atomic parts.
    pub fn split_molecular(
        &self,
        field: &Field,
        data: &[u8],
    ) -> Result<Vec<(u16, Vec<u8>)>, SchemaError> {
        let FieldKind::Molecular(subfields) = &field.kind else {
            return Ok(vec![(field.number, data.to_vec())]);
        };
        let mut dgi = DatagramIterator::new(data);
        let mut parts = Vec::with_capacity(subfields.len());
        for sub in subfields {
            if let Some(sub_field) = self.field(*sub) {
                parts.push((*sub, sub_field.unpack_bytes(&mut dgi)?));
            }
        }
        Ok(parts)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}
