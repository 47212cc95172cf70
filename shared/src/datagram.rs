//! Little-endian datagram buffer and read cursor.
//!
//! A server datagram is laid out as
//! `[u8 N][N x u64 recipient][u64 sender][u16 msg_type][payload]`.
//! Control datagrams address the single `CONTROL_MESSAGE` channel and carry
//! no sender. Client datagrams are just `[u16 msg_type][payload]`.

use crate::msgtypes::CONTROL_MESSAGE;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatagramError {
    #[error("datagram truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("too many recipients: {0}")]
    TooManyRecipients(usize),
    #[error("length {0} does not fit a u16 prefix")]
    LengthOverflow(usize),
    #[error("invalid utf-8 in string field")]
    InvalidString,
}

pub type Result<T> = std::result::Result<T, DatagramError>;

/// Growable write buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    buf: Vec<u8>,
}

impl Datagram {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    /// Starts a client-protocol datagram with its message type.
    pub fn client(msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_uint16(msg_type);
        dg
    }

    /// Starts a server datagram with a full routing header.
    pub fn server(recipients: &[u64], sender: u64, msg_type: u16) -> Result<Self> {
        let mut dg = Self::new();
        dg.add_server_header(recipients, sender, msg_type)?;
        Ok(dg)
    }

    /// Starts a control datagram for the given control subtype.
    pub fn control(msg_type: u16) -> Self {
        let mut dg = Self::new();
        dg.add_control_header(msg_type);
        dg
    }

    pub fn add_server_header(&mut self, recipients: &[u64], sender: u64, msg_type: u16) -> Result<()> {
        if recipients.len() > u8::MAX as usize {
            return Err(DatagramError::TooManyRecipients(recipients.len()));
        }
        self.add_uint8(recipients.len() as u8);
        for channel in recipients {
            self.add_channel(*channel);
        }
        self.add_channel(sender);
        self.add_uint16(msg_type);
        Ok(())
    }

    pub fn add_control_header(&mut self, msg_type: u16) {
        self.add_uint8(1);
        self.add_channel(CONTROL_MESSAGE);
        self.add_uint16(msg_type);
    }

    pub fn add_uint8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn add_uint16(&mut self, v: u16) {
        // Writing into a Vec cannot fail.
        let _ = self.buf.write_u16::<LittleEndian>(v);
    }

    pub fn add_uint32(&mut self, v: u32) {
        let _ = self.buf.write_u32::<LittleEndian>(v);
    }

    pub fn add_uint64(&mut self, v: u64) {
        let _ = self.buf.write_u64::<LittleEndian>(v);
    }

    pub fn add_int8(&mut self, v: i8) {
        let _ = self.buf.write_i8(v);
    }

    pub fn add_int16(&mut self, v: i16) {
        let _ = self.buf.write_i16::<LittleEndian>(v);
    }

    pub fn add_int32(&mut self, v: i32) {
        let _ = self.buf.write_i32::<LittleEndian>(v);
    }

    pub fn add_int64(&mut self, v: i64) {
        let _ = self.buf.write_i64::<LittleEndian>(v);
    }

    pub fn add_float64(&mut self, v: f64) {
        let _ = self.buf.write_f64::<LittleEndian>(v);
    }

    pub fn add_channel(&mut self, channel: u64) {
        self.add_uint64(channel);
    }

    pub fn add_bool(&mut self, v: bool) {
        self.add_uint8(v as u8);
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn add_blob16(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len()).map_err(|_| DatagramError::LengthOverflow(bytes.len()))?;
        self.add_uint16(len);
        self.add_bytes(bytes);
        Ok(())
    }

    pub fn add_string16(&mut self, s: &str) -> Result<()> {
        self.add_blob16(s.as_bytes())
    }

    /// Overwrites a u16 previously written at `offset`, for counts known only afterwards.
    pub fn patch_uint16(&mut self, offset: usize, v: u16) {
        if offset + 2 <= self.buf.len() {
            self.buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn iter(&self) -> DatagramIterator<'_> {
        DatagramIterator::new(&self.buf)
    }
}

/// Parsed routing header of a server datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHeader {
    pub recipients: Vec<u64>,
    pub sender: u64,
    pub msg_type: u16,
}

/// Read cursor over a borrowed datagram.
#[derive(Debug, Clone)]
pub struct DatagramIterator<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> DatagramIterator<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn data(&self) -> &'a [u8] {
        self.cursor.get_ref()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        let available = self.remaining();
        if available < needed {
            return Err(DatagramError::Truncated {
                offset: self.tell(),
                needed,
                available,
            });
        }
        Ok(())
    }

    /// Bounds-checks, then runs a byteorder read; a short read reports the
    /// same truncation `ensure` would.
    fn read<T>(&mut self, needed: usize, read: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>) -> Result<T> {
        self.ensure(needed)?;
        let offset = self.tell();
        let available = self.remaining();
        read(&mut self.cursor).map_err(|_| DatagramError::Truncated {
            offset,
            needed,
            available,
        })
    }

    pub fn tell(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn seek(&mut self, pos: usize) {
        let pos = pos.min(self.data().len());
        self.cursor.set_position(pos as u64);
    }

    pub fn remaining(&self) -> usize {
        self.data().len().saturating_sub(self.tell())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        let pos = self.tell() + n;
        self.seek(pos);
        Ok(())
    }

    pub fn get_uint8(&mut self) -> Result<u8> {
        self.read(1, |c| c.read_u8())
    }

    pub fn get_uint16(&mut self) -> Result<u16> {
        self.read(2, |c| c.read_u16::<LittleEndian>())
    }

    pub fn get_uint32(&mut self) -> Result<u32> {
        self.read(4, |c| c.read_u32::<LittleEndian>())
    }

    pub fn get_uint64(&mut self) -> Result<u64> {
        self.read(8, |c| c.read_u64::<LittleEndian>())
    }

    pub fn get_int8(&mut self) -> Result<i8> {
        self.read(1, |c| c.read_i8())
    }

    pub fn get_int16(&mut self) -> Result<i16> {
        self.read(2, |c| c.read_i16::<LittleEndian>())
    }

    pub fn get_int32(&mut self) -> Result<i32> {
        self.read(4, |c| c.read_i32::<LittleEndian>())
    }

    pub fn get_int64(&mut self) -> Result<i64> {
        self.read(8, |c| c.read_i64::<LittleEndian>())
    }

    pub fn get_float64(&mut self) -> Result<f64> {
        self.read(8, |c| c.read_f64::<LittleEndian>())
    }

    pub fn get_channel(&mut self) -> Result<u64> {
        self.get_uint64()
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_uint8()? != 0)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let start = self.tell();
        let data = self.data();
        self.seek(start + n);
        Ok(&data[start..start + n])
    }

    pub fn get_blob16(&mut self) -> Result<&'a [u8]> {
        let len = self.get_uint16()? as usize;
        self.get_bytes(len)
    }

    pub fn get_string16(&mut self) -> Result<String> {
        let raw = self.get_blob16()?;
        String::from_utf8(raw.to_vec()).map_err(|_| DatagramError::InvalidString)
    }

    /// Everything after the cursor, without consuming it.
    pub fn remaining_bytes(&self) -> &'a [u8] {
        let data = self.data();
        &data[self.tell().min(data.len())..]
    }

    /// Reads `[u8 N][N x u64]`, failing if fewer than N channels follow.
    pub fn read_recipients(&mut self) -> Result<Vec<u64>> {
        let count = self.get_uint8()? as usize;
        self.ensure(count * 8)?;
        (0..count).map(|_| self.get_channel()).collect()
    }

    pub fn read_server_header(&mut self) -> Result<ServerHeader> {
        let recipients = self.read_recipients()?;
        let sender = self.get_channel()?;
        let msg_type = self.get_uint16()?;
        Ok(ServerHeader {
            recipients,
            sender,
            msg_type,
        })
    }
}

/// True if the raw datagram addresses only the control channel.
pub fn is_control(bytes: &[u8]) -> bool {
    let mut dgi = DatagramIterator::new(bytes);
    matches!(dgi.read_recipients().as_deref(), Ok([CONTROL_MESSAGE]))
}
