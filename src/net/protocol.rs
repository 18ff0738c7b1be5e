//! Framing for the memcached binary protocol: the 24-byte header, the
//! per-opcode extras blocks and the response segment arithmetic.

use crate::error::{ClientResult, Error};
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

pub const HEADER_SIZE: usize = 24;
/// The widest extras block any request carries (arithmetic ops).
pub const MAX_EXTRAS: usize = 20;
pub const MAX_KEY_LEN: usize = 65535;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    Stat = 0x10,
    QuitQ = 0x17,
}

impl From<Opcode> for u8 {
    #[inline]
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

/// Response status word. Only `Success`, `KeyNotFound`, `KeyExists` and
/// `NonNumericValue` have domain meaning for some operation; everything
/// else surfaces as a server error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    NotStored,
    NonNumericValue,
    UnknownCommand,
    OutOfMemory,
    Other(u16),
}

impl Status {
    pub fn from_code(code: u16) -> Status {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::NotStored,
            0x0006 => Status::NonNumericValue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            code => Status::Other(code),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::NotStored => 0x0005,
            Status::NonNumericValue => 0x0006,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Other(code) => *code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::KeyNotFound => write!(f, "key not found"),
            Status::KeyExists => write!(f, "key exists"),
            Status::ValueTooLarge => write!(f, "value too large"),
            Status::InvalidArguments => write!(f, "invalid arguments"),
            Status::NotStored => write!(f, "item not stored"),
            Status::NonNumericValue => write!(f, "non-numeric value"),
            Status::UnknownCommand => write!(f, "unknown command"),
            Status::OutOfMemory => write!(f, "server out of memory"),
            Status::Other(code) => write!(f, "status 0x{:04x}", code),
        }
    }
}

/// A request header plus its extras block in one contiguous region, so
/// the key and value can be sent as separate scatter/gather segments
/// without copying them in.
pub struct Request {
    raw: [u8; HEADER_SIZE + MAX_EXTRAS],
    extras_len: usize,
    key_len: usize,
    value_len: usize,
}

impl Request {
    pub fn new(opcode: Opcode, key: &[u8], cas: u64) -> Request {
        let mut raw = [0u8; HEADER_SIZE + MAX_EXTRAS];

        raw[0] = MAGIC_REQUEST;
        raw[1] = opcode.into();
        BigEndian::write_u16(&mut raw[2..4], key.len() as u16);
        // data type, vbucket and opaque stay zero
        BigEndian::write_u64(&mut raw[16..24], cas);

        let mut request = Request {
            raw,
            extras_len: 0,
            key_len: key.len(),
            value_len: 0,
        };
        request.update_lengths();
        request
    }

    /// `flags | expiration` extras for SET/ADD/REPLACE. Flags are always
    /// zero; the payload is self-describing.
    pub fn store_extras(&mut self, expiration: u32) {
        BigEndian::write_u32(&mut self.raw[HEADER_SIZE..], 0);
        BigEndian::write_u32(&mut self.raw[HEADER_SIZE + 4..], expiration);
        self.extras_len = 8;
        self.update_lengths();
    }

    /// `delta | initial | expiration` extras for INCREMENT/DECREMENT.
    pub fn arithmetic_extras(&mut self, delta: u64, initial: u64, expiration: u32) {
        BigEndian::write_u64(&mut self.raw[HEADER_SIZE..], delta);
        BigEndian::write_u64(&mut self.raw[HEADER_SIZE + 8..], initial);
        BigEndian::write_u32(&mut self.raw[HEADER_SIZE + 16..], expiration);
        self.extras_len = 20;
        self.update_lengths();
    }

    /// `expiration` extras for FLUSH.
    pub fn flush_extras(&mut self, expiration: u32) {
        BigEndian::write_u32(&mut self.raw[HEADER_SIZE..], expiration);
        self.extras_len = 4;
        self.update_lengths();
    }

    pub fn value_length(&mut self, len: usize) {
        self.value_len = len;
        self.update_lengths();
    }

    fn update_lengths(&mut self) {
        self.raw[4] = self.extras_len as u8;
        let body = self.extras_len + self.key_len + self.value_len;
        BigEndian::write_u32(&mut self.raw[8..12], body as u32);
    }

    /// Header and extras as one segment.
    #[inline]
    pub fn head(&self) -> &[u8] {
        &self.raw[..HEADER_SIZE + self.extras_len]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub opcode: u8,
    pub extras_len: usize,
    pub key_len: usize,
    pub body_len: usize,
    pub status: Status,
    pub cas: u64,
}

impl ResponseHeader {
    /// Parses a response header, rejecting frames that do not carry the
    /// response magic or whose segment lengths are inconsistent.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> ClientResult<ResponseHeader> {
        if raw[0] != MAGIC_RESPONSE {
            return Err(Error::BadResponse(raw[0]));
        }

        let header = ResponseHeader {
            opcode: raw[1],
            key_len: BigEndian::read_u16(&raw[2..4]) as usize,
            extras_len: raw[4] as usize,
            status: Status::from_code(BigEndian::read_u16(&raw[6..8])),
            body_len: BigEndian::read_u32(&raw[8..12]) as usize,
            cas: BigEndian::read_u64(&raw[16..24]),
        };

        if header.extras_len + header.key_len > header.body_len {
            return Err(Error::Protocol("segment lengths exceed body"));
        }

        Ok(header)
    }

    /// The value segment length is whatever the extras and key leave over.
    #[inline]
    pub fn value_len(&self) -> usize {
        self.body_len - self.extras_len - self.key_len
    }
}
