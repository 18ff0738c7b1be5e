//! `magnetite` speaks the memcached binary protocol over TCP and ships a
//! self-describing binary codec for structured values, including shared
//! and cyclic aggregates.
//!
//! ```no_run
//! use magnetite::{Config, Value};
//!
//! let mut client = magnetite::open(Config::default()).unwrap();
//! client.set(b"answer", Some(&Value::Int(42)), 0, 0).unwrap();
//! let (value, _cas) = client.get(b"answer").unwrap().unwrap();
//! assert!(value.deep_eq(&Value::Int(42)));
//! ```

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod codec;
pub mod error;
pub mod logging;
pub mod net;
pub mod value;

pub use crate::buffer::Buffer;
pub use crate::codec::{decode, decode_buffer, encode};
pub use crate::error::{ClientResult, CodecError, CodecResult, Error};
pub use crate::net::client::{Client, Config, DecodeFn, EncodeFn};
pub use crate::net::connection::State;
pub use crate::net::protocol::Status;
pub use crate::value::{Table, TableRef, Value};

use crate::logging::Logger;

/// Opens a client with the default codec and no logger attached.
#[inline]
pub fn open(config: Config) -> ClientResult<Client> {
    Client::open(config, None)
}

/// Opens a client that logs through the supplied root logger.
#[inline]
pub fn open_logged(config: Config, log: &Logger) -> ClientResult<Client> {
    Client::open(config, log)
}
