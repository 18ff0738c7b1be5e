//! Per-command request construction and response interpretation. Every
//! command shares the same skeleton: validate, frame, transmit, map the
//! status word to an outcome. Missing keys, CAS conflicts and non-numeric
//! counters come back as values, not errors.

use crate::buffer::Buffer;
use crate::codec;
use crate::error::{ClientResult, Error};
use crate::logging::{self, Logger};
use crate::net::connection::{Connection, State};
use crate::net::protocol::{Opcode, Request, ResponseHeader, Status, HEADER_SIZE, MAX_KEY_LEN};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Client configuration. Every field has a default, so a partial TOML
/// table deserializes into a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Connect timeout in milliseconds; must be positive.
    pub timeout_ms: u64,
    /// Whether an I/O failure reverts the connection to disconnected
    /// instead of closing it for good.
    pub reconnect: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "localhost".to_string(),
            port: 11211,
            timeout_ms: 1000,
            reconnect: true,
        }
    }
}

/// Value encoder hook: produces the payload stored under a key.
pub type EncodeFn = Box<dyn Fn(&Value) -> ClientResult<Buffer>>;
/// Value decoder hook: reconstructs a value from a stored payload.
pub type DecodeFn = Box<dyn Fn(&[u8]) -> ClientResult<Value>>;

fn default_encode() -> EncodeFn {
    Box::new(|value| codec::encode(value).map_err(Into::into))
}

fn default_decode() -> DecodeFn {
    Box::new(|raw| codec::decode(raw).map_err(Into::into))
}

/// A memcached binary-protocol client over a single connection.
pub struct Client {
    conn: Connection,
    encode: EncodeFn,
    decode: DecodeFn,
    log: Logger,
}

/// One parsed response frame. The body stays in its receive buffer; the
/// segment accessors are views into it.
struct Response {
    header: ResponseHeader,
    body: Buffer,
}

impl Response {
    #[inline]
    fn key(&self) -> &[u8] {
        let start = self.header.extras_len;
        &self.body[start..start + self.header.key_len]
    }

    #[inline]
    fn value(&self) -> &[u8] {
        &self.body[self.header.extras_len + self.header.key_len..]
    }
}

impl Client {
    /// Opens a client with the default codec. The connection itself is
    /// established lazily by the first command.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(config: Config, log: L) -> ClientResult<Client> {
        Client::open_with_codec(config, default_encode(), default_decode(), log)
    }

    /// Opens a client with replacement encode/decode hooks.
    pub fn open_with_codec<'a, L: Into<Option<&'a Logger>>>(
        config: Config,
        encode: EncodeFn,
        decode: DecodeFn,
        log: L,
    ) -> ClientResult<Client> {
        if config.timeout_ms == 0 {
            return Err(Error::BadTimeout);
        }

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let conn = Connection::new(
            config.host,
            config.port,
            Duration::from_millis(config.timeout_ms),
            config.reconnect,
            &log,
        );

        Ok(Client {
            conn,
            encode,
            decode,
            log,
        })
    }

    #[inline]
    pub fn state(&self) -> State {
        self.conn.state()
    }

    /// Fetches and decodes the value under `key`, along with its CAS
    /// token. A missing key is `None`.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<Option<(Value, u64)>> {
        check_key(key)?;

        let request = Request::new(Opcode::Get, key, 0);
        let response = self.roundtrip(&request, key, &[])?;

        logging::trace!(self.log, "get"; "status" => %response.header.status);

        match response.header.status {
            Status::Success => {
                let value = (self.decode)(response.value())?;
                Ok(Some((value, response.header.cas)))
            }
            Status::KeyNotFound => Ok(None),
            status => Err(Error::Server(status)),
        }
    }

    /// Stores `value` under `key` unconditionally (or conditionally on
    /// `cas` when non-zero). A `None` value deletes the key instead, with
    /// the same CAS semantics. Returns the new CAS token, or `None` when
    /// the key was missing or the CAS check failed.
    pub fn set(
        &mut self,
        key: &[u8],
        value: Option<&Value>,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Option<u64>> {
        match value {
            Some(value) => self.store(Opcode::Set, key, value, expiration, cas),
            None => self.delete(key, cas),
        }
    }

    /// Stores only if the key does not exist yet.
    pub fn add(
        &mut self,
        key: &[u8],
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Option<u64>> {
        self.store(Opcode::Add, key, value, expiration, cas)
    }

    /// Stores only if the key already exists.
    pub fn replace(
        &mut self,
        key: &[u8],
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Option<u64>> {
        self.store(Opcode::Replace, key, value, expiration, cas)
    }

    /// Increments the counter under `key` by `delta`, seeding it with
    /// `initial` when absent. `None` means the stored value is not
    /// numeric.
    pub fn inc(
        &mut self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Option<u64>> {
        self.arithmetic(Opcode::Increment, key, delta, initial, expiration)
    }

    /// Decrements the counter under `key`; see `inc`.
    pub fn dec(
        &mut self,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Option<u64>> {
        self.arithmetic(Opcode::Decrement, key, delta, initial, expiration)
    }

    /// Invalidates every item on the server, now or at `expiration`.
    pub fn flush(&mut self, expiration: u32) -> ClientResult<()> {
        let mut request = Request::new(Opcode::Flush, b"", 0);
        request.flush_extras(expiration);

        let response = self.roundtrip(&request, b"", &[])?;

        match response.header.status {
            Status::Success => Ok(()),
            status => Err(Error::Server(status)),
        }
    }

    /// Collects the statistics stream, optionally scoped to a stats key.
    /// Rows arrive and are kept in server order; the stream ends with an
    /// empty-key frame.
    pub fn stats(&mut self, key: Option<&[u8]>) -> ClientResult<IndexMap<String, String>> {
        let key = key.unwrap_or(b"");

        if key.len() > MAX_KEY_LEN {
            return Err(Error::BadKey(key.len()));
        }

        let request = Request::new(Opcode::Stat, key, 0);

        self.conn.ensure_connected()?;
        self.conn.send(&[request.head(), key])?;

        let mut stats = IndexMap::new();

        loop {
            let response = self.receive()?;

            if response.header.status != Status::Success {
                return Err(self.conn.fail(Error::Protocol("stats row status")));
            }

            if response.header.key_len == 0 {
                if response.header.value_len() != 0 {
                    return Err(self.conn.fail(Error::Protocol("stats terminator with value")));
                }

                logging::trace!(self.log, "stats"; "rows" => stats.len());

                return Ok(stats);
            }

            stats.insert(
                String::from_utf8_lossy(response.key()).into_owned(),
                String::from_utf8_lossy(response.value()).into_owned(),
            );
        }
    }

    /// Closes the client: best-effort quiet quit, socket shutdown,
    /// terminal state. Idempotent.
    pub fn close(&mut self) {
        if self.conn.state() == State::Closed {
            return;
        }

        logging::debug!(self.log, "closing client");

        self.quit();
        self.conn.close();
    }

    /// Quiet quit: the server acknowledges by closing, never with a
    /// response frame. Failures are irrelevant at this point.
    fn quit(&mut self) {
        if self.conn.state() == State::Connected {
            let request = Request::new(Opcode::QuitQ, b"", 0);
            drop(self.conn.send(&[request.head()]));
        }
    }

    fn store(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        value: &Value,
        expiration: u32,
        cas: u64,
    ) -> ClientResult<Option<u64>> {
        check_key(key)?;

        let payload = (self.encode)(value)?;

        // extras + key + value must fit the u32 body field
        let limit = u32::max_value() as usize - 8 - key.len();
        if payload.len() > limit {
            return Err(Error::ValueTooLong(payload.len()));
        }

        let mut request = Request::new(opcode, key, cas);
        request.store_extras(expiration);
        request.value_length(payload.len());

        let response = self.roundtrip(&request, key, payload.as_slice())?;
        stored(&response)
    }

    fn delete(&mut self, key: &[u8], cas: u64) -> ClientResult<Option<u64>> {
        check_key(key)?;

        let request = Request::new(Opcode::Delete, key, cas);
        let response = self.roundtrip(&request, key, &[])?;
        stored(&response)
    }

    fn arithmetic(
        &mut self,
        opcode: Opcode,
        key: &[u8],
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> ClientResult<Option<u64>> {
        check_key(key)?;

        let mut request = Request::new(opcode, key, 0);
        request.arithmetic_extras(delta, initial, expiration);

        let response = self.roundtrip(&request, key, &[])?;

        match response.header.status {
            Status::Success => {
                let value = response.value();

                if value.len() != 8 {
                    return Err(self.conn.fail(Error::Protocol("arithmetic response body")));
                }

                Ok(Some(BigEndian::read_u64(value)))
            }
            Status::NonNumericValue => Ok(None),
            status => Err(Error::Server(status)),
        }
    }

    /// One request/response exchange. The key and value ride as their own
    /// scatter/gather segments; the response body lands in a fresh buffer.
    fn roundtrip(&mut self, request: &Request, key: &[u8], value: &[u8]) -> ClientResult<Response> {
        self.conn.ensure_connected()?;
        self.conn.send(&[request.head(), key, value])?;
        self.receive()
    }

    fn receive(&mut self) -> ClientResult<Response> {
        let mut raw = [0u8; HEADER_SIZE];
        self.conn.recv_exact(&mut raw)?;

        let header = match ResponseHeader::parse(&raw) {
            Ok(header) => header,
            // A malformed header poisons the stream; downgrade.
            Err(err) => return Err(self.conn.fail(err)),
        };

        let mut body = Buffer::new();

        if header.body_len > 0 {
            let dest = body.put_zeroed(header.body_len)?;
            self.conn.recv_exact(dest)?;
        }

        Ok(Response { header, body })
    }
}

#[inline]
fn check_key(key: &[u8]) -> ClientResult<()> {
    match key.len() {
        1..=MAX_KEY_LEN => Ok(()),
        len => Err(Error::BadKey(len)),
    }
}

fn stored(response: &Response) -> ClientResult<Option<u64>> {
    match response.header.status {
        Status::Success => Ok(Some(response.header.cas)),
        Status::KeyNotFound | Status::KeyExists => Ok(None),
        status => Err(Error::Server(status)),
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Client> [{}]: 0x{:x}",
            self.conn.state(),
            self as *const Client as usize
        )
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
