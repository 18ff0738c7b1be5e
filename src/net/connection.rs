//! Blocking TCP transport: lazy connect with a bounded handshake, tuned
//! socket options, scatter/gather sends with SIGPIPE suppression and the
//! reconnect-vs-closed downgrade policy.

use crate::error::{ClientResult, Error};
use crate::logging::{self, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, IoSlice, Read};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
// Apple targets suppress SIGPIPE on the socket itself (SO_NOSIGPIPE).
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: i32 = 0;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
    Disconnected,
    Connected,
    Closed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Disconnected => write!(f, "disconnected"),
            State::Connected => write!(f, "connected"),
            State::Closed => write!(f, "closed"),
        }
    }
}

/// A single-endpoint connection. The socket is established lazily on the
/// first transfer and handed back blocking; a non-recoverable failure
/// either reverts to `Disconnected` (reconnect enabled) or ends in the
/// terminal `Closed` state.
pub struct Connection {
    host: String,
    port: u16,
    timeout: Duration,
    reconnect: bool,
    socket: Option<Socket>,
    closed: bool,
    log: Logger,
}

impl Connection {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        host: String,
        port: u16,
        timeout: Duration,
        reconnect: bool,
        log: L,
    ) -> Connection {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        Connection {
            host,
            port,
            timeout,
            reconnect,
            socket: None,
            closed: false,
            log,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        if self.closed {
            State::Closed
        } else if self.socket.is_some() {
            State::Connected
        } else {
            State::Disconnected
        }
    }

    /// Connects if there is no live socket. Fails with `Closed` once the
    /// connection has been closed.
    pub fn ensure_connected(&mut self) -> ClientResult<()> {
        if self.closed {
            return Err(Error::Closed);
        }

        if self.socket.is_some() {
            return Ok(());
        }

        self.connect()
    }

    fn connect(&mut self) -> ClientResult<()> {
        logging::debug!(self.log, "connecting";
                        "host" => %self.host,
                        "port" => self.port,
                        "timeout" => ?self.timeout);

        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::Resolve)?;

        let mut last_error: Option<io::Error> = None;

        for addr in addrs {
            match self.connect_candidate(&addr) {
                Ok(socket) => {
                    logging::debug!(self.log, "connected"; "addr" => %addr);
                    self.socket = Some(socket);
                    return Ok(());
                }
                Err(err) => {
                    logging::trace!(self.log, "candidate failed";
                                    "addr" => %addr,
                                    "error" => %err);
                    last_error = Some(err);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"));

        match last_error_is_resolve(&last) {
            true => Err(Error::Resolve(last)),
            false => Err(Error::Connect(last)),
        }
    }

    /// One candidate: tuned socket, non-blocking connect bounded by the
    /// configured timeout, blocking mode restored for data transfer.
    fn connect_candidate(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        socket.set_nodelay(true)?;
        socket.set_reuse_address(true)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;

        socket.connect_timeout(&(*addr).into(), self.timeout)?;

        Ok(socket)
    }

    /// Sends all segments as one scatter/gather transfer, resuming short
    /// writes and `EINTR`. A zero-byte send means the peer is gone.
    pub fn send(&mut self, segments: &[&[u8]]) -> ClientResult<()> {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        let mut sent = 0;

        while sent < total {
            let result = {
                let socket = self.socket.as_ref().expect("connection must have a socket");
                let slices = remaining_slices(segments, sent);
                socket.send_vectored_with_flags(&slices, SEND_FLAGS)
            };

            match result {
                Ok(0) => return Err(self.fail(Error::SocketClosed)),
                Ok(count) => sent += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(Error::Socket(err))),
            }
        }

        logging::trace!(self.log, "request sent"; "bytes" => total);

        Ok(())
    }

    /// Fills the destination exactly, resuming `EINTR`. A zero-byte read
    /// means the peer closed mid-frame.
    pub fn recv_exact(&mut self, dest: &mut [u8]) -> ClientResult<()> {
        let mut filled = 0;

        while filled < dest.len() {
            let result = {
                let mut socket = self.socket.as_ref().expect("connection must have a socket");
                socket.read(&mut dest[filled..])
            };

            match result {
                Ok(0) => return Err(self.fail(Error::SocketClosed)),
                Ok(count) => filled += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(Error::Socket(err))),
            }
        }

        logging::trace!(self.log, "response received"; "bytes" => dest.len());

        Ok(())
    }

    /// Downgrades after a non-recoverable transfer or protocol failure:
    /// the socket is dropped, and without reconnect the connection
    /// becomes terminal.
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        logging::debug!(self.log, "connection downgraded";
                        "error" => %err,
                        "reconnect" => self.reconnect);

        self.socket = None;

        if !self.reconnect {
            self.closed = true;
        }

        err
    }

    /// Shuts the socket down and makes the connection terminal. Idempotent.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            drop(socket.shutdown(Shutdown::Both));
        }

        self.closed = true;

        logging::debug!(self.log, "connection closed");
    }
}

/// The slice set still to be sent once `skip` bytes are on the wire.
fn remaining_slices<'a>(segments: &[&'a [u8]], skip: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(segments.len());
    let mut skip = skip;

    for segment in segments {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }

        slices.push(IoSlice::new(&segment[skip..]));
        skip = 0;
    }

    slices
}

/// Resolution and connection failures share the candidate loop; an error
/// produced before any socket existed is a resolve failure.
fn last_error_is_resolve(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn local_connection(port: u16, reconnect: bool) -> Connection {
        Connection::new(
            "127.0.0.1".to_string(),
            port,
            Duration::from_millis(1000),
            reconnect,
            None,
        )
    }

    #[test]
    fn test_lazy_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut conn = local_connection(port, true);

        assert_eq!(conn.state(), State::Disconnected);

        conn.ensure_connected().unwrap();

        assert_eq!(conn.state(), State::Connected);

        conn.send(&[b"he", b"llo"]).unwrap();

        let mut back = [0u8; 5];
        conn.recv_exact(&mut back).unwrap();

        assert_eq!(&back, b"hello");

        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut conn = local_connection(port, true);

        match conn.ensure_connected() {
            Err(Error::Connect(_)) => (),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(conn.state(), State::Disconnected);
    }

    #[test]
    fn test_peer_close_downgrades_to_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut conn = local_connection(port, true);
        conn.ensure_connected().unwrap();
        server.join().unwrap();

        let mut buf = [0u8; 1];
        match conn.recv_exact(&mut buf) {
            Err(Error::SocketClosed) => (),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(conn.state(), State::Disconnected);
    }

    #[test]
    fn test_peer_close_without_reconnect_is_terminal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut conn = local_connection(port, false);
        conn.ensure_connected().unwrap();
        server.join().unwrap();

        let mut buf = [0u8; 1];
        assert!(conn.recv_exact(&mut buf).is_err());
        assert_eq!(conn.state(), State::Closed);

        match conn.ensure_connected() {
            Err(Error::Closed) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = local_connection(1, true);

        conn.close();
        conn.close();

        assert_eq!(conn.state(), State::Closed);
    }

    #[test]
    fn test_remaining_slices() {
        let segments: &[&[u8]] = &[b"abc", b"de", b"fgh"];

        let slices = remaining_slices(segments, 4);

        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"e");
        assert_eq!(&*slices[1], b"fgh");
    }
}
