//! L0: a thin, blocking UDP transport.
//!
//! Binds one socket and exposes independent read/write paths (backed by
//! cloned socket handles, so a caller's write never blocks the router's
//! background reader) with bounded-wait semantics and optional fault
//! injection for testing the layers above.

use frame::{Address, Error, Params};
use parking_lot::Mutex;
use std::{
    net::UdpSocket,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

struct Leftover {
    data: Vec<u8>,
    pos: usize,
    peer: Address,
}

impl Default for Leftover {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            peer: Address::default(),
        }
    }
}

/// A bound UDP endpoint.
///
/// `read` serves out of an internal 256 KiB scratch buffer: a single
/// `recv_from` fills it, and subsequent short reads drain it without
/// issuing another syscall. This is what lets the router perform a
/// two-stage read (header, then payload) of a single datagram without
/// losing the datagram boundary.
pub struct UdpTransport {
    read_socket: Mutex<UdpSocket>,
    write_socket: Mutex<UdpSocket>,
    leftover: Mutex<Leftover>,
    chaos: u32,
    chaos_counter: AtomicU64,
}

impl UdpTransport {
    /// Binds a socket at the address named by `config["ip"]`/`config["port"]`.
    ///
    /// `config["chaos"]`, if present and non-zero, causes every Nth
    /// received datagram to have its last byte corrupted — enough to fail
    /// the frame CRC and exercise the retransmit path deterministically.
    pub fn enable(config: &Params) -> Result<Self, Error> {
        let addr = Address::from_params(config)?;
        let chaos: u32 = config
            .get("chaos")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        socket
            .set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        socket
            .set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        socket
            .bind(&addr.to_socket_addr().into())
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;

        let read_socket: UdpSocket = socket.into();
        let write_socket = read_socket
            .try_clone()
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;

        log::debug!("udp transport bound: {:?}, chaos={}", addr, chaos);

        Ok(Self {
            read_socket: Mutex::new(read_socket),
            write_socket: Mutex::new(write_socket),
            leftover: Mutex::new(Leftover::default()),
            chaos,
            chaos_counter: AtomicU64::new(0),
        })
    }

    /// Reads up to `buf.len()` bytes, filling `peer` with the sender's
    /// address. Blocks at most `timeout_ms`; `0` always yields `Timeout`.
    pub fn read(&self, buf: &mut [u8], peer: &mut Address, timeout_ms: u64) -> Result<usize, Error> {
        let mut leftover = self.leftover.lock();
        if leftover.pos >= leftover.data.len() {
            drop(leftover);
            self.refill(timeout_ms)?;
            leftover = self.leftover.lock();
        }

        let remaining = leftover.data.len() - leftover.pos;
        let n = remaining.min(buf.len());
        let start = leftover.pos;
        buf[..n].copy_from_slice(&leftover.data[start..start + n]);
        leftover.pos += n;
        *peer = leftover.peer;

        Ok(n)
    }

    fn refill(&self, timeout_ms: u64) -> Result<(), Error> {
        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }

        let socket = self.read_socket.lock();
        socket
            .set_read_timeout(Some(Duration::from_millis(timeout_ms)))
            .map_err(|e| Error::ReadFailed(e.to_string()))?;

        let mut scratch = vec![0u8; SOCKET_BUFFER_SIZE];
        let (n, from) = socket.recv_from(&mut scratch).map_err(classify_io_error)?;
        scratch.truncate(n);
        self.maybe_corrupt(&mut scratch);

        let peer = match from {
            std::net::SocketAddr::V4(v4) => Address::from(v4),
            std::net::SocketAddr::V6(_) => {
                return Err(Error::IncorrectParameter("ipv6 peer not supported".into()))
            }
        };

        *self.leftover.lock() = Leftover {
            data: scratch,
            pos: 0,
            peer,
        };

        Ok(())
    }

    fn maybe_corrupt(&self, data: &mut [u8]) {
        if self.chaos == 0 || data.is_empty() {
            return;
        }

        let run = self.chaos_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if run % u64::from(self.chaos) == 0 {
            let last = data.len() - 1;
            data[last] ^= 0xFF;
            log::trace!("chaos: corrupted byte {} of inbound datagram", last);
        }
    }

    /// Sends one datagram to `peer`. Blocks at most `timeout_ms`; `0`
    /// always yields `Timeout`.
    pub fn write(&self, buf: &[u8], peer: &Address, timeout_ms: u64) -> Result<usize, Error> {
        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }

        let socket = self.write_socket.lock();
        socket
            .set_write_timeout(Some(Duration::from_millis(timeout_ms)))
            .map_err(|e| Error::WriteFailed(e.to_string()))?;

        socket
            .send_to(buf, peer.to_socket_addr())
            .map_err(|e| Error::WriteFailed(e.to_string()))
    }

    /// Best-effort teardown. The sockets are actually released on drop;
    /// this exists so callers have an explicit point to stop using the
    /// transport.
    pub fn disable(&self) {
        log::debug!("udp transport disabled");
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.read_socket
            .lock()
            .local_addr()
            .map_err(|e| Error::ReadFailed(e.to_string()))
    }
}

fn classify_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::ReadFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(port: u16) -> Params {
        let mut p = HashMap::new();
        p.insert("ip".into(), "127.0.0.1".into());
        p.insert("port".into(), port.to_string());
        p
    }

    #[test]
    fn smoke_send_and_receive() {
        let a = UdpTransport::enable(&config(0)).unwrap();
        let b = UdpTransport::enable(&config(0)).unwrap();

        let a_addr = Address::from(match a.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        });
        let b_addr = Address::from(match b.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        });

        a.write(b"hello world?", &b_addr, 1000).unwrap();

        let mut buf = [0u8; 64];
        let mut peer = Address::default();
        let n = b.read(&mut buf, &mut peer, 1000).unwrap();

        assert_eq!(&buf[..n], b"hello world?");
        assert_eq!(peer, a_addr);
    }

    #[test]
    fn zero_timeout_is_immediate_timeout() {
        let a = UdpTransport::enable(&config(0)).unwrap();
        let mut buf = [0u8; 64];
        let mut peer = Address::default();
        assert!(matches!(a.read(&mut buf, &mut peer, 0), Err(Error::Timeout)));
    }

    #[test]
    fn read_without_data_times_out() {
        let a = UdpTransport::enable(&config(0)).unwrap();
        let mut buf = [0u8; 64];
        let mut peer = Address::default();
        assert!(matches!(a.read(&mut buf, &mut peer, 50), Err(Error::Timeout)));
    }

    #[test]
    fn chaos_eventually_corrupts_a_datagram() {
        let a = UdpTransport::enable(&config(0)).unwrap();
        let mut config_b = config(0);
        config_b.insert("chaos".into(), "2".into());
        let b = UdpTransport::enable(&config_b).unwrap();

        let b_addr = Address::from(match b.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        });

        let mut saw_corruption = false;
        for _ in 0..4 {
            a.write(b"0123456789AB", &b_addr, 1000).unwrap();
            let mut buf = [0u8; 64];
            let mut peer = Address::default();
            let n = b.read(&mut buf, &mut peer, 1000).unwrap();
            if &buf[..n] != b"0123456789AB" {
                saw_corruption = true;
            }
        }

        assert!(saw_corruption);
    }
}
