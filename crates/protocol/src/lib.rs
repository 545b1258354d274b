//! L2: a connection-oriented state machine over the packet router.
//!
//! Handshake, sequenced data transfer with ack-interval gating, and
//! selective retransmission of sequence gaps. Every public operation
//! takes the connection's single recursive lock for its whole duration;
//! internal subroutines (retransmit request/response) are passed the
//! already-borrowed state rather than re-entering through `self`.

mod replay;

use frame::{Address, Error, Frame, FrameType, Options};
use parking_lot::ReentrantMutex;
use replay::ReplayCache;
use router::Router;
use std::{
    cell::RefCell,
    sync::Arc,
    time::{Duration, Instant},
};

struct ConnectionState {
    connected: bool,
    acceptor: bool,
    local: Address,
    remote: Address,
    send_sequence: u32,
    recv_sequence: u32,
    stored_writes: ReplayCache,
    stored_reads: ReplayCache,
    recovered_frames: std::collections::VecDeque<u32>,
}

impl ConnectionState {
    fn new(options: &Options) -> Self {
        Self {
            connected: false,
            acceptor: false,
            local: Address::default(),
            remote: Address::default(),
            send_sequence: 0,
            recv_sequence: 0,
            stored_writes: ReplayCache::new(options.storage_max, options.storage_trim),
            stored_reads: ReplayCache::new(options.storage_max, options.storage_trim),
            recovered_frames: std::collections::VecDeque::new(),
        }
    }

    fn reset_for_new_connection(&mut self) {
        self.send_sequence = 0;
        self.recv_sequence = 0;
        self.stored_writes.clear();
        self.stored_reads.clear();
        self.recovered_frames.clear();
        self.connected = true;
    }
}

/// A single logical connection over a shared [`Router`].
pub struct Protocol {
    router: Arc<Router>,
    options: Options,
    hostname: String,
    state: ReentrantMutex<RefCell<ConnectionState>>,
}

impl Protocol {
    pub fn new(router: Arc<Router>, options: Options, hostname: impl Into<String>) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(ConnectionState::new(&options))),
            router,
            options,
            hostname: hostname.into(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().borrow().connected
    }

    pub fn local(&self) -> Address {
        self.state.lock().borrow().local
    }

    pub fn remote(&self) -> Address {
        self.state.lock().borrow().remote
    }

    pub fn mtu(&self) -> u32 {
        self.options.mtu
    }

    /// Initiates a connection: handshakes with `remote`, retrying up to
    /// `max_retries` times, bounded overall by `timeout_ms`.
    pub fn connect(&self, local: Address, remote: Address, timeout_ms: u64) -> Result<(), Error> {
        let deadline = deadline_from(timeout_ms);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        state.local = local;
        state.remote = remote;
        state.acceptor = false;
        state.connected = false;

        let mut last_err = Error::Timeout;
        for _ in 0..self.options.max_retries {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => break,
            };

            let (_, handshake) = self.make_frame(&mut state, FrameType::Handshake, Vec::new());
            if let Err(e) = self.router.write(&handshake, &remote, op_timeout) {
                last_err = e;
                continue;
            }

            let mut peer = remote;
            let mut buf = vec![0u8; frame::HEADER_LEN];
            match self.router.read(&mut buf, &mut peer, op_timeout) {
                Ok(n) => match Frame::decode(&buf[..n]) {
                    Ok(f) if f.frame_type == FrameType::Ack => {
                        state.reset_for_new_connection();
                        log::debug!("connect: handshake acked by {:?}", peer);
                        return Ok(());
                    }
                    Ok(f) => {
                        last_err = Error::UnexpectedFrame {
                            expected: FrameType::Ack,
                            actual: f.frame_type,
                        }
                    }
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }

    /// Waits for a handshake from `remote` (or from any peer, if `remote`
    /// is the wildcard address) and acks it. Returns the actual peer.
    pub fn accept(&self, local: Address, remote: Address, timeout_ms: u64) -> Result<Address, Error> {
        let deadline = deadline_from(timeout_ms);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        state.local = local;
        state.remote = remote;
        state.acceptor = true;
        state.connected = false;

        let mut last_err = Error::Timeout;
        for _ in 0..self.options.max_retries {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => break,
            };

            let mut peer = remote;
            let mut buf = vec![0u8; frame::HEADER_LEN];
            match self.router.read(&mut buf, &mut peer, op_timeout) {
                Ok(n) => match Frame::decode(&buf[..n]) {
                    Ok(f) if f.frame_type == FrameType::Handshake => {
                        state.remote = peer;
                        let (_, ack) = self.make_frame(&mut state, FrameType::Ack, Vec::new());
                        if let Err(e) = self.router.write(&ack, &peer, op_timeout) {
                            last_err = e;
                            continue;
                        }
                        state.reset_for_new_connection();
                        log::debug!("accept: handshake received from {:?}", peer);
                        return Ok(peer);
                    }
                    Ok(f) => {
                        last_err = Error::UnexpectedFrame {
                            expected: FrameType::Handshake,
                            actual: f.frame_type,
                        }
                    }
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }

    /// Sends one frame's worth of payload (`0 < buf.len() <= mtu`).
    ///
    /// Retries the send/ack exchange up to `max_retries` times, bounded
    /// by `timeout_ms`. If the whole operation ultimately fails, the send
    /// sequence is rewound so a caller retrying this exact call reuses
    /// the same sequence number.
    pub fn write(&self, buf: &[u8], timeout_ms: u64) -> Result<usize, Error> {
        if buf.is_empty() || buf.len() as u32 > self.options.mtu {
            return Err(Error::BufferOverflow {
                required_size: buf.len(),
            });
        }

        let deadline = deadline_from(timeout_ms);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if !state.connected {
            return Err(Error::NotConnected);
        }

        let (sequence, wire) = self.make_frame(&mut state, FrameType::Data, buf.to_vec());
        let peer = state.remote;
        let needs_ack = sequence % self.options.no_ack_count == 0;

        let mut last_err = Error::Timeout;
        for _ in 0..self.options.max_retries {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => break,
            };

            if let Err(e) = self.router.write(&wire, &peer, op_timeout) {
                last_err = e;
                continue;
            }

            if !needs_ack {
                return Ok(buf.len());
            }

            let mut from = peer;
            let mut ack_buf = vec![0u8; frame::HEADER_LEN + self.options.mtu as usize];
            match self.router.read(&mut ack_buf, &mut from, op_timeout) {
                Ok(n) => match Frame::decode(&ack_buf[..n]) {
                    Ok(f) if f.frame_type == FrameType::Ack => return Ok(buf.len()),
                    Ok(f) if f.frame_type == FrameType::Retransmit => {
                        return match self.retransmit_response(&mut state, peer, f, deadline) {
                            Ok(()) => Ok(buf.len()),
                            Err(e) => {
                                state.send_sequence = state.send_sequence.wrapping_sub(1);
                                Err(e)
                            }
                        };
                    }
                    Ok(f) => {
                        last_err = Error::UnexpectedFrame {
                            expected: FrameType::Ack,
                            actual: f.frame_type,
                        }
                    }
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = e,
            }
        }

        state.send_sequence = state.send_sequence.wrapping_sub(1);
        Err(last_err)
    }

    /// Receives one frame's worth of payload. `buf` must be at least
    /// `mtu` bytes.
    pub fn read(&self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, Error> {
        if (buf.len() as u32) < self.options.mtu {
            return Err(Error::BufferOverflow {
                required_size: self.options.mtu as usize,
            });
        }

        let deadline = deadline_from(timeout_ms);
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if !state.connected {
            return Err(Error::NotConnected);
        }

        if let Some(result) = deliver_recovered(&mut state, buf) {
            return result;
        }

        loop {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => return Err(Error::Timeout),
            };

            let mut peer = state.remote;
            let mut wire = vec![0u8; frame::HEADER_LEN + self.options.mtu as usize];
            let n = match self.router.read(&mut wire, &mut peer, op_timeout) {
                Ok(n) => n,
                Err(Error::Timeout) => continue,
                Err(e) => return Err(e),
            };
            wire.truncate(n);

            let parsed = match Frame::decode(&wire) {
                Ok(f) => f,
                Err(e) => {
                    log::trace!("protocol: dropping unparsable frame: {e}");
                    continue;
                }
            };

            if parsed.frame_type != FrameType::Data {
                return Err(Error::UnexpectedFrame {
                    expected: FrameType::Data,
                    actual: parsed.frame_type,
                });
            }

            if state.stored_reads.get(parsed.sequence).is_some() {
                continue; // duplicate, already delivered
            }

            if parsed.sequence == state.recv_sequence {
                state.stored_reads.insert(parsed.sequence, wire);
                state.recv_sequence = state.recv_sequence.wrapping_add(1);

                if parsed.sequence % self.options.no_ack_count == 0 {
                    let (_, ack1) = self.make_frame(&mut state, FrameType::Ack, Vec::new());
                    let _ = self.router.write(&ack1, &peer, op_timeout);
                    let (_, ack2) = self.make_frame(&mut state, FrameType::Ack, Vec::new());
                    let _ = self.router.write(&ack2, &peer, op_timeout);
                }

                let len = parsed.payload.len().min(buf.len());
                buf[..len].copy_from_slice(&parsed.payload[..len]);
                return Ok(len);
            }

            return match self.retransmit_request(&mut state, peer, parsed.sequence, deadline) {
                Ok(true) => match deliver_recovered(&mut state, buf) {
                    Some(result) => result,
                    None => Err(Error::ConnectionBroken),
                },
                _ => {
                    state.connected = false;
                    Err(Error::ConnectionBroken)
                }
            };
        }
    }

    /// Best-effort teardown: sends a Goodbye and marks the connection closed.
    pub fn disconnect(&self) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.connected {
            let peer = state.remote;
            let (_, goodbye) = self.make_frame(&mut state, FrameType::Goodbye, Vec::new());
            let _ = self.router.write(&goodbye, &peer, u64::from(self.options.op_timeout));
        }
        state.connected = false;
    }

    fn make_frame(&self, state: &mut ConnectionState, frame_type: FrameType, payload: Vec<u8>) -> (u32, Vec<u8>) {
        let sequence = if frame_type == FrameType::Data {
            let seq = state.send_sequence;
            state.send_sequence = state.send_sequence.wrapping_add(1);
            seq
        } else {
            0
        };

        let frame = Frame::new(frame_type, state.local.ip, state.local.port, &self.hostname, sequence, payload);
        let wire = frame.encode();

        if frame_type == FrameType::Data {
            state.stored_writes.insert(sequence, wire.clone());
        }

        (sequence, wire)
    }

    /// Receiver-driven recovery: keeps reading until an ack-interval
    /// boundary (or the retry budget is spent), then requests resends of
    /// whatever is still missing in `[recv_sequence, last_seq)`.
    fn retransmit_request(
        &self,
        state: &mut ConnectionState,
        peer: Address,
        mut last_seq: u32,
        deadline: Instant,
    ) -> Result<bool, Error> {
        let mut failures = 0u32;
        while last_seq % self.options.no_ack_count != 0 && failures < self.options.max_retries {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => return Err(Error::Timeout),
            };

            let mut from = peer;
            let mut wire = vec![0u8; frame::HEADER_LEN + self.options.mtu as usize];
            match self.router.read(&mut wire, &mut from, op_timeout) {
                Ok(n) => {
                    wire.truncate(n);
                    match Frame::decode(&wire) {
                        Ok(f) if f.frame_type == FrameType::Data => {
                            if state.stored_reads.get(f.sequence).is_none() {
                                state.stored_reads.insert(f.sequence, wire);
                            }
                            last_seq = f.sequence;
                        }
                        _ => failures += 1,
                    }
                }
                Err(_) => failures += 1,
            }
        }

        let mut missing: Vec<u32> = sequence_range(state.recv_sequence, last_seq)
            .into_iter()
            .filter(|seq| state.stored_reads.get(*seq).is_none())
            .collect();

        if missing.is_empty() {
            let op_timeout = attempt_timeout(deadline, self.options.op_timeout).ok_or(Error::Timeout)?;
            let (_, ack) = self.make_frame(state, FrameType::Ack, Vec::new());
            self.router.write(&ack, &peer, op_timeout)?;
            self.queue_recovered(state, last_seq);
            return Ok(true);
        }

        for _ in 0..self.options.max_retries {
            if missing.is_empty() {
                break;
            }

            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => break,
            };

            let payload = Frame::pack_retransmit_payload(&missing, self.options.mtu as usize);
            let requested = payload.len() / 4;
            let (_, wire) = self.make_frame(state, FrameType::Retransmit, payload);
            self.router.write(&wire, &peer, op_timeout)?;

            let mut from = peer;
            let mut ack_buf = vec![0u8; frame::HEADER_LEN];
            match self.router.read(&mut ack_buf, &mut from, op_timeout) {
                Ok(n) => match Frame::decode(&ack_buf[..n]) {
                    Ok(f) if f.frame_type == FrameType::Ack => {}
                    Ok(f) => {
                        return Err(Error::UnexpectedFrame {
                            expected: FrameType::Ack,
                            actual: f.frame_type,
                        })
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }

            for _ in 0..requested {
                let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                    Some(t) => t,
                    None => break,
                };

                let mut from = peer;
                let mut wire = vec![0u8; frame::HEADER_LEN + self.options.mtu as usize];
                if let Ok(n) = self.router.read(&mut wire, &mut from, op_timeout) {
                    wire.truncate(n);
                    if let Ok(f) = Frame::decode(&wire) {
                        if f.frame_type == FrameType::Data && state.stored_reads.get(f.sequence).is_none() {
                            state.stored_reads.insert(f.sequence, wire);
                        }
                    }
                }
            }

            missing.retain(|seq| state.stored_reads.get(*seq).is_none());
        }

        let resolved = missing.is_empty();
        self.queue_recovered(state, last_seq);
        Ok(resolved)
    }

    fn queue_recovered(&self, state: &mut ConnectionState, last_seq: u32) {
        for seq in sequence_range(state.recv_sequence, last_seq) {
            if state.stored_reads.get(seq).is_some() && !state.recovered_frames.contains(&seq) {
                state.recovered_frames.push_back(seq);
            }
        }
    }

    /// Sender-driven recovery: invoked when a Retransmit arrives instead
    /// of the expected Ack.
    fn retransmit_response(
        &self,
        state: &mut ConnectionState,
        peer: Address,
        mut retransmit_frame: Frame,
        deadline: Instant,
    ) -> Result<(), Error> {
        for _ in 0..self.options.max_retries {
            let op_timeout = match attempt_timeout(deadline, self.options.op_timeout) {
                Some(t) => t,
                None => return Err(Error::Timeout),
            };

            let (_, ack) = self.make_frame(state, FrameType::Ack, Vec::new());
            self.router.write(&ack, &peer, op_timeout)?;

            for seq in retransmit_frame.retransmit_sequences() {
                match state.stored_writes.get(seq) {
                    Some(wire) => {
                        let wire = wire.to_vec();
                        self.router.write(&wire, &peer, op_timeout)?;
                    }
                    None => return Err(Error::ConnectionBroken),
                }
            }

            let mut from = peer;
            let mut buf = vec![0u8; frame::HEADER_LEN + self.options.mtu as usize];
            match self.router.read(&mut buf, &mut from, op_timeout) {
                Ok(n) => match Frame::decode(&buf[..n]) {
                    Ok(f) if f.frame_type == FrameType::Ack => return Ok(()),
                    Ok(f) if f.frame_type == FrameType::Retransmit => {
                        retransmit_frame = f;
                        continue;
                    }
                    Ok(f) => {
                        return Err(Error::UnexpectedFrame {
                            expected: FrameType::Ack,
                            actual: f.frame_type,
                        })
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::RepeatRetransmit)
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        let guard = self.state.lock();
        guard.borrow_mut().connected = false;
    }
}

fn deliver_recovered(state: &mut ConnectionState, buf: &mut [u8]) -> Option<Result<usize, Error>> {
    let seq = state.recovered_frames.pop_front()?;
    let wire = state.stored_reads.get(seq).map(|w| w.to_vec());

    if state.recovered_frames.is_empty() {
        state.recv_sequence = seq.wrapping_add(1);
    }

    Some(match wire.and_then(|w| Frame::decode(&w).ok()) {
        Some(f) => {
            let len = f.payload.len().min(buf.len());
            buf[..len].copy_from_slice(&f.payload[..len]);
            Ok(len)
        }
        None => Err(Error::ConnectionBroken),
    })
}

fn sequence_range(start: u32, end_exclusive: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut cur = start;
    while cur != end_exclusive {
        out.push(cur);
        cur = cur.wrapping_add(1);
    }
    out
}

fn deadline_from(timeout_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(timeout_ms)
}

/// Remaining time until `deadline`, capped at `op_timeout`; `None` once
/// the deadline has passed.
fn attempt_timeout(deadline: Instant, op_timeout: u32) -> Option<u64> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    let remaining = (deadline - now).as_millis() as u64;
    Some(remaining.min(u64::from(op_timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn router_on(port: u16) -> (Arc<Router>, Address) {
        let mut cfg = HashMap::new();
        cfg.insert("ip".into(), "127.0.0.1".into());
        cfg.insert("port".into(), port.to_string());
        let t = Arc::new(transport::UdpTransport::enable(&cfg).unwrap());
        let addr = match t.local_addr().unwrap() {
            SocketAddr::V4(v4) => Address::from(v4),
            _ => unreachable!(),
        };
        (Arc::new(Router::new(t, Options::default())), addr)
    }

    #[test]
    fn sequence_range_handles_wraparound() {
        let r = sequence_range(u32::MAX - 1, 1);
        assert_eq!(r, vec![u32::MAX - 1, u32::MAX, 0]);
        assert!(sequence_range(5, 5).is_empty());
    }

    #[test]
    fn handshake_then_single_write_and_read() {
        let (router_a, addr_a) = router_on(0);
        let (router_b, addr_b) = router_on(0);

        let acceptor = Protocol::new(router_a, Options::default(), "acceptor");
        let connector = Protocol::new(router_b, Options::default(), "connector");

        let acceptor_thread = std::thread::spawn(move || acceptor_roundtrip(acceptor, addr_a));

        connector.connect(addr_b, addr_a, 5000).unwrap();
        connector.write(b"hello world?", 5000).unwrap();

        let received = acceptor_thread.join().unwrap();
        assert_eq!(received, b"hello world?");
    }

    fn acceptor_roundtrip(acceptor: Protocol, local: Address) -> Vec<u8> {
        acceptor.accept(local, Address::WILDCARD, 5000).unwrap();
        let mut buf = vec![0u8; Options::default().mtu as usize];
        let n = acceptor.read(&mut buf, 5000).unwrap();
        buf.truncate(n);
        buf
    }
}
