//! L1: demultiplexes a single UDP endpoint into a per-peer, multi-consumer
//! queue.
//!
//! A background reader thread drains the transport and parks each
//! validated frame in the waitlist slot for its origin address (falling
//! back to the wildcard address for unsolicited peers); a garbage
//! collector thread bounds the waitlist's memory use. Callers either find
//! a frame already waiting for them or park a pending slot and spin until
//! the reader fills it or their deadline expires.

use ahash::HashMapExt;
use frame::{Address, Error, Frame, FrameType, Options};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use transport::UdpTransport;

const READER_POLL_TIMEOUT_MS: u64 = 250;
const GC_INTERVAL: Duration = Duration::from_secs(2);
const SPIN_SLEEP: Duration = Duration::from_millis(1);

struct Slot {
    done: bool,
    buffer: Vec<u8>,
    peer: Address,
}

impl Slot {
    fn pending() -> Self {
        Self {
            done: false,
            buffer: Vec::new(),
            peer: Address::default(),
        }
    }
}

type Queue = Vec<Option<Slot>>;
type Waitlist = ahash::HashMap<Address, Queue>;

/// Turns a shared [`UdpTransport`] into independently addressable,
/// per-peer read queues.
pub struct Router {
    transport: Arc<UdpTransport>,
    waitlist: Arc<Mutex<Waitlist>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    gc: Option<JoinHandle<()>>,
}

impl Router {
    pub fn new(transport: Arc<UdpTransport>, options: Options) -> Self {
        let waitlist: Arc<Mutex<Waitlist>> = Arc::new(Mutex::new(Waitlist::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let transport = transport.clone();
            let waitlist = waitlist.clone();
            let stop = stop.clone();
            thread::spawn(move || reader_loop(transport, waitlist, stop, options))
        };

        let gc = {
            let waitlist = waitlist.clone();
            let stop = stop.clone();
            thread::spawn(move || gc_loop(waitlist, stop, options))
        };

        Self {
            transport,
            waitlist,
            stop,
            reader: Some(reader),
            gc: Some(gc),
        }
    }

    /// Reads a frame destined for `peer`, or from any peer if `peer` is
    /// the wildcard address. On return, `peer` holds the actual origin.
    pub fn read(&self, buf: &mut [u8], peer: &mut Address, timeout_ms: u64) -> Result<usize, Error> {
        if buf.len() < frame::HEADER_LEN {
            return Err(Error::IncorrectParameter(
                "buffer for storing data is too small".into(),
            ));
        }

        let (data, origin) = schedule_read(&self.waitlist, *peer, timeout_ms)?;
        if data.len() > buf.len() {
            return Err(Error::BufferOverflow {
                required_size: data.len(),
            });
        }

        buf[..data.len()].copy_from_slice(&data);
        *peer = origin;
        Ok(data.len())
    }

    /// Thin pass-through to the underlying transport.
    pub fn write(&self, buf: &[u8], peer: &Address, timeout_ms: u64) -> Result<usize, Error> {
        self.transport.write(buf, peer, timeout_ms)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.gc.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(transport: Arc<UdpTransport>, waitlist: Arc<Mutex<Waitlist>>, stop: Arc<AtomicBool>, options: Options) {
    while !stop.load(Ordering::Relaxed) {
        let mut peer = Address::default();
        let mut header = vec![0u8; frame::HEADER_LEN];

        let n = match transport.read(&mut header, &mut peer, READER_POLL_TIMEOUT_MS) {
            Ok(n) => n,
            Err(_) => continue,
        };

        if n < frame::HEADER_LEN {
            continue;
        }

        let (frame_type, _, data_len) = match Frame::decode_header(&header) {
            Ok(parsed) => parsed,
            Err(_) => continue,
        };

        let mut wire = header;
        let wants_payload = matches!(frame_type, FrameType::Data | FrameType::Retransmit)
            && data_len > 0
            && u32::from(data_len) <= options.mtu;

        if wants_payload {
            let mut payload = vec![0u8; data_len as usize];
            match transport.read(&mut payload, &mut peer, READER_POLL_TIMEOUT_MS) {
                Ok(got) if got == payload.len() => wire.extend_from_slice(&payload),
                _ => continue,
            }
        }

        let parsed = match Frame::decode(&wire) {
            Ok(f) => f,
            Err(e) => {
                log::trace!("router: dropping unparsable frame: {e}");
                continue;
            }
        };

        let origin = Address::new(parsed.origin_ip, parsed.origin_listen_port);

        let mut wl = waitlist.lock();
        deposit(&mut wl, origin, wire);
    }
}

/// Places a validated frame into the waitlist, reusing a pending slot if
/// one exists, falling back to the wildcard queue, or allocating a new
/// wildcard entry if nothing is waiting for this peer at all.
fn deposit(waitlist: &mut Waitlist, origin: Address, data: Vec<u8>) {
    let key = if waitlist.contains_key(&origin) {
        origin
    } else {
        Address::WILDCARD
    };

    let queue = waitlist.entry(key).or_default();
    if let Some(slot) = queue.iter_mut().flatten().find(|s| !s.done) {
        slot.buffer = data;
        slot.peer = origin;
        slot.done = true;
        return;
    }

    queue.push(Some(Slot {
        done: true,
        buffer: data,
        peer: origin,
    }));
}

fn schedule_read(waitlist: &Arc<Mutex<Waitlist>>, want: Address, timeout_ms: u64) -> Result<(Vec<u8>, Address), Error> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    let index = {
        let mut wl = waitlist.lock();
        let queue = wl.entry(want).or_default();

        if let Some(i) = queue
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.done))
        {
            i
        } else if let Some(i) = queue
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| !s.done))
        {
            i
        } else {
            queue.retain(|s| s.is_some());
            queue.push(Some(Slot::pending()));
            queue.len() - 1
        }
    };

    loop {
        {
            let mut wl = waitlist.lock();
            if let Some(queue) = wl.get_mut(&want) {
                if let Some(Some(slot)) = queue.get(index) {
                    if slot.done {
                        let data = slot.buffer.clone();
                        let peer = slot.peer;
                        queue[index] = None;
                        return Ok((data, peer));
                    }
                }
            }
        }

        if Instant::now() >= deadline {
            let mut wl = waitlist.lock();
            if let Some(queue) = wl.get_mut(&want) {
                if index < queue.len() {
                    queue[index] = None;
                }
            }
            return Err(Error::Timeout);
        }

        thread::sleep(SPIN_SLEEP);
    }
}

fn gc_loop(waitlist: Arc<Mutex<Waitlist>>, stop: Arc<AtomicBool>, options: Options) {
    const TICK: Duration = Duration::from_millis(50);
    let mut elapsed = Duration::ZERO;

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(TICK);
        if stop.load(Ordering::Relaxed) {
            return;
        }

        elapsed += TICK;
        if elapsed < GC_INTERVAL {
            continue;
        }
        elapsed = Duration::ZERO;

        let mut wl = waitlist.lock();

        wl.retain(|_, queue| !queue.is_empty());

        for queue in wl.values_mut() {
            if queue.len() as u32 > options.max_requests_in_queue {
                queue.truncate(options.max_requests_in_queue as usize);
            }
        }

        if wl.len() as u32 > options.max_connections {
            wl.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn transport(port: u16) -> Arc<UdpTransport> {
        let mut cfg = HashMap::new();
        cfg.insert("ip".into(), "127.0.0.1".into());
        cfg.insert("port".into(), port.to_string());
        Arc::new(UdpTransport::enable(&cfg).unwrap())
    }

    fn local_address(t: &UdpTransport) -> Address {
        match t.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => Address::from(v4),
            _ => unreachable!(),
        }
    }

    #[test]
    fn demuxes_by_origin_address_from_header() {
        let reader_transport = transport(0);
        let reader_addr = local_address(&reader_transport);
        let router = Router::new(reader_transport, Options::default());

        let writer_transport = transport(0);
        let writer_addr = local_address(&writer_transport);

        let frame = Frame::new(
            FrameType::Data,
            writer_addr.ip,
            writer_addr.port,
            "host",
            0,
            b"hello world?".to_vec(),
        );
        let wire = frame.encode();

        writer_transport.write(&wire, &reader_addr, 1000).unwrap();

        let mut buf = vec![0u8; frame::HEADER_LEN + 32];
        let mut peer = writer_addr;
        let n = router.read(&mut buf, &mut peer, 2000).unwrap();
        assert_eq!(&buf[..n], wire.as_slice());
        assert_eq!(peer, writer_addr);
    }

    #[test]
    fn wildcard_read_matches_any_peer() {
        let reader_transport = transport(0);
        let reader_addr = local_address(&reader_transport);
        let router = Router::new(reader_transport, Options::default());

        let writer_transport = transport(0);
        let writer_addr = local_address(&writer_transport);

        let frame = Frame::new(
            FrameType::Data,
            writer_addr.ip,
            writer_addr.port,
            "host",
            0,
            b"hi".to_vec(),
        );
        writer_transport
            .write(&frame.encode(), &reader_addr, 1000)
            .unwrap();

        let mut buf = vec![0u8; frame::HEADER_LEN + 8];
        let mut peer = Address::WILDCARD;
        let n = router.read(&mut buf, &mut peer, 2000).unwrap();
        assert_eq!(n, frame::HEADER_LEN + 2);
        assert_eq!(peer, writer_addr);
    }

    #[test]
    fn read_times_out_with_no_data() {
        let router = Router::new(transport(0), Options::default());
        let mut buf = vec![0u8; frame::HEADER_LEN];
        let mut peer = Address::WILDCARD;
        assert!(matches!(router.read(&mut buf, &mut peer, 50), Err(Error::Timeout)));
    }
}
