use frame::{Address, Error, Params};
use parking_lot::Mutex;
use protocol::Protocol;

/// `0x12 0xF3 "multipart" 0x3F 0x21`, followed by an 8-byte little-endian
/// total length. Anything not starting with this exact prefix is a
/// single in-band message.
const MULTIPART_MAGIC: [u8; 13] = *b"\x12\xF3multipart\x3F\x21";
const LENGTH_FIELD_LEN: usize = 8;
const HEADER_LEN: usize = MULTIPART_MAGIC.len() + LENGTH_FIELD_LEN;

/// One message-oriented connection. Wraps a [`Protocol`] instance and
/// transparently fragments writes (and reassembles reads) larger than a
/// single frame's `mtu`.
pub struct Session {
    protocol: Protocol,
    local_config: Params,
    remote: Address,
    mtu: usize,
    /// Total length of a multipart message whose header frame has
    /// already been consumed off the wire by a prior `read` call that
    /// rejected the caller's buffer as too small. The next `read` call
    /// resumes fragment reassembly directly instead of expecting to see
    /// the magic header again.
    pending_multipart: Mutex<Option<usize>>,
}

impl Session {
    pub(crate) fn new(protocol: Protocol, local_config: Params, remote: Address) -> Self {
        let mtu = protocol.mtu() as usize;
        Self {
            protocol,
            local_config,
            remote,
            mtu,
            pending_multipart: Mutex::new(None),
        }
    }

    pub fn config(&self) -> (Params, Address) {
        (self.local_config.clone(), self.remote)
    }

    pub fn disconnect(&self) {
        self.protocol.disconnect();
    }

    /// Writes `buf`, fragmenting into `mtu`-sized frames (preceded by a
    /// multipart header) when it doesn't fit in one.
    pub fn write(&self, buf: &[u8], timeout_ms: u64) -> Result<usize, Error> {
        if buf.len() <= self.mtu {
            return self.protocol.write(buf, timeout_ms);
        }

        let fragments = buf.len().div_ceil(self.mtu) as u64;
        let per_fragment_timeout = timeout_ms / (fragments + 2);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(&MULTIPART_MAGIC);
        header.extend_from_slice(&(buf.len() as u64).to_le_bytes());
        self.protocol.write(&header, per_fragment_timeout)?;

        for chunk in buf.chunks(self.mtu) {
            self.protocol.write(chunk, per_fragment_timeout)?;
        }

        Ok(buf.len())
    }

    /// Reads one message. If the first frame carries the multipart
    /// header, reassembles the announced length before returning;
    /// otherwise passes the single frame through.
    ///
    /// If a previous call rejected the caller's buffer with
    /// `BufferOverflow`, the multipart header frame has already been
    /// consumed off the wire; this call resumes fragment reassembly
    /// rather than waiting for the header again.
    pub fn read(&self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, Error> {
        let mut scratch = vec![0u8; self.mtu];

        let total = {
            let mut pending = self.pending_multipart.lock();
            match pending.take() {
                Some(total) => total,
                None => {
                    let n = self.protocol.read(&mut scratch, timeout_ms)?;

                    if n < HEADER_LEN || scratch[..MULTIPART_MAGIC.len()] != MULTIPART_MAGIC {
                        if n > buf.len() {
                            return Err(Error::BufferOverflow { required_size: n });
                        }
                        buf[..n].copy_from_slice(&scratch[..n]);
                        return Ok(n);
                    }

                    let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
                    len_bytes.copy_from_slice(&scratch[MULTIPART_MAGIC.len()..HEADER_LEN]);
                    u64::from_le_bytes(len_bytes) as usize
                }
            }
        };

        if total > buf.len() {
            *self.pending_multipart.lock() = Some(total);
            return Err(Error::BufferOverflow { required_size: total });
        }

        let mut received = 0usize;
        while received < total {
            let n = self.protocol.read(&mut scratch, timeout_ms)?;
            let take = n.min(total - received);
            buf[received..received + take].copy_from_slice(&scratch[..take]);
            received += take;
        }

        Ok(total)
    }
}
