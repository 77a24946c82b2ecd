//! Session - one reliable byte stream bound to one remote peer.
//!
//! A session owns its ARQ core, FEC codecs and carry buffer, and exposes
//! blocking `read`/`write` with optional deadlines. Blocking callers park on
//! one-shot event channels (read-ready, write-ready, error) plus a `die`
//! channel that broadcasts close by dropping its sender; a crossbeam `select!`
//! over those and a deadline timer re-checks state after every wakeup.
//!
//! Egress runs inside the ARQ output callback: the frame is copied behind
//! `header_size` bytes of headroom, FEC-encoded, nonce- and CRC-stamped,
//! encrypted in place, and written to the carrier `dup+1` times. Carrier
//! write errors are dropped silently; retransmission owns reliability.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};

use crate::crypt::BlockCrypt;
use crate::entropy::{NonceAes128, NONCE_SIZE};
use crate::error::{err_broken_pipe, err_invalid_operation, err_timeout};
use crate::fec::{
    FecDecoder, FecEncoder, FecPacket, FEC_HEADER_SIZE, FEC_HEADER_SIZE_PLUS2, RX_FEC_MULTI,
    TYPE_DATA, TYPE_FEC,
};
use crate::kcp::{Kcp, KCP_MTU_DEF, KCP_OVERHEAD};
use crate::pool;
use crate::snmp::{Snmp, SNMP};
use crate::transport::{IcmpConn, PacketConn, UdpConn, MTU_LIMIT};
use crate::updater;

/// CRC32 tag size.
pub(crate) const CRC_SIZE: usize = 4;

/// Crypto header: nonce + CRC32.
pub(crate) const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;

/// Receiver-to-processor queue depth.
pub(crate) const QLEN: usize = 128;

/// Milliseconds since the process-wide monotonic reference.
pub(crate) fn current_ms() -> u32 {
    static REF: OnceLock<Instant> = OnceLock::new();
    REF.get_or_init(Instant::now).elapsed().as_millis() as u32
}

/// Decrypts a datagram in place and verifies its CRC32.
///
/// Returns the bytes after the crypto header, or `None` (counted) on a
/// checksum mismatch. Without crypto the datagram passes through whole.
pub(crate) fn decrypt_datagram<'a>(
    block: &Option<Arc<dyn BlockCrypt>>,
    data: &'a mut [u8],
) -> Option<&'a [u8]> {
    let Some(block) = block else {
        return Some(data);
    };
    block.decrypt(data);
    if data.len() < CRYPT_HEADER_SIZE {
        Snmp::add(&SNMP.in_errs, 1);
        return None;
    }
    let body = &data[NONCE_SIZE..];
    let checksum = crc32fast::hash(&body[CRC_SIZE..]);
    if checksum == u32::from_le_bytes([body[0], body[1], body[2], body[3]]) {
        Some(&data[CRYPT_HEADER_SIZE..])
    } else {
        Snmp::add(&SNMP.in_csum_errors, 1);
        None
    }
}

/// Channels an accepted session uses to unregister from its listener.
pub(crate) struct ListenerHandle {
    pub(crate) session_closed_tx: Sender<SocketAddr>,
    pub(crate) die_rx: Receiver<()>,
}

struct EgressState {
    ext: Vec<u8>,
    fec_encoder: Option<FecEncoder>,
    nonce: Option<NonceAes128>,
    dup: usize,
}

/// Everything the ARQ output callback needs, separate from the session lock.
struct Egress {
    conn: Arc<dyn PacketConn>,
    remote: SocketAddr,
    block: Option<Arc<dyn BlockCrypt>>,
    header_size: usize,
    state: Mutex<EgressState>,
}

/// Nonce + CRC + encrypt, in place over one whole datagram.
fn seal(block: &dyn BlockCrypt, nonce: &mut NonceAes128, buf: &mut [u8]) {
    nonce.fill(&mut buf[..NONCE_SIZE]);
    let checksum = crc32fast::hash(&buf[CRYPT_HEADER_SIZE..]);
    buf[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    block.encrypt(buf);
}

/// The ARQ output callback body: header extension, FEC, crypt, transmit.
fn egress_output(egress: &Egress, frame: &[u8]) {
    let mut state = egress.state.lock().unwrap();
    let state = &mut *state;

    if egress.header_size == 0 {
        let mut nbytes = 0;
        let mut npkts = 0u64;
        for _ in 0..=state.dup {
            if let Ok(n) = egress.conn.write_to(frame, egress.remote) {
                nbytes += n as u64;
                npkts += 1;
            }
        }
        Snmp::add(&SNMP.out_pkts, npkts);
        Snmp::add(&SNMP.out_bytes, nbytes);
        return;
    }

    state.ext.clear();
    state.ext.resize(egress.header_size, 0);
    state.ext.extend_from_slice(frame);

    let mut parity = match &mut state.fec_encoder {
        Some(encoder) => encoder.encode(&mut state.ext),
        None => Vec::new(),
    };

    if let Some(block) = &egress.block {
        let nonce = state.nonce.as_mut().unwrap();
        seal(block.as_ref(), nonce, &mut state.ext);
        for shard in parity.iter_mut() {
            seal(block.as_ref(), nonce, shard);
        }
    }

    let mut nbytes = 0;
    let mut npkts = 0u64;
    for _ in 0..=state.dup {
        if let Ok(n) = egress.conn.write_to(&state.ext, egress.remote) {
            nbytes += n as u64;
            npkts += 1;
        }
    }
    for shard in &parity {
        if let Ok(n) = egress.conn.write_to(shard, egress.remote) {
            nbytes += n as u64;
            npkts += 1;
        }
    }
    Snmp::add(&SNMP.out_pkts, npkts);
    Snmp::add(&SNMP.out_bytes, nbytes);
}

struct Inner {
    kcp: Kcp,
    fec_decoder: Option<FecDecoder>,
    // Carry buffer for messages larger than the caller's read buffer.
    recvbuf: Vec<u8>,
    bufptr: usize,
    buflen: usize,
    rd: Option<Instant>,
    wd: Option<Instant>,
    ack_no_delay: bool,
    write_delay: bool,
    is_closed: bool,
}

/// A reliable, ordered, encrypted duplex stream over a datagram carrier.
pub struct Session {
    conv: u32,
    conn: Arc<dyn PacketConn>,
    remote: SocketAddr,
    header_size: usize,
    listener: Option<ListenerHandle>,
    block: Option<Arc<dyn BlockCrypt>>,
    egress: Arc<Egress>,

    inner: Mutex<Inner>,

    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,
    read_event_tx: Sender<()>,
    read_event_rx: Receiver<()>,
    write_event_tx: Sender<()>,
    write_event_rx: Receiver<()>,
    error_tx: Sender<io::Error>,
    error_rx: Receiver<io::Error>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.conv)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Session {
    /// Builds a session (client- or listener-side) over `conn`.
    pub(crate) fn new(
        conv: u32,
        data_shards: usize,
        parity_shards: usize,
        listener: Option<ListenerHandle>,
        conn: Arc<dyn PacketConn>,
        remote: SocketAddr,
        block: Option<Arc<dyn BlockCrypt>>,
    ) -> io::Result<Arc<Session>> {
        let fec_enabled = data_shards > 0 || parity_shards > 0;

        let mut header_size = 0;
        if block.is_some() {
            header_size += CRYPT_HEADER_SIZE;
        }
        if fec_enabled {
            header_size += FEC_HEADER_SIZE_PLUS2;
        }

        let (fec_decoder, fec_encoder) = if fec_enabled {
            let rx_limit = RX_FEC_MULTI * (data_shards + parity_shards);
            let fec_offset = if block.is_some() { CRYPT_HEADER_SIZE } else { 0 };
            let decoder = FecDecoder::new(rx_limit, data_shards, parity_shards)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let encoder = FecEncoder::new(data_shards, parity_shards, fec_offset)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            (Some(decoder), Some(encoder))
        } else {
            (None, None)
        };

        let nonce = match &block {
            Some(_) => Some(NonceAes128::new().map_err(io::Error::other)?),
            None => None,
        };

        let egress = Arc::new(Egress {
            conn: conn.clone(),
            remote,
            block: block.clone(),
            header_size,
            state: Mutex::new(EgressState {
                ext: Vec::with_capacity(MTU_LIMIT),
                fec_encoder,
                nonce,
                dup: 0,
            }),
        });

        let egress_cb = egress.clone();
        let mut kcp = Kcp::new(
            conv,
            Box::new(move |frame: &[u8]| {
                if frame.len() >= KCP_OVERHEAD {
                    egress_output(&egress_cb, frame);
                }
            }),
        );
        kcp.set_mtu(KCP_MTU_DEF - header_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let (die_tx, die_rx) = bounded::<()>(0);
        let (read_event_tx, read_event_rx) = bounded::<()>(1);
        let (write_event_tx, write_event_rx) = bounded::<()>(1);
        let (error_tx, error_rx) = bounded::<io::Error>(1);

        let is_client = listener.is_none();
        let session = Arc::new(Session {
            conv,
            conn,
            remote,
            header_size,
            listener,
            block,
            egress,
            inner: Mutex::new(Inner {
                kcp,
                fec_decoder,
                recvbuf: vec![0; MTU_LIMIT],
                bufptr: 0,
                buflen: 0,
                rd: None,
                wd: None,
                ack_no_delay: false,
                write_delay: false,
                is_closed: false,
            }),
            die_rx,
            die_tx: Mutex::new(Some(die_tx)),
            read_event_tx,
            read_event_rx,
            write_event_tx,
            write_event_rx,
            error_tx,
            error_rx,
        });

        updater::register(&session);

        if is_client {
            let s = session.clone();
            thread::spawn(move || s.read_loop());
        }
        SNMP.session_opened(!is_client);

        Ok(session)
    }

    /// Conversation id shared with the peer.
    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Reads up to `buf.len()` bytes, blocking until data, deadline, error or
    /// close. Leftover bytes of an oversized message are carried over to the
    /// next call.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let timeout_at;
            {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;

                if inner.buflen > inner.bufptr {
                    let n = (inner.buflen - inner.bufptr).min(buf.len());
                    buf[..n].copy_from_slice(&inner.recvbuf[inner.bufptr..inner.bufptr + n]);
                    inner.bufptr += n;
                    return Ok(n);
                }

                if inner.is_closed {
                    return Err(err_broken_pipe());
                }

                if let Some(size) = inner.kcp.peek_size() {
                    if size > 0 {
                        Snmp::add(&SNMP.bytes_received, size as u64);
                        if buf.len() >= size {
                            if let Ok(n) = inner.kcp.recv(buf) {
                                return Ok(n);
                            }
                        } else {
                            if inner.recvbuf.len() < size {
                                inner.recvbuf.resize(size, 0);
                            }
                            if let Ok(sz) = inner.kcp.recv(&mut inner.recvbuf[..size]) {
                                let n = buf.len().min(sz);
                                buf[..n].copy_from_slice(&inner.recvbuf[..n]);
                                inner.bufptr = n;
                                inner.buflen = sz;
                                return Ok(n);
                            }
                        }
                    }
                }

                match inner.rd {
                    Some(rd) => {
                        if Instant::now() >= rd {
                            return Err(err_timeout());
                        }
                        timeout_at = Some(rd);
                    }
                    None => timeout_at = None,
                }
            }

            let deadline = match timeout_at {
                Some(t) => at(t),
                None => never(),
            };
            select! {
                recv(self.read_event_rx) -> _ => {}
                recv(deadline) -> _ => {}
                recv(self.die_rx) -> _ => {}
                recv(self.error_rx) -> err => {
                    if let Ok(e) = err {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Writes `buf`, blocking while the send window is saturated. Data is
    /// fragmented into MSS-sized ARQ sends; the flush happens immediately
    /// unless write-delay is on and the window still has room.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            if self.inner.lock().unwrap().is_closed {
                return Err(err_broken_pipe());
            }
            return Ok(0);
        }

        loop {
            let timeout_at;
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.is_closed {
                    return Err(err_broken_pipe());
                }

                if inner.kcp.wait_snd() < inner.kcp.snd_wnd() as usize {
                    let mss = inner.kcp.mss();
                    let mut rest = buf;
                    loop {
                        if rest.len() <= mss {
                            let _ = inner.kcp.send(rest);
                            break;
                        }
                        let _ = inner.kcp.send(&rest[..mss]);
                        rest = &rest[mss..];
                    }

                    if inner.kcp.wait_snd() >= inner.kcp.snd_wnd() as usize || !inner.write_delay {
                        inner.kcp.flush(false, current_ms());
                    }
                    Snmp::add(&SNMP.bytes_sent, buf.len() as u64);
                    return Ok(buf.len());
                }

                match inner.wd {
                    Some(wd) => {
                        if Instant::now() >= wd {
                            return Err(err_timeout());
                        }
                        timeout_at = Some(wd);
                    }
                    None => timeout_at = None,
                }
            }

            let deadline = match timeout_at {
                Some(t) => at(t),
                None => never(),
            };
            select! {
                recv(self.write_event_rx) -> _ => {}
                recv(deadline) -> _ => {}
                recv(self.die_rx) -> _ => {}
            }
        }
    }

    /// Closes the session. The first call succeeds; later calls (and any
    /// blocked or future read/write) fail with broken-pipe. Client sessions
    /// also close their carrier.
    pub fn close(&self) -> io::Result<()> {
        // Unregister from the listener's map; the updater drops closed
        // sessions on their next visit.
        if let Some(listener) = &self.listener {
            select! {
                send(listener.session_closed_tx, self.remote) -> _ => {}
                recv(listener.die_rx) -> _ => {}
            }
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.is_closed {
                return Err(err_broken_pipe());
            }
            inner.is_closed = true;
        }
        // Dropping the sender wakes every receiver of `die`.
        *self.die_tx.lock().unwrap() = None;
        SNMP.session_closed();

        if self.listener.is_none() {
            self.conn.close()
        } else {
            Ok(())
        }
    }

    /// Sets both read and write deadlines; `None` disables.
    pub fn set_deadline(&self, t: Option<Instant>) {
        let mut inner = self.inner.lock().unwrap();
        inner.rd = t;
        inner.wd = t;
        drop(inner);
        self.notify_read_event();
        self.notify_write_event();
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        self.inner.lock().unwrap().rd = t;
        self.notify_read_event();
    }

    pub fn set_write_deadline(&self, t: Option<Instant>) {
        self.inner.lock().unwrap().wd = t;
        self.notify_write_event();
    }

    /// Delays flush after `write` until the next updater tick, for bulk
    /// transfer batching.
    pub fn set_write_delay(&self, delay: bool) {
        self.inner.lock().unwrap().write_delay = delay;
    }

    /// Maximum send/receive window sizes in segments.
    pub fn set_window_size(&self, snd_wnd: u32, rcv_wnd: u32) {
        self.inner.lock().unwrap().kcp.set_wnd_size(snd_wnd, rcv_wnd);
    }

    /// Sets the datagram MTU (headers included). Rejects values above the
    /// carrier limit or too small to fit the session headers and one segment
    /// header.
    pub fn set_mtu(&self, mtu: usize) -> io::Result<()> {
        if mtu > MTU_LIMIT || mtu < self.header_size + KCP_OVERHEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid mtu"));
        }
        self.inner
            .lock()
            .unwrap()
            .kcp
            .set_mtu(mtu - self.header_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    /// Stream mode merges consecutive writes; message mode keeps boundaries.
    pub fn set_stream_mode(&self, enable: bool) {
        self.inner.lock().unwrap().kcp.set_stream(enable);
    }

    /// Flush ACKs immediately on every input instead of batching them.
    pub fn set_ack_no_delay(&self, nodelay: bool) {
        self.inner.lock().unwrap().ack_no_delay = nodelay;
    }

    /// Sends every outgoing datagram `dup` extra times.
    pub fn set_dup(&self, dup: usize) {
        self.egress.state.lock().unwrap().dup = dup;
    }

    /// ARQ latency knobs, forwarded to the core.
    pub fn set_nodelay(&self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.inner
            .lock()
            .unwrap()
            .kcp
            .set_nodelay(nodelay, interval, resend, nc);
    }

    /// DSCP marking; refused on accepted sessions, whose carrier belongs to
    /// the listener.
    pub fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        if self.listener.is_some() {
            return Err(err_invalid_operation());
        }
        self.conn.set_dscp(dscp)
    }

    pub fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        if self.listener.is_some() {
            return Err(err_invalid_operation());
        }
        self.conn.set_read_buffer(bytes)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        if self.listener.is_some() {
            return Err(err_invalid_operation());
        }
        self.conn.set_write_buffer(bytes)
    }

    fn notify_read_event(&self) {
        let _ = self.read_event_tx.try_send(());
    }

    fn notify_write_event(&self) {
        let _ = self.write_event_tx.try_send(());
    }

    /// Periodic flush driven by the global updater. Returns the core's
    /// requested revisit interval, or `None` once closed.
    pub(crate) fn update(&self) -> Option<Duration> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_closed {
            return None;
        }
        let waitsnd = inner.kcp.wait_snd();
        let interval = inner.kcp.flush(false, current_ms());
        if inner.kcp.wait_snd() < waitsnd {
            drop(inner);
            self.notify_write_event();
        }
        Some(Duration::from_millis(u64::from(interval)))
    }

    /// Ingress for one decrypted, CRC-verified datagram: FEC classification
    /// and recovery, then ARQ input, then reader/writer wakeups.
    pub(crate) fn kcp_input(&self, data: &[u8]) {
        let mut kcp_in_errors = 0u64;
        let mut fec_errs = 0u64;
        let mut fec_recovered = 0u64;
        let mut fec_parity_shards = 0u64;
        let current = current_ms();

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(decoder) = &mut inner.fec_decoder {
            if data.len() > FEC_HEADER_SIZE {
                let pkt = FecPacket::parse(data);
                let flag = pkt.flag;
                if flag == TYPE_DATA || flag == TYPE_FEC {
                    if flag == TYPE_FEC {
                        fec_parity_shards += 1;
                    }
                    let recovers = decoder.decode(pkt);

                    let waitsnd = inner.kcp.wait_snd();
                    let ack_no_delay = inner.ack_no_delay;
                    if flag == TYPE_DATA
                        && inner
                            .kcp
                            .input(&data[FEC_HEADER_SIZE_PLUS2..], true, ack_no_delay, current)
                            .is_err()
                    {
                        kcp_in_errors += 1;
                    }

                    for shard in recovers {
                        if shard.len() >= 2 {
                            let sz = u16::from_be_bytes([shard[0], shard[1]]) as usize;
                            if sz >= 2 && sz <= shard.len() {
                                if inner
                                    .kcp
                                    .input(&shard[2..sz], false, ack_no_delay, current)
                                    .is_ok()
                                {
                                    fec_recovered += 1;
                                } else {
                                    kcp_in_errors += 1;
                                }
                            } else {
                                fec_errs += 1;
                            }
                        } else {
                            fec_errs += 1;
                        }
                    }

                    if inner.kcp.peek_size().unwrap_or(0) > 0 {
                        self.notify_read_event();
                    }
                    if inner.kcp.wait_snd() < waitsnd {
                        self.notify_write_event();
                    }
                } else {
                    Snmp::add(&SNMP.in_errs, 1);
                }
            } else {
                Snmp::add(&SNMP.in_errs, 1);
            }
        } else {
            let waitsnd = inner.kcp.wait_snd();
            let ack_no_delay = inner.ack_no_delay;
            if inner.kcp.input(data, true, ack_no_delay, current).is_err() {
                kcp_in_errors += 1;
            }
            if inner.kcp.peek_size().unwrap_or(0) > 0 {
                self.notify_read_event();
            }
            if inner.kcp.wait_snd() < waitsnd {
                self.notify_write_event();
            }
        }
        drop(guard);

        Snmp::add(&SNMP.in_pkts, 1);
        Snmp::add(&SNMP.in_bytes, data.len() as u64);
        if fec_parity_shards > 0 {
            Snmp::add(&SNMP.fec_parity_shards, fec_parity_shards);
        }
        if kcp_in_errors > 0 {
            Snmp::add(&SNMP.kcp_in_errors, kcp_in_errors);
        }
        if fec_errs > 0 {
            Snmp::add(&SNMP.fec_errs, fec_errs);
        }
        if fec_recovered > 0 {
            Snmp::add(&SNMP.fec_recovered, fec_recovered);
        }
    }

    /// Client-side receive pipeline: a receiver thread feeds a bounded queue,
    /// this loop decrypts, verifies and hands datagrams to the ARQ core.
    fn read_loop(self: Arc<Self>) {
        let (pkt_tx, pkt_rx) = bounded::<(Vec<u8>, usize)>(QLEN);
        {
            let conn = self.conn.clone();
            let die_rx = self.die_rx.clone();
            let error_tx = self.error_tx.clone();
            let min_len = self.header_size + KCP_OVERHEAD;
            thread::spawn(move || loop {
                let mut buf = pool::get();
                match conn.read_from(&mut buf) {
                    Ok((n, _from)) if n >= min_len => {
                        select! {
                            send(pkt_tx, (buf, n)) -> result => {
                                if result.is_err() {
                                    return;
                                }
                            }
                            recv(die_rx) -> _ => return,
                        }
                    }
                    Ok(_) => {
                        Snmp::add(&SNMP.in_errs, 1);
                        pool::put(buf);
                    }
                    Err(e) => {
                        let _ = error_tx.try_send(e);
                        return;
                    }
                }
            });
        }

        loop {
            select! {
                recv(pkt_rx) -> msg => {
                    let Ok((mut buf, n)) = msg else { return };
                    if let Some(payload) = decrypt_datagram(&self.block, &mut buf[..n]) {
                        self.kcp_input(payload);
                    }
                    pool::put(buf);
                }
                recv(self.die_rx) -> _ => return,
            }
        }
    }
}

/// Client session over an arbitrary carrier with a random conversation id.
pub fn new_conn(
    remote: SocketAddr,
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    conn: Arc<dyn PacketConn>,
) -> io::Result<Arc<Session>> {
    let conv: u32 = rand::random();
    Session::new(conv, data_shards, parity_shards, None, conn, remote, block)
}

/// Dials a peer over plain UDP.
pub fn dial_udp(
    raddr: &str,
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
) -> io::Result<Arc<Session>> {
    let remote: SocketAddr = raddr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let local = if remote.is_ipv4() {
        "0.0.0.0:0"
    } else {
        "[::]:0"
    };
    let conn = Arc::new(UdpConn::bind(local)?);
    new_conn(remote, block, data_shards, parity_shards, conn)
}

/// Dials a peer over ICMP echo. `send_replies` selects echo-reply framing
/// (normally false for clients); `dev` optionally pins the interface.
pub fn dial_with_options(
    raddr: &str,
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    send_replies: bool,
    dev: &str,
) -> io::Result<Arc<Session>> {
    let ip: IpAddr = raddr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let conn = Arc::new(IcmpConn::open(Some(ip), send_replies, dev)?);
    new_conn(SocketAddr::new(ip, 0), block, data_shards, parity_shards, conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_rejects_corrupted_datagram() {
        use crate::crypt::AesBlockCrypt;

        let block: Arc<dyn BlockCrypt> = Arc::new(AesBlockCrypt::new(&[7u8; 16]).unwrap());
        let mut datagram = vec![0u8; CRYPT_HEADER_SIZE + 40];
        datagram[CRYPT_HEADER_SIZE..].fill(0x42);
        let checksum = crc32fast::hash(&datagram[CRYPT_HEADER_SIZE..]);
        datagram[NONCE_SIZE..CRYPT_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
        block.encrypt(&mut datagram);

        // Pristine copy passes.
        let mut ok = datagram.clone();
        let payload = decrypt_datagram(&Some(block.clone()), &mut ok).unwrap();
        assert!(payload.iter().all(|&b| b == 0x42));

        // One flipped bit fails the CRC and bumps the counter.
        let before = SNMP.snapshot().in_csum_errors;
        let mut bad = datagram.clone();
        bad[CRYPT_HEADER_SIZE + 3] ^= 0x01;
        assert!(decrypt_datagram(&Some(block), &mut bad).is_none());
        assert!(SNMP.snapshot().in_csum_errors > before);
    }

    #[test]
    fn decrypt_passthrough_without_block() {
        let mut data = vec![1u8, 2, 3, 4];
        let payload = decrypt_datagram(&None, &mut data).unwrap();
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn invalid_fec_config_rejected() {
        let conn = Arc::new(UdpConn::bind("127.0.0.1:0").unwrap());
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let result = new_conn(remote, None, 0, 3, conn);
        assert!(result.is_err(), "parity without data shards must not build");
    }

    #[test]
    fn current_ms_is_monotonic() {
        let a = current_ms();
        std::thread::sleep(Duration::from_millis(15));
        let b = current_ms();
        assert!(b > a);
    }
}
