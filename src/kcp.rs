//! KCP - the ARQ engine: reliable, ordered delivery over lossy datagrams.
//!
//! Pure state machine. It never touches a socket; outgoing bytes (one or more
//! concatenated segments, at most `mtu` per call) go through the output
//! callback, and the owner layers FEC/crypto/transport in that callback.
//! All timestamps are milliseconds from one monotonic reference, passed in by
//! the caller so the machine is fully deterministic under test.
//!
//! ## Segment wire format (little-endian)
//!
//! ```text
//! [conv:4][cmd:1][frg:1][wnd:2][ts:4][sn:4][una:4][len:4][data:len]
//! ```

use std::cmp;
use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use crate::error::KcpError;
use crate::snmp::{Snmp, SNMP};

/// RTO floor in nodelay mode.
const KCP_RTO_NDL: u32 = 30;
/// RTO floor in normal mode.
const KCP_RTO_MIN: u32 = 100;
/// Initial RTO before any RTT sample.
const KCP_RTO_DEF: u32 = 200;
/// RTO ceiling.
const KCP_RTO_MAX: u32 = 60000;

/// Data segment.
const KCP_CMD_PUSH: u8 = 81;
/// Acknowledgment.
const KCP_CMD_ACK: u8 = 82;
/// Window probe request.
const KCP_CMD_WASK: u8 = 83;
/// Window size reply.
const KCP_CMD_WINS: u8 = 84;

const KCP_ASK_SEND: u32 = 1;
const KCP_ASK_TELL: u32 = 2;

/// Default send window, in segments.
const KCP_WND_SND: u32 = 32;
/// Default receive window, in segments.
const KCP_WND_RCV: u32 = 32;

/// Default MTU handed to a fresh core; owners shrink it by their header size.
pub const KCP_MTU_DEF: usize = 1400;
/// Fixed segment header size.
pub const KCP_OVERHEAD: usize = 24;

/// Default flush interval, ms.
const KCP_INTERVAL: u32 = 100;
/// Transmission count at which a segment marks the link dead.
const KCP_DEADLINK: u32 = 20;
const KCP_THRESH_INIT: u32 = 2;
const KCP_THRESH_MIN: u32 = 2;
/// First zero-window probe delay, ms.
const KCP_PROBE_INIT: u32 = 7000;
/// Probe backoff ceiling, ms.
const KCP_PROBE_LIMIT: u32 = 120000;

/// Output callback: receives ready-to-ship segment batches.
pub type OutputFn = Box<dyn FnMut(&[u8]) + Send>;

/// Signed distance between wrapping u32 sequence numbers / timestamps.
#[inline]
pub(crate) fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

#[inline]
fn bound(lower: u32, v: u32, upper: u32) -> u32 {
    cmp::min(cmp::max(lower, v), upper)
}

#[derive(Default)]
struct Segment {
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    rto: u32,
    xmit: u32,
    resendts: u32,
    fastack: u32,
    data: BytesMut,
}

impl Segment {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
}

/// The ARQ state machine for one conversation.
pub struct Kcp {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead_link_hit: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttvar: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    probe: u32,

    interval: u32,
    ts_flush: u32,
    updated: bool,

    ts_probe: u32,
    probe_wait: u32,

    incr: usize,

    nodelay: bool,
    fastresend: u32,
    nocwnd: bool,
    stream: bool,

    snd_queue: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,

    acklist: Vec<(u32, u32)>, // (sn, ts)

    buffer: BytesMut,
    output: OutputFn,
}

impl Kcp {
    /// Creates a core for conversation `conv`; both peers must agree on it.
    pub fn new(conv: u32, output: OutputFn) -> Self {
        Kcp {
            conv,
            mtu: KCP_MTU_DEF,
            mss: KCP_MTU_DEF - KCP_OVERHEAD,
            dead_link_hit: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: KCP_THRESH_INIT,
            rx_rttvar: 0,
            rx_srtt: 0,
            rx_rto: KCP_RTO_DEF,
            rx_minrto: KCP_RTO_MIN,
            snd_wnd: KCP_WND_SND,
            rcv_wnd: KCP_WND_RCV,
            rmt_wnd: KCP_WND_RCV,
            cwnd: 0,
            probe: 0,
            interval: KCP_INTERVAL,
            ts_flush: KCP_INTERVAL,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            incr: 0,
            nodelay: false,
            fastresend: 0,
            nocwnd: false,
            stream: false,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buffer: BytesMut::with_capacity(KCP_MTU_DEF + KCP_OVERHEAD),
            output,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn snd_wnd(&self) -> u32 {
        self.snd_wnd
    }

    /// Segments queued or in flight on the send side.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// True once any segment has been retransmitted past the dead-link count.
    pub fn is_dead_link(&self) -> bool {
        self.dead_link_hit
    }

    /// Latency/throughput trade-offs: `nodelay` lowers the RTO floor to 30 ms,
    /// `interval` is the flush cadence (clamped 10..5000 ms), `resend` the
    /// duplicate-ACK fast-retransmit threshold (0 disables), `nc` disables
    /// congestion control.
    pub fn set_nodelay(&mut self, nodelay: bool, interval: u32, resend: u32, nc: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay { KCP_RTO_NDL } else { KCP_RTO_MIN };
        self.interval = bound(10, interval, 5000);
        self.fastresend = resend;
        self.nocwnd = nc;
    }

    /// Send/receive window sizes in segments; zero leaves a side unchanged.
    pub fn set_wnd_size(&mut self, snd_wnd: u32, rcv_wnd: u32) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd;
        }
    }

    /// Sets the largest datagram this core may emit; MSS becomes `mtu - 24`.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), KcpError> {
        if mtu < 50 || mtu <= KCP_OVERHEAD {
            return Err(KcpError::InvalidMtu);
        }
        self.mtu = mtu;
        self.mss = mtu - KCP_OVERHEAD;
        Ok(())
    }

    /// Stream mode concatenates writes into a byte stream; message mode
    /// preserves write boundaries via fragment numbering.
    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    // ------------------------------------------------------------------
    // user -> kcp
    // ------------------------------------------------------------------

    /// Appends payload to the send queue. Returns bytes accepted.
    pub fn send(&mut self, mut buffer: &[u8]) -> Result<usize, KcpError> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let total = buffer.len();

        // Stream mode first tops up the queue's tail segment.
        if self.stream {
            if let Some(tail) = self.snd_queue.back_mut() {
                if tail.data.len() < self.mss {
                    let extend = cmp::min(buffer.len(), self.mss - tail.data.len());
                    tail.data.extend_from_slice(&buffer[..extend]);
                    buffer = &buffer[extend..];
                }
            }
            if buffer.is_empty() {
                return Ok(total);
            }
        }

        let count = buffer.len().div_ceil(self.mss);
        if count > 255 {
            return Err(KcpError::OversizePayload);
        }
        for i in 0..count {
            let sz = cmp::min(buffer.len(), self.mss);
            let mut seg = Segment {
                data: BytesMut::from(&buffer[..sz]),
                ..Default::default()
            };
            seg.frg = if self.stream { 0 } else { (count - i - 1) as u8 };
            self.snd_queue.push_back(seg);
            buffer = &buffer[sz..];
        }
        Ok(total)
    }

    /// Size of the next complete message, or `None` if nothing is ready.
    pub fn peek_size(&self) -> Option<usize> {
        let seg = self.rcv_queue.front()?;
        if seg.frg == 0 {
            return Some(seg.data.len());
        }
        if self.rcv_queue.len() < seg.frg as usize + 1 {
            return None;
        }
        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    /// Copies the next complete message into `buffer`.
    pub fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, KcpError> {
        let peeksize = self.peek_size().ok_or(KcpError::NoData)?;
        if peeksize > buffer.len() {
            return Err(KcpError::BufferTooSmall);
        }

        let fast_recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        // Merge one fragment train.
        let mut n = 0;
        while let Some(seg) = self.rcv_queue.pop_front() {
            buffer[n..n + seg.data.len()].copy_from_slice(&seg.data);
            n += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }

        self.move_rcv_buf_to_queue();

        // The window just reopened; volunteer the news to the peer.
        if self.rcv_queue.len() < self.rcv_wnd as usize && fast_recover {
            self.probe |= KCP_ASK_TELL;
        }

        Ok(n)
    }

    // ------------------------------------------------------------------
    // peer -> kcp
    // ------------------------------------------------------------------

    /// Feeds raw segment bytes received from the peer.
    ///
    /// `regular` marks packets straight off the wire; FEC-recovered input
    /// passes `false` so stale timestamps cannot pollute RTT, window or probe
    /// state. With `ack_no_delay`, pending ACKs are flushed before returning.
    /// Errors only on malformed framing.
    pub fn input(
        &mut self,
        mut data: &[u8],
        regular: bool,
        ack_no_delay: bool,
        current: u32,
    ) -> Result<(), KcpError> {
        let prev_una = self.snd_una;
        if data.len() < KCP_OVERHEAD {
            return Err(KcpError::ShortBuffer);
        }

        let mut latest_ts = 0u32;
        let mut acked = false;
        let mut in_segs = 0u64;

        loop {
            if data.len() < KCP_OVERHEAD {
                break;
            }
            let conv = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            if conv != self.conv {
                return Err(KcpError::ConvMismatch);
            }
            let cmd = data[4];
            let frg = data[5];
            let wnd = u16::from_le_bytes([data[6], data[7]]);
            let ts = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
            let sn = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
            let una = u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
            let len = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;
            data = &data[KCP_OVERHEAD..];
            if data.len() < len {
                return Err(KcpError::ShortBuffer);
            }
            if !matches!(cmd, KCP_CMD_PUSH | KCP_CMD_ACK | KCP_CMD_WASK | KCP_CMD_WINS) {
                return Err(KcpError::UnknownCommand(cmd));
            }

            // Only packets fresh off the wire may update the remote window.
            if regular {
                self.rmt_wnd = wnd as u32;
            }
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                KCP_CMD_ACK => {
                    self.parse_ack(sn);
                    self.parse_fastack(sn, ts);
                    acked = true;
                    latest_ts = ts;
                }
                KCP_CMD_PUSH => {
                    let mut repeat = true;
                    if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.ack_push(sn, ts);
                        if timediff(sn, self.rcv_nxt) >= 0 {
                            let seg = Segment {
                                conv,
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                data: BytesMut::from(&data[..len]),
                                ..Default::default()
                            };
                            repeat = self.parse_data(seg);
                        }
                    }
                    if regular && repeat {
                        Snmp::add(&SNMP.repeat_segs, 1);
                    }
                }
                KCP_CMD_WASK => {
                    self.probe |= KCP_ASK_TELL;
                }
                KCP_CMD_WINS => {
                    // Window update already absorbed above.
                }
                _ => unreachable!(),
            }
            in_segs += 1;
            data = &data[len..];
        }
        Snmp::add(&SNMP.in_segs, in_segs);

        if acked && regular && timediff(current, latest_ts) >= 0 {
            self.update_ack(timediff(current, latest_ts));
        }

        // Ack progress grows the congestion window.
        if timediff(self.snd_una, prev_una) > 0 && !self.nocwnd && self.cwnd < self.rmt_wnd {
            let mss = self.mss;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            } else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + (mss / 16);
                if (self.cwnd as usize + 1) * mss <= self.incr {
                    self.cwnd += 1;
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd as usize * mss;
            }
        }

        if ack_no_delay && !self.acklist.is_empty() {
            self.flush(true, current);
        }
        Ok(())
    }

    fn update_ack(&mut self, rtt: i32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttvar = rtt / 2;
        } else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttvar = (3 * self.rx_rttvar + delta) / 4;
            self.rx_srtt = (7 * self.rx_srtt + rtt) / 8;
            if self.rx_srtt < 1 {
                self.rx_srtt = 1;
            }
        }
        let rto = self.rx_srtt as u32 + cmp::max(self.interval, 4 * self.rx_rttvar as u32);
        self.rx_rto = bound(self.rx_minrto, rto, KCP_RTO_MAX);
        log::trace!(
            "rtt sample {}ms, srtt {}ms, rto {}ms",
            rtt,
            self.rx_srtt,
            self.rx_rto
        );
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if sn == seg_sn {
                self.snd_buf.remove(i);
                break;
            }
            if timediff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in self.snd_buf.iter_mut() {
            if timediff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn && timediff(seg.ts, ts) <= 0 {
                seg.fastack += 1;
            }
        }
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn ack_push(&mut self, sn: u32, ts: u32) {
        self.acklist.push((sn, ts));
    }

    /// Inserts one PUSH segment into the receive buffer; returns true for
    /// duplicates.
    fn parse_data(&mut self, newseg: Segment) -> bool {
        let sn = newseg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0
            || timediff(sn, self.rcv_nxt) < 0
        {
            return true;
        }

        let mut repeat = false;
        let mut insert_idx = 0;
        for i in (0..self.rcv_buf.len()).rev() {
            let seg_sn = self.rcv_buf[i].sn;
            if seg_sn == sn {
                repeat = true;
                break;
            }
            if timediff(sn, seg_sn) > 0 {
                insert_idx = i + 1;
                break;
            }
        }
        if !repeat {
            self.rcv_buf.insert(insert_idx, newseg);
        }

        self.move_rcv_buf_to_queue();
        repeat
    }

    /// Promotes in-order segments to the receive queue while it has window room.
    fn move_rcv_buf_to_queue(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front().unwrap();
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.rcv_queue.push_back(seg);
            } else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    fn wnd_unused(&self) -> u16 {
        let used = self.rcv_queue.len() as u32;
        if used < self.rcv_wnd {
            (self.rcv_wnd - used) as u16
        } else {
            0
        }
    }

    fn make_space(&mut self, space: usize) {
        if self.buffer.len() + space > self.mtu {
            self.flush_buffer();
        }
    }

    fn flush_buffer(&mut self) {
        if !self.buffer.is_empty() {
            (self.output)(&self.buffer);
            self.buffer.clear();
        }
    }

    /// Runs one send-side pass: emits ACKs, window probes, new data within the
    /// effective window, and retransmissions whose timers or fast-ack counters
    /// have fired. Returns the interval in ms until the next useful call.
    pub fn flush(&mut self, ack_only: bool, current: u32) -> u32 {
        let mut seg = Segment {
            conv: self.conv,
            cmd: KCP_CMD_ACK,
            wnd: self.wnd_unused(),
            una: self.rcv_nxt,
            ..Default::default()
        };

        // ACKs; each carries the timestamp of the PUSH it answers.
        let acklist = std::mem::take(&mut self.acklist);
        for (i, &(sn, ts)) in acklist.iter().enumerate() {
            self.make_space(KCP_OVERHEAD);
            // Stale ACKs are elided except the last, which still refreshes una.
            if timediff(sn, self.rcv_nxt) >= 0 || acklist.len() - 1 == i {
                seg.sn = sn;
                seg.ts = ts;
                seg.encode_into(&mut self.buffer);
                Snmp::add(&SNMP.out_segs, 1);
            }
        }

        if ack_only {
            self.flush_buffer();
            return self.interval;
        }

        // A zero remote window gets probed on a doubling backoff.
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = KCP_PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if timediff(current, self.ts_probe) >= 0 {
                if self.probe_wait < KCP_PROBE_INIT {
                    self.probe_wait = KCP_PROBE_INIT;
                }
                self.probe_wait *= 2;
                if self.probe_wait > KCP_PROBE_LIMIT {
                    self.probe_wait = KCP_PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= KCP_ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & KCP_ASK_SEND != 0 {
            seg.cmd = KCP_CMD_WASK;
            self.make_space(KCP_OVERHEAD);
            seg.encode_into(&mut self.buffer);
            Snmp::add(&SNMP.out_segs, 1);
        }
        if self.probe & KCP_ASK_TELL != 0 {
            seg.cmd = KCP_CMD_WINS;
            self.make_space(KCP_OVERHEAD);
            seg.encode_into(&mut self.buffer);
            Snmp::add(&SNMP.out_segs, 1);
        }
        self.probe = 0;

        // Effective window: receiver's advertisement, then congestion.
        let mut cwnd = cmp::min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cmp::min(self.cwnd, cwnd);
        }

        // Admit queued segments while snd_nxt < snd_una + cwnd.
        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            match self.snd_queue.pop_front() {
                Some(mut newseg) => {
                    newseg.conv = self.conv;
                    newseg.cmd = KCP_CMD_PUSH;
                    newseg.sn = self.snd_nxt;
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                    self.snd_buf.push_back(newseg);
                }
                None => break,
            }
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };

        let wnd_unused = self.wnd_unused();
        let rcv_nxt = self.rcv_nxt;
        let mut change = 0u32;
        let mut lost = 0u32;
        let mut fast_retrans = 0u64;
        let mut min_rto = self.interval;

        for i in 0..self.snd_buf.len() {
            let rx_rto = self.rx_rto;
            let nodelay = self.nodelay;
            let segment = &mut self.snd_buf[i];
            let mut needsend = false;

            if segment.xmit == 0 {
                needsend = true;
                segment.rto = rx_rto;
                segment.resendts = current.wrapping_add(segment.rto);
            } else if timediff(current, segment.resendts) >= 0 {
                // Timer expiry; back the per-segment RTO off.
                needsend = true;
                segment.rto += if nodelay { rx_rto / 2 } else { rx_rto };
                segment.resendts = current.wrapping_add(segment.rto);
                lost += 1;
            } else if segment.fastack >= resent {
                needsend = true;
                segment.fastack = 0;
                segment.rto = rx_rto;
                segment.resendts = current.wrapping_add(segment.rto);
                change += 1;
                fast_retrans += 1;
            }

            if needsend {
                segment.xmit += 1;
                segment.ts = current;
                segment.wnd = wnd_unused;
                segment.una = rcv_nxt;
                let hit_dead_link = segment.xmit >= KCP_DEADLINK;
                let need = KCP_OVERHEAD + self.snd_buf[i].data.len();
                self.make_space(need);
                self.snd_buf[i].encode_into(&mut self.buffer);
                Snmp::add(&SNMP.out_segs, 1);
                if hit_dead_link {
                    self.dead_link_hit = true;
                }
            }

            let rto_gap = timediff(self.snd_buf[i].resendts, current);
            if rto_gap > 0 && (rto_gap as u32) < min_rto {
                min_rto = rto_gap as u32;
            }
        }
        self.flush_buffer();

        if lost > 0 {
            Snmp::add(&SNMP.lost_segs, lost as u64);
        }
        if fast_retrans > 0 {
            Snmp::add(&SNMP.fast_retrans_segs, fast_retrans);
        }
        if lost > 0 || fast_retrans > 0 {
            Snmp::add(&SNMP.retrans_segs, lost as u64 + fast_retrans);
            log::trace!(
                "conv {}: {} timeout / {} fast retransmits",
                self.conv,
                lost,
                fast_retrans
            );
        }

        if !self.nocwnd {
            if change > 0 {
                self.ssthresh = cmp::max(self.cwnd / 2, KCP_THRESH_MIN);
                self.cwnd = self.ssthresh + resent;
                self.incr = self.cwnd as usize * self.mss;
            }
            if lost > 0 {
                self.ssthresh = cmp::max(cwnd / 2, KCP_THRESH_MIN);
                self.cwnd = 1;
                self.incr = self.mss;
            }
            if self.cwnd < 1 {
                self.cwnd = 1;
                self.incr = self.mss;
            }
        }

        min_rto
    }

    /// Drives timers; call every 10-100 ms (or whenever `check` says so).
    pub fn update(&mut self, current: u32) {
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10000..10000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush(false, current);
        }
    }

    /// Earliest time `update` has anything to do.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10000..10000).contains(&timediff(current, ts_flush)) {
            ts_flush = current;
        }
        if timediff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = timediff(ts_flush, current);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = timediff(seg.resendts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = cmp::min(tm_packet, diff);
        }

        let minimal = cmp::min(cmp::min(tm_packet, tm_flush) as u32, self.interval);
        current.wrapping_add(minimal)
    }

    #[cfg(test)]
    fn snd_buf_sns(&self) -> Vec<u32> {
        self.snd_buf.iter().map(|s| s.sn).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

    fn capturing_kcp(conv: u32) -> (Kcp, Captured) {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let cap = captured.clone();
        let kcp = Kcp::new(
            conv,
            Box::new(move |data: &[u8]| {
                cap.lock().unwrap().push(data.to_vec());
            }),
        );
        (kcp, captured)
    }

    /// Exchange packets between two cores for a number of 10 ms ticks.
    fn pump(
        a: &mut Kcp,
        a_out: &Captured,
        b: &mut Kcp,
        b_out: &Captured,
        clock: &mut u32,
        rounds: usize,
    ) {
        for _ in 0..rounds {
            *clock += 10;
            a.update(*clock);
            b.update(*clock);
            for pkt in a_out.lock().unwrap().drain(..) {
                b.input(&pkt, true, false, *clock).unwrap();
            }
            for pkt in b_out.lock().unwrap().drain(..) {
                a.input(&pkt, true, false, *clock).unwrap();
            }
        }
    }

    #[test]
    fn wire_format() {
        let (mut kcp, captured) = capturing_kcp(0x12345678);
        kcp.set_nodelay(true, 10, 2, true);
        kcp.send(b"hello").unwrap();
        kcp.update(0);

        let frames = captured.lock().unwrap();
        assert!(!frames.is_empty());
        let frame = &frames[0];
        assert_eq!(frame.len(), KCP_OVERHEAD + 5);

        let conv = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let cmd = frame[4];
        let frg = frame[5];
        let sn = u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]);
        let len = u32::from_le_bytes([frame[20], frame[21], frame[22], frame[23]]);
        assert_eq!(conv, 0x12345678);
        assert_eq!(cmd, KCP_CMD_PUSH);
        assert_eq!(frg, 0);
        assert_eq!(sn, 0);
        assert_eq!(len, 5);
        assert_eq!(&frame[24..], b"hello");
    }

    #[test]
    fn send_recv_roundtrip() {
        let (mut a, a_out) = capturing_kcp(1);
        let (mut b, b_out) = capturing_kcp(1);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        a.send(b"ping across the link").unwrap();
        let mut clock = 0;
        pump(&mut a, &a_out, &mut b, &b_out, &mut clock, 5);

        let size = b.peek_size().expect("message ready");
        let mut buf = vec![0u8; size];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping across the link");
    }

    #[test]
    fn message_mode_fragments_reassemble() {
        let (mut a, a_out) = capturing_kcp(7);
        let (mut b, b_out) = capturing_kcp(7);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);
        a.set_wnd_size(128, 128);
        b.set_wnd_size(128, 128);

        let msg: Vec<u8> = (0..3 * a.mss() + 77).map(|i| (i % 251) as u8).collect();
        a.send(&msg).unwrap();
        let mut clock = 0;
        pump(&mut a, &a_out, &mut b, &b_out, &mut clock, 10);

        let size = b.peek_size().expect("fragmented message ready");
        assert_eq!(size, msg.len());
        let mut buf = vec![0u8; size];
        b.recv(&mut buf).unwrap();
        assert_eq!(buf, msg);
    }

    #[test]
    fn stream_mode_packs_small_writes() {
        let (mut kcp, _captured) = capturing_kcp(2);
        kcp.set_stream(true);
        kcp.send(b"aa").unwrap();
        kcp.send(b"bb").unwrap();
        assert_eq!(kcp.wait_snd(), 1, "stream writes below mss share a segment");
    }

    #[test]
    fn empty_send_emits_nothing() {
        let (mut kcp, captured) = capturing_kcp(3);
        assert_eq!(kcp.send(b"").unwrap(), 0);
        kcp.update(0);
        kcp.update(150);
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn oversize_payload_rejected() {
        let (mut kcp, _captured) = capturing_kcp(4);
        let too_big = vec![0u8; kcp.mss() * 256];
        assert_eq!(kcp.send(&too_big), Err(KcpError::OversizePayload));
    }

    #[test]
    fn recv_buffer_too_small() {
        let (mut a, a_out) = capturing_kcp(5);
        let (mut b, b_out) = capturing_kcp(5);
        a.send(b"0123456789").unwrap();
        let mut clock = 0;
        pump(&mut a, &a_out, &mut b, &b_out, &mut clock, 5);
        let mut tiny = [0u8; 4];
        assert_eq!(b.recv(&mut tiny), Err(KcpError::BufferTooSmall));
    }

    #[test]
    fn malformed_input_rejected() {
        let (mut kcp, _captured) = capturing_kcp(6);
        assert_eq!(
            kcp.input(&[0u8; 10], true, false, 0),
            Err(KcpError::ShortBuffer)
        );

        let mut wrong_conv = [0u8; KCP_OVERHEAD];
        wrong_conv[0..4].copy_from_slice(&99u32.to_le_bytes());
        wrong_conv[4] = KCP_CMD_PUSH;
        assert_eq!(
            kcp.input(&wrong_conv, true, false, 0),
            Err(KcpError::ConvMismatch)
        );

        let mut bad_cmd = [0u8; KCP_OVERHEAD];
        bad_cmd[0..4].copy_from_slice(&6u32.to_le_bytes());
        bad_cmd[4] = 99;
        assert_eq!(
            kcp.input(&bad_cmd, true, false, 0),
            Err(KcpError::UnknownCommand(99))
        );
    }

    #[test]
    fn send_buffer_respects_effective_window() {
        let (mut kcp, _captured) = capturing_kcp(8);
        kcp.set_nodelay(true, 10, 0, true);
        kcp.set_wnd_size(8, 8);
        for _ in 0..64 {
            kcp.send(&[0u8; 100]).unwrap();
        }
        kcp.update(0);
        kcp.update(20);

        // snd_buf sequence numbers stay inside [snd_una, snd_una + wnd).
        let sns = kcp.snd_buf_sns();
        assert!(!sns.is_empty());
        assert!(sns.len() <= 8);
        for sn in sns {
            assert!(timediff(sn, kcp.snd_una) >= 0);
            assert!(timediff(sn, kcp.snd_una.wrapping_add(8)) < 0);
        }
    }

    #[test]
    fn loss_recovered_by_retransmit() {
        let (mut a, a_out) = capturing_kcp(9);
        let (mut b, b_out) = capturing_kcp(9);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);
        a.set_wnd_size(128, 128);
        b.set_wnd_size(128, 128);

        let msg: Vec<u8> = (0..20_000).map(|i| (i % 127) as u8).collect();
        a.send(&msg).unwrap();

        let mut clock = 0;
        let mut drop_counter = 0;
        let mut received = Vec::new();
        for _ in 0..400 {
            clock += 10;
            a.update(clock);
            b.update(clock);
            for pkt in a_out.lock().unwrap().drain(..) {
                drop_counter += 1;
                if drop_counter % 4 == 0 {
                    continue; // 25% loss a->b
                }
                b.input(&pkt, true, false, clock).unwrap();
            }
            for pkt in b_out.lock().unwrap().drain(..) {
                a.input(&pkt, true, false, clock).unwrap();
            }
            while let Some(size) = b.peek_size() {
                let mut buf = vec![0u8; size];
                b.recv(&mut buf).unwrap();
                received.extend_from_slice(&buf);
            }
            if received.len() >= msg.len() {
                break;
            }
        }
        assert_eq!(received, msg, "stream must survive 25% one-way loss");
    }

    #[test]
    fn reordered_input_delivered_in_order() {
        let (mut a, a_out) = capturing_kcp(10);
        let (mut b, b_out) = capturing_kcp(10);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);
        a.set_wnd_size(64, 64);
        b.set_wnd_size(64, 64);

        let msg: Vec<u8> = (0..8000).map(|i| (i % 101) as u8).collect();
        a.send(&msg).unwrap();

        let mut clock = 0;
        let mut received = Vec::new();
        for _ in 0..200 {
            clock += 10;
            a.update(clock);
            b.update(clock);
            let mut pkts: Vec<Vec<u8>> = a_out.lock().unwrap().drain(..).collect();
            pkts.reverse();
            for pkt in pkts {
                b.input(&pkt, true, false, clock).unwrap();
            }
            for pkt in b_out.lock().unwrap().drain(..) {
                a.input(&pkt, true, false, clock).unwrap();
            }
            while let Some(size) = b.peek_size() {
                let mut buf = vec![0u8; size];
                b.recv(&mut buf).unwrap();
                received.extend_from_slice(&buf);
            }
            if received.len() >= msg.len() {
                break;
            }
        }
        assert_eq!(received, msg);
    }

    #[test]
    fn zero_window_triggers_probe() {
        let (mut kcp, captured) = capturing_kcp(11);
        kcp.set_nodelay(true, 10, 0, true);

        // A regular segment advertising wnd=0 freezes the sender.
        let mut wins = [0u8; KCP_OVERHEAD];
        wins[0..4].copy_from_slice(&11u32.to_le_bytes());
        wins[4] = KCP_CMD_WINS;
        wins[6..8].copy_from_slice(&0u16.to_le_bytes());
        kcp.input(&wins, true, false, 0).unwrap();

        // No probe before the initial 7s wait.
        kcp.flush(false, 100);
        captured.lock().unwrap().clear();
        kcp.flush(false, 7200);
        let frames: Vec<Vec<u8>> = captured.lock().unwrap().drain(..).collect();
        assert!(
            frames.iter().any(|f| f[4] == KCP_CMD_WASK),
            "expected a window probe after the initial backoff"
        );

        // Backoff doubles: next probe not before ~14s later.
        kcp.flush(false, 8000);
        assert!(captured.lock().unwrap().is_empty());
        kcp.flush(false, 7200 + 14_500);
        let frames: Vec<Vec<u8>> = captured.lock().unwrap().drain(..).collect();
        assert!(frames.iter().any(|f| f[4] == KCP_CMD_WASK));
    }

    #[test]
    fn wask_answered_with_wins() {
        let (mut kcp, captured) = capturing_kcp(12);
        let mut wask = [0u8; KCP_OVERHEAD];
        wask[0..4].copy_from_slice(&12u32.to_le_bytes());
        wask[4] = KCP_CMD_WASK;
        wask[6..8].copy_from_slice(&32u16.to_le_bytes());
        kcp.input(&wask, true, false, 0).unwrap();
        kcp.flush(false, 10);
        let frames: Vec<Vec<u8>> = captured.lock().unwrap().drain(..).collect();
        assert!(frames.iter().any(|f| f[4] == KCP_CMD_WINS));
    }

    #[test]
    fn duplicate_push_discarded_and_acked() {
        let (mut a, a_out) = capturing_kcp(13);
        let (mut b, b_out) = capturing_kcp(13);
        a.set_nodelay(true, 10, 2, true);
        b.set_nodelay(true, 10, 2, true);

        a.send(b"dup test").unwrap();
        a.update(10);
        let pkts: Vec<Vec<u8>> = a_out.lock().unwrap().drain(..).collect();
        for pkt in &pkts {
            b.input(pkt, true, false, 10).unwrap();
            b.input(pkt, true, false, 10).unwrap(); // duplicate
        }
        let size = b.peek_size().unwrap();
        let mut buf = vec![0u8; size];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"dup test");
        assert!(b.peek_size().is_none(), "duplicate must not deliver twice");

        // ACKs still flow for the duplicate.
        b.update(20);
        let acks: Vec<Vec<u8>> = b_out.lock().unwrap().drain(..).collect();
        assert!(acks.iter().any(|f| f[4] == KCP_CMD_ACK));
    }

    #[test]
    fn rto_backs_off_without_acks() {
        let (mut kcp, captured) = capturing_kcp(14);
        kcp.set_nodelay(false, 10, 0, true);
        kcp.send(b"lonely").unwrap();
        kcp.update(10);
        assert!(!captured.lock().unwrap().is_empty());

        // Nothing acked: the same segment must be retransmitted, spaced by
        // a growing RTO.
        let mut clock = 10;
        let mut xmit_times = Vec::new();
        for _ in 0..600 {
            clock += 10;
            kcp.update(clock);
            for f in captured.lock().unwrap().drain(..) {
                if f[4] == KCP_CMD_PUSH {
                    xmit_times.push(clock);
                }
            }
        }
        assert!(xmit_times.len() >= 3, "expected timeout retransmissions");
        let gap1 = xmit_times[1] - xmit_times[0];
        let gap2 = xmit_times[2] - xmit_times[1];
        assert!(gap2 >= gap1, "rto must not shrink without samples");
    }

    #[test]
    fn fec_recovered_input_does_not_touch_remote_window() {
        let (mut kcp, _captured) = capturing_kcp(15);
        let before = kcp.rmt_wnd;
        let mut push = [0u8; KCP_OVERHEAD + 1];
        push[0..4].copy_from_slice(&15u32.to_le_bytes());
        push[4] = KCP_CMD_PUSH;
        push[6..8].copy_from_slice(&1u16.to_le_bytes()); // advertise wnd=1
        push[20..24].copy_from_slice(&1u32.to_le_bytes());
        push[24] = 0xAB;
        kcp.input(&push, false, false, 0).unwrap();
        assert_eq!(kcp.rmt_wnd, before, "recovered packets must not taint rmt_wnd");
        assert_eq!(kcp.peek_size(), Some(1));
    }

    #[test]
    fn check_schedules_next_update() {
        let (mut kcp, _captured) = capturing_kcp(16);
        kcp.set_nodelay(true, 10, 0, true);
        kcp.update(0);
        let next = kcp.check(5);
        assert!(next >= 5 && next <= 5 + kcp.interval);
    }
}
