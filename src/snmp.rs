//! Transport statistics.
//!
//! One process-wide table of monotonically increasing counters, incremented
//! with relaxed atomics from every task that touches a packet. `CurrEstab` is
//! the only gauge (sessions decrement it on close).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter registry, the observability surface of the transport.
pub struct Snmp {
    /// Bytes accepted from callers by `write`.
    pub bytes_sent: AtomicU64,
    /// Bytes handed to callers by `read`.
    pub bytes_received: AtomicU64,
    /// Peak concurrent established sessions.
    pub max_conn: AtomicU64,
    /// Client sessions opened by dialing out.
    pub active_opens: AtomicU64,
    /// Server sessions created by the listener.
    pub passive_opens: AtomicU64,
    /// Currently established sessions.
    pub curr_estab: AtomicU64,
    /// Malformed or undersized datagrams dropped before KCP.
    pub in_errs: AtomicU64,
    /// Datagrams dropped on CRC32 mismatch.
    pub in_csum_errors: AtomicU64,
    /// KCP input rejections (bad framing inside a valid datagram).
    pub kcp_in_errors: AtomicU64,
    /// Datagrams received.
    pub in_pkts: AtomicU64,
    /// Datagrams sent.
    pub out_pkts: AtomicU64,
    /// KCP segments received.
    pub in_segs: AtomicU64,
    /// KCP segments sent.
    pub out_segs: AtomicU64,
    /// Datagram bytes received.
    pub in_bytes: AtomicU64,
    /// Datagram bytes sent.
    pub out_bytes: AtomicU64,
    /// Duplicate PUSH segments discarded.
    pub repeat_segs: AtomicU64,
    /// Data shards rebuilt by FEC.
    pub fec_recovered: AtomicU64,
    /// Recovered shards with inconsistent embedded length.
    pub fec_errs: AtomicU64,
    /// Parity shards received.
    pub fec_parity_shards: AtomicU64,
    /// Segments retransmitted (any cause).
    pub retrans_segs: AtomicU64,
    /// Segments retransmitted on timer expiry.
    pub lost_segs: AtomicU64,
    /// Segments retransmitted via duplicate-ACK fast path.
    pub fast_retrans_segs: AtomicU64,
}

impl Snmp {
    const fn new() -> Self {
        Snmp {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            max_conn: AtomicU64::new(0),
            active_opens: AtomicU64::new(0),
            passive_opens: AtomicU64::new(0),
            curr_estab: AtomicU64::new(0),
            in_errs: AtomicU64::new(0),
            in_csum_errors: AtomicU64::new(0),
            kcp_in_errors: AtomicU64::new(0),
            in_pkts: AtomicU64::new(0),
            out_pkts: AtomicU64::new(0),
            in_segs: AtomicU64::new(0),
            out_segs: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            repeat_segs: AtomicU64::new(0),
            fec_recovered: AtomicU64::new(0),
            fec_errs: AtomicU64::new(0),
            fec_parity_shards: AtomicU64::new(0),
            retrans_segs: AtomicU64::new(0),
            lost_segs: AtomicU64::new(0),
            fast_retrans_segs: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Records a newly established session and tracks the peak.
    pub(crate) fn session_opened(&self, passive: bool) {
        if passive {
            Self::add(&self.passive_opens, 1);
        } else {
            Self::add(&self.active_opens, 1);
        }
        let estab = self.curr_estab.fetch_add(1, Ordering::Relaxed) + 1;
        let mut peak = self.max_conn.load(Ordering::Relaxed);
        while estab > peak {
            match self.max_conn.compare_exchange_weak(
                peak,
                estab,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => peak = cur,
            }
        }
    }

    pub(crate) fn session_closed(&self) {
        self.curr_estab.fetch_sub(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> SnmpSnapshot {
        SnmpSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            max_conn: self.max_conn.load(Ordering::Relaxed),
            active_opens: self.active_opens.load(Ordering::Relaxed),
            passive_opens: self.passive_opens.load(Ordering::Relaxed),
            curr_estab: self.curr_estab.load(Ordering::Relaxed),
            in_errs: self.in_errs.load(Ordering::Relaxed),
            in_csum_errors: self.in_csum_errors.load(Ordering::Relaxed),
            kcp_in_errors: self.kcp_in_errors.load(Ordering::Relaxed),
            in_pkts: self.in_pkts.load(Ordering::Relaxed),
            out_pkts: self.out_pkts.load(Ordering::Relaxed),
            in_segs: self.in_segs.load(Ordering::Relaxed),
            out_segs: self.out_segs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            repeat_segs: self.repeat_segs.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            fec_errs: self.fec_errs.load(Ordering::Relaxed),
            fec_parity_shards: self.fec_parity_shards.load(Ordering::Relaxed),
            retrans_segs: self.retrans_segs.load(Ordering::Relaxed),
            lost_segs: self.lost_segs.load(Ordering::Relaxed),
            fast_retrans_segs: self.fast_retrans_segs.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data copy of [`Snmp`] produced by [`Snmp::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnmpSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub max_conn: u64,
    pub active_opens: u64,
    pub passive_opens: u64,
    pub curr_estab: u64,
    pub in_errs: u64,
    pub in_csum_errors: u64,
    pub kcp_in_errors: u64,
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub in_segs: u64,
    pub out_segs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub repeat_segs: u64,
    pub fec_recovered: u64,
    pub fec_errs: u64,
    pub fec_parity_shards: u64,
    pub retrans_segs: u64,
    pub lost_segs: u64,
    pub fast_retrans_segs: u64,
}

impl SnmpSnapshot {
    /// Counter deltas since `earlier`, saturating on regressions.
    pub fn delta(&self, earlier: &SnmpSnapshot) -> SnmpSnapshot {
        SnmpSnapshot {
            bytes_sent: self.bytes_sent.saturating_sub(earlier.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(earlier.bytes_received),
            max_conn: self.max_conn,
            active_opens: self.active_opens.saturating_sub(earlier.active_opens),
            passive_opens: self.passive_opens.saturating_sub(earlier.passive_opens),
            curr_estab: self.curr_estab,
            in_errs: self.in_errs.saturating_sub(earlier.in_errs),
            in_csum_errors: self.in_csum_errors.saturating_sub(earlier.in_csum_errors),
            kcp_in_errors: self.kcp_in_errors.saturating_sub(earlier.kcp_in_errors),
            in_pkts: self.in_pkts.saturating_sub(earlier.in_pkts),
            out_pkts: self.out_pkts.saturating_sub(earlier.out_pkts),
            in_segs: self.in_segs.saturating_sub(earlier.in_segs),
            out_segs: self.out_segs.saturating_sub(earlier.out_segs),
            in_bytes: self.in_bytes.saturating_sub(earlier.in_bytes),
            out_bytes: self.out_bytes.saturating_sub(earlier.out_bytes),
            repeat_segs: self.repeat_segs.saturating_sub(earlier.repeat_segs),
            fec_recovered: self.fec_recovered.saturating_sub(earlier.fec_recovered),
            fec_errs: self.fec_errs.saturating_sub(earlier.fec_errs),
            fec_parity_shards: self
                .fec_parity_shards
                .saturating_sub(earlier.fec_parity_shards),
            retrans_segs: self.retrans_segs.saturating_sub(earlier.retrans_segs),
            lost_segs: self.lost_segs.saturating_sub(earlier.lost_segs),
            fast_retrans_segs: self
                .fast_retrans_segs
                .saturating_sub(earlier.fast_retrans_segs),
        }
    }
}

/// The process-wide statistics table.
pub static SNMP: Snmp = Snmp::new();
