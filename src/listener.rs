//! Listener - demultiplexes one carrier across many peer sessions.
//!
//! A monitor thread consumes the receiver queue, decrypts and verifies each
//! datagram, then routes it by peer address. Unknown peers create sessions
//! only while the accept backlog has room and only from packets whose
//! conversation id is actually readable (with FEC enabled, that means data
//! shards; a parity-first arrival creates nothing). The session map lives on
//! the monitor thread alone, so it needs no lock.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};

use crate::crypt::BlockCrypt;
use crate::error::{err_broken_pipe, err_timeout};
use crate::fec::{FEC_HEADER_SIZE_PLUS2, TYPE_DATA};
use crate::kcp::KCP_OVERHEAD;
use crate::pool;
use crate::session::{decrypt_datagram, ListenerHandle, Session, CRYPT_HEADER_SIZE, QLEN};
use crate::snmp::{Snmp, SNMP};
use crate::transport::{IcmpConn, PacketConn, UdpConn};

/// Accept queue bound; when full, datagrams from unknown peers are dropped.
pub const ACCEPT_BACKLOG: usize = 128;

/// Accepts sessions demultiplexed from one shared carrier.
pub struct Listener {
    conn: Arc<dyn PacketConn>,
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    header_size: usize,

    accepts_rx: Receiver<Arc<Session>>,
    die_rx: Receiver<()>,
    die_tx: Mutex<Option<Sender<()>>>,
    rd: Mutex<Option<Instant>>,
}

impl Listener {
    /// Blocks for the next inbound session, honoring the accept deadline.
    pub fn accept(&self) -> io::Result<Arc<Session>> {
        let deadline = match *self.rd.lock().unwrap() {
            Some(t) => at(t),
            None => never(),
        };
        select! {
            recv(self.accepts_rx) -> sess => sess.map_err(|_| err_broken_pipe()),
            recv(deadline) -> _ => Err(err_timeout()),
            recv(self.die_rx) -> _ => Err(err_broken_pipe()),
        }
    }

    /// Stops listening and closes the carrier. Already accepted sessions
    /// keep running (their reads drain; their writes fail with the carrier).
    pub fn close(&self) -> io::Result<()> {
        *self.die_tx.lock().unwrap() = None;
        self.conn.close()
    }

    pub fn addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    /// Deadline for `accept`; `None` disables.
    pub fn set_deadline(&self, t: Option<Instant>) {
        *self.rd.lock().unwrap() = t;
    }

    pub fn set_read_deadline(&self, t: Option<Instant>) {
        *self.rd.lock().unwrap() = t;
    }

    pub fn set_read_buffer(&self, bytes: usize) -> io::Result<()> {
        self.conn.set_read_buffer(bytes)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> io::Result<()> {
        self.conn.set_write_buffer(bytes)
    }

    pub fn set_dscp(&self, dscp: u32) -> io::Result<()> {
        self.conn.set_dscp(dscp)
    }
}

/// Reads the conversation id out of a decrypted datagram, honoring FEC
/// framing. Parity shards hide the id, so they never create sessions.
fn extract_conv(fec_enabled: bool, data: &[u8]) -> Option<u32> {
    if fec_enabled {
        if data.len() < FEC_HEADER_SIZE_PLUS2 + 4 {
            return None;
        }
        if u16::from_le_bytes([data[4], data[5]]) != TYPE_DATA {
            return None;
        }
        Some(u32::from_le_bytes([
            data[FEC_HEADER_SIZE_PLUS2],
            data[FEC_HEADER_SIZE_PLUS2 + 1],
            data[FEC_HEADER_SIZE_PLUS2 + 2],
            data[FEC_HEADER_SIZE_PLUS2 + 3],
        ]))
    } else {
        if data.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }
}

/// The demultiplex loop. Owns the session map; fed by a receiver thread.
fn monitor(
    listener: Arc<Listener>,
    accepts_tx: Sender<Arc<Session>>,
    closed_tx: Sender<SocketAddr>,
    closed_rx: Receiver<SocketAddr>,
) {
    let (pkt_tx, pkt_rx) = bounded::<(Vec<u8>, usize, SocketAddr)>(QLEN);
    {
        let conn = listener.conn.clone();
        let die_rx = listener.die_rx.clone();
        let min_len = listener.header_size + KCP_OVERHEAD;
        thread::spawn(move || loop {
            let mut buf = pool::get();
            match conn.read_from(&mut buf) {
                Ok((n, from)) if n >= min_len => {
                    select! {
                        send(pkt_tx, (buf, n, from)) -> result => {
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
                Err(_) => return,
            }
        });
    }

    let mut sessions: HashMap<SocketAddr, Arc<Session>> = HashMap::new();
    // Packets from one peer arrive in bursts; remember the last hit to skip
    // the map on the common path.
    let mut last_addr: Option<SocketAddr> = None;
    let mut last_session: Option<Arc<Session>> = None;

    loop {
        select! {
            recv(pkt_rx) -> msg => {
                let Ok((mut buf, n, from)) = msg else { return };
                if let Some(payload) = decrypt_datagram(&listener.block, &mut buf[..n]) {
                    let cached = if last_addr == Some(from) {
                        last_session.clone()
                    } else if let Some(sess) = sessions.get(&from) {
                        last_addr = Some(from);
                        last_session = Some(sess.clone());
                        last_session.clone()
                    } else {
                        None
                    };

                    match cached {
                        Some(sess) => sess.kcp_input(payload),
                        None => {
                            // Admission: only while the backlog has room, and
                            // only if the conversation id is visible.
                            if accepts_tx.len() < ACCEPT_BACKLOG {
                                if let Some(conv) =
                                    extract_conv(listener.data_shards > 0, payload)
                                {
                                    let handle = ListenerHandle {
                                        session_closed_tx: closed_tx.clone(),
                                        die_rx: listener.die_rx.clone(),
                                    };
                                    match Session::new(
                                        conv,
                                        listener.data_shards,
                                        listener.parity_shards,
                                        Some(handle),
                                        listener.conn.clone(),
                                        from,
                                        listener.block.clone(),
                                    ) {
                                        Ok(sess) => {
                                            sess.kcp_input(payload);
                                            sessions.insert(from, sess.clone());
                                            let _ = accepts_tx.try_send(sess);
                                        }
                                        Err(e) => {
                                            log::warn!("session setup for {} failed: {}", from, e);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                pool::put(buf);
            }
            recv(closed_rx) -> addr => {
                if let Ok(addr) = addr {
                    if last_addr == Some(addr) {
                        last_addr = None;
                        last_session = None;
                    }
                    sessions.remove(&addr);
                }
            }
            recv(listener.die_rx) -> _ => return,
        }
    }
}

/// Serves sessions over an arbitrary carrier.
pub fn serve_conn(
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    conn: Arc<dyn PacketConn>,
) -> io::Result<Arc<Listener>> {
    if data_shards == 0 && parity_shards > 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "parity shards require data shards",
        ));
    }

    let mut header_size = 0;
    if block.is_some() {
        header_size += CRYPT_HEADER_SIZE;
    }
    if data_shards > 0 {
        header_size += FEC_HEADER_SIZE_PLUS2;
    }

    let (accepts_tx, accepts_rx) = bounded::<Arc<Session>>(ACCEPT_BACKLOG);
    let (closed_tx, closed_rx) = bounded::<SocketAddr>(0);
    let (die_tx, die_rx) = bounded::<()>(0);

    let listener = Arc::new(Listener {
        conn,
        block,
        data_shards,
        parity_shards,
        header_size,
        accepts_rx,
        die_rx,
        die_tx: Mutex::new(Some(die_tx)),
        rd: Mutex::new(None),
    });

    let monitored = listener.clone();
    thread::spawn(move || monitor(monitored, accepts_tx, closed_tx, closed_rx));
    Ok(listener)
}

/// Listens on a UDP address.
pub fn listen_udp(
    laddr: &str,
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
) -> io::Result<Arc<Listener>> {
    let conn = Arc::new(UdpConn::bind(laddr)?);
    serve_conn(block, data_shards, parity_shards, conn)
}

/// Listens for ICMP echo traffic. Servers normally pass `send_replies=true`
/// so their half of the tunnel looks like ping responses.
pub fn listen_with_options(
    block: Option<Arc<dyn BlockCrypt>>,
    data_shards: usize,
    parity_shards: usize,
    send_replies: bool,
    dev: &str,
) -> io::Result<Arc<Listener>> {
    let conn = Arc::new(IcmpConn::open(None, send_replies, dev)?);
    serve_conn(block, data_shards, parity_shards, conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::AesBlockCrypt;
    use crate::session::dial_udp;
    use crate::transport::MTU_LIMIT;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast(sess: &Arc<Session>) {
        sess.set_nodelay(true, 10, 2, true);
        sess.set_window_size(256, 256);
        sess.set_stream_mode(true);
    }

    /// Accepts one session and echoes exactly `total` bytes back.
    fn echo_server(listener: Arc<Listener>, total: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let sess = listener.accept().unwrap();
            fast(&sess);
            sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(10)));
            let mut buf = vec![0u8; 65536];
            let mut echoed = 0;
            while echoed < total {
                match sess.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        sess.write(&buf[..n]).unwrap();
                        echoed += n;
                    }
                    _ => break,
                }
            }
        })
    }

    #[test]
    fn dial_accept_echo() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let server = echo_server(listener.clone(), 14);

        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();
        fast(&client);
        client.write(b"hello over kcp").unwrap();

        let mut buf = [0u8; 256];
        let mut got = Vec::new();
        client.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        while got.len() < 14 {
            let n = client.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"hello over kcp");

        client.close().unwrap();
        listener.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn bulk_transfer_with_crypto_and_fec() {
        let block: Arc<dyn BlockCrypt> = Arc::new(AesBlockCrypt::new(&[3u8; 32]).unwrap());
        let listener = listen_udp("127.0.0.1:0", Some(block.clone()), 10, 3).unwrap();
        let addr = listener.addr().unwrap();

        let total = 256 * 1024;
        let reader = {
            let listener = listener.clone();
            thread::spawn(move || {
                let sess = listener.accept().unwrap();
                fast(&sess);
                let mut received = Vec::with_capacity(total);
                let mut buf = vec![0u8; 65536];
                sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(30)));
                while received.len() < total {
                    let n = sess.read(&mut buf).unwrap();
                    received.extend_from_slice(&buf[..n]);
                }
                received
            })
        };

        let client = dial_udp(&addr.to_string(), Some(block), 10, 3).unwrap();
        fast(&client);
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(16 * 1024) {
            client.write(chunk).unwrap();
        }

        let received = reader.join().unwrap();
        assert_eq!(received.len(), total);
        assert_eq!(received, data, "bulk stream must arrive byte-identical");

        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn read_deadline_returns_timeout() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();

        let start = Instant::now();
        client.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let err = client.read(&mut [0u8; 16]).unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(elapsed >= Duration::from_millis(90), "early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "late: {:?}", elapsed);

        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn close_during_read_returns_broken_pipe() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();

        let reader = {
            let client = client.clone();
            thread::spawn(move || client.read(&mut [0u8; 16]))
        };
        thread::sleep(Duration::from_millis(100));
        client.close().unwrap();

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // Second close also fails with broken pipe.
        assert_eq!(client.close().unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        listener.close().unwrap();
    }

    #[test]
    fn accept_deadline_times_out() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        listener.set_deadline(Some(Instant::now() + Duration::from_millis(80)));
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        listener.close().unwrap();
    }

    #[test]
    fn corrupted_datagrams_counted_not_accepted() {
        let block: Arc<dyn BlockCrypt> = Arc::new(AesBlockCrypt::new(&[9u8; 16]).unwrap());
        let listener = listen_udp("127.0.0.1:0", Some(block), 0, 0).unwrap();
        let addr = listener.addr().unwrap();

        let before = SNMP.snapshot().in_csum_errors;
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        // Garbage long enough to clear the length gate; CRC cannot match.
        sock.send_to(&[0x5a; 128], addr).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(SNMP.snapshot().in_csum_errors > before);

        listener.set_deadline(Some(Instant::now() + Duration::from_millis(50)));
        assert!(listener.accept().is_err(), "garbage must not create sessions");
        listener.close().unwrap();
    }

    #[test]
    fn parity_first_arrival_creates_no_session() {
        // With FEC enabled, a leading parity shard hides the conv id.
        let listener = listen_udp("127.0.0.1:0", None, 2, 1).unwrap();
        let addr = listener.addr().unwrap();

        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut shard = vec![0u8; 64];
        shard[0..4].copy_from_slice(&7u32.to_le_bytes());
        shard[4..6].copy_from_slice(&crate::fec::TYPE_FEC.to_le_bytes());
        sock.send_to(&shard, addr).unwrap();

        listener.set_deadline(Some(Instant::now() + Duration::from_millis(150)));
        assert!(listener.accept().is_err());
        listener.close().unwrap();
    }

    /// Carrier that silently swallows a fixed slice of outbound datagrams.
    struct LossyConn {
        inner: UdpConn,
        counter: AtomicUsize,
        drop_every: usize,
    }

    impl PacketConn for LossyConn {
        fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.inner.read_from(buf)
        }

        fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            let i = self.counter.fetch_add(1, Ordering::Relaxed);
            if i % self.drop_every == self.drop_every - 1 {
                return Ok(buf.len()); // dropped on the floor
            }
            self.inner.write_to(buf, addr)
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        fn close(&self) -> io::Result<()> {
            self.inner.close()
        }
    }

    #[test]
    fn fec_recovers_dropped_datagrams() {
        let listener = listen_udp("127.0.0.1:0", None, 4, 2).unwrap();
        let addr = listener.addr().unwrap();

        let total = 64 * 1024;
        let reader = {
            let listener = listener.clone();
            thread::spawn(move || {
                let sess = listener.accept().unwrap();
                fast(&sess);
                let mut received = Vec::with_capacity(total);
                let mut buf = vec![0u8; 65536];
                sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(30)));
                while received.len() < total {
                    let n = sess.read(&mut buf).unwrap();
                    received.extend_from_slice(&buf[..n]);
                }
                received
            })
        };

        // Drop every 7th outbound datagram; each (4,2) group tolerates two.
        let lossy = Arc::new(LossyConn {
            inner: UdpConn::from_socket(std::net::UdpSocket::bind("127.0.0.1:0").unwrap())
                .unwrap(),
            counter: AtomicUsize::new(0),
            drop_every: 7,
        });
        let before = SNMP.snapshot().fec_recovered;
        let client = crate::session::new_conn(addr, None, 4, 2, lossy).unwrap();
        fast(&client);

        let data: Vec<u8> = (0..total).map(|i| (i % 199) as u8).collect();
        for chunk in data.chunks(8 * 1024) {
            client.write(chunk).unwrap();
        }

        let received = reader.join().unwrap();
        assert_eq!(received, data);
        assert!(
            SNMP.snapshot().fec_recovered > before,
            "recovery must have used parity"
        );

        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn session_counters_balance() {
        let before = SNMP.snapshot();
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();
        client.write(b"x").unwrap();

        let sess = {
            listener.set_deadline(Some(Instant::now() + Duration::from_secs(5)));
            listener.accept().unwrap()
        };
        let mid = SNMP.snapshot();
        assert!(mid.active_opens > before.active_opens);
        assert!(mid.passive_opens > before.passive_opens);

        sess.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn accepted_session_refuses_socket_options() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();
        client.write(b"x").unwrap();

        listener.set_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let sess = listener.accept().unwrap();
        assert_eq!(
            sess.set_dscp(10).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        assert_eq!(
            sess.set_read_buffer(4096).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        // The dialer owns its carrier, so the same calls succeed there.
        client.set_read_buffer(64 * 1024).unwrap();
        client.set_dscp(10).unwrap();

        sess.close().unwrap();
        client.close().unwrap();
        listener.close().unwrap();
    }

    #[test]
    fn oversized_mtu_rejected() {
        let listener = listen_udp("127.0.0.1:0", None, 0, 0).unwrap();
        let addr = listener.addr().unwrap();
        let client = dial_udp(&addr.to_string(), None, 0, 0).unwrap();

        assert!(client.set_mtu(MTU_LIMIT + 1).is_err());
        assert!(client.set_mtu(10).is_err());
        client.set_mtu(1400).unwrap();

        client.close().unwrap();
        listener.close().unwrap();
    }
}
