//! echostream - reliable, ordered byte streams over ICMP echo or UDP.
//!
//! Three mechanisms stack on an unreliable datagram carrier:
//! - `kcp`: an ARQ core providing loss recovery, ordering and flow control
//! - `fec`: Reed-Solomon forward error correction across datagram groups
//! - `crypt`: whole-datagram block encryption with a per-packet nonce and a
//!   CRC32 integrity tag
//!
//! Sessions expose blocking `read`/`write` with deadlines; a listener
//! demultiplexes one carrier across many peers. The ICMP carrier dresses the
//! traffic as echo request/reply pairs, UDP is the plain alternative.
//!
//! # Example
//!
//! ```rust,ignore
//! use echostream::{dial_udp, listen_udp};
//!
//! let listener = listen_udp("0.0.0.0:4000", None, 10, 3)?;
//! std::thread::spawn(move || {
//!     let session = listener.accept()?;
//!     // session.read(..) / session.write(..)
//! });
//!
//! let client = dial_udp("127.0.0.1:4000", None, 10, 3)?;
//! client.write(b"hello")?;
//! ```

pub mod crypt;
pub mod entropy;
pub mod error;
pub mod fec;
pub mod kcp;
pub mod listener;
pub mod pool;
pub mod session;
pub mod snmp;
pub mod transport;
mod updater;

pub use crypt::{AesBlockCrypt, BlockCrypt, XorBlockCrypt};
pub use entropy::NonceAes128;
pub use error::{CryptError, FecError, KcpError};
pub use kcp::{Kcp, KCP_MTU_DEF, KCP_OVERHEAD};
pub use listener::{listen_udp, listen_with_options, serve_conn, Listener, ACCEPT_BACKLOG};
pub use session::{dial_udp, dial_with_options, new_conn, Session};
pub use snmp::{Snmp, SnmpSnapshot, SNMP};
pub use transport::{IcmpConn, PacketConn, UdpConn, ICMP_ECHO_ID, MTU_LIMIT};
