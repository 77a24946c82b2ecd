//! Process-wide packet buffer pool.
//!
//! Receive paths and the FEC encoder churn through MTU-sized buffers at
//! datagram rate; recycling them through one shared free list keeps the hot
//! path free of allocator traffic. The pool only amortizes allocation: a
//! buffer handed out may contain stale bytes, and nothing here depends on
//! contents. Callers track the valid length themselves.

use std::sync::Mutex;

use crate::transport::MTU_LIMIT;

/// Retain at most this many idle buffers; beyond that, drop to the allocator.
const MAX_IDLE: usize = 512;

static FREE_LIST: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Fetch a buffer of length [`MTU_LIMIT`].
pub fn get() -> Vec<u8> {
    if let Some(buf) = FREE_LIST.lock().unwrap().pop() {
        return buf;
    }
    vec![0u8; MTU_LIMIT]
}

/// Return a buffer previously obtained from [`get`].
///
/// Buffers that were shrunk or grown by the caller are restored to full
/// length before being reused.
pub fn put(mut buf: Vec<u8>) {
    if buf.capacity() < MTU_LIMIT {
        return;
    }
    buf.resize(MTU_LIMIT, 0);
    let mut free = FREE_LIST.lock().unwrap();
    if free.len() < MAX_IDLE {
        free.push(buf);
    }
}
