//! Forward error correction for datagram loss resilience.
//!
//! Every FEC-participating datagram carries a 6-byte header after the crypto
//! header: a per-session shard sequence number and a type flag. `data` shards
//! in a row are followed by `parity` shards computed with Reed-Solomon over
//! the zero-padded shard bytes; any `data`-sized subset of the group rebuilds
//! the originals without a retransmit.
//!
//! ## Wire format
//!
//! ```text
//! [seq: u32 LE][flag: u16 LE][payload...]
//! ```
//!
//! - flag: `TYPE_DATA` (0xf1) or `TYPE_FEC` (0xf2)
//! - data shards lead their payload with a big-endian u16 length (counting
//!   the length field itself), so variable-length shards survive the
//!   zero-padding that parity math requires
//!
//! The decoder only resurrects lost datagrams; segment ordering is the ARQ
//! core's job.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::FecError;
use crate::kcp::timediff;

/// FEC header: seq(4) + flag(2).
pub const FEC_HEADER_SIZE: usize = 6;

/// FEC header plus the data-shard length prefix.
pub const FEC_HEADER_SIZE_PLUS2: usize = FEC_HEADER_SIZE + 2;

/// Flag value of a data shard.
pub const TYPE_DATA: u16 = 0xf1;

/// Flag value of a parity shard.
pub const TYPE_FEC: u16 = 0xf2;

/// The decoder buffers `RX_FEC_MULTI * (data + parity)` shards.
pub const RX_FEC_MULTI: usize = 3;

/// A decoded shard: header fields plus everything after the FEC header.
#[derive(Debug, Clone)]
pub struct FecPacket {
    pub seq: u32,
    pub flag: u16,
    pub data: Vec<u8>,
}

impl FecPacket {
    /// Splits a datagram (crypto header already stripped) into a shard.
    /// The caller has verified `data.len() > FEC_HEADER_SIZE`.
    pub fn parse(data: &[u8]) -> FecPacket {
        FecPacket {
            seq: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            flag: u16::from_le_bytes([data[4], data[5]]),
            data: data[FEC_HEADER_SIZE..].to_vec(),
        }
    }
}

fn validate_shards(data_shards: usize, parity_shards: usize) -> Result<(), FecError> {
    let invalid = FecError::InvalidShards {
        data: data_shards,
        parity: parity_shards,
    };
    if data_shards == 0 || data_shards + parity_shards > 255 {
        return Err(invalid);
    }
    Ok(())
}

fn build_codec(data_shards: usize, parity_shards: usize) -> Result<Option<ReedSolomon>, FecError> {
    validate_shards(data_shards, parity_shards)?;
    if parity_shards == 0 {
        // Header-only mode: nothing to compute, nothing to recover.
        return Ok(None);
    }
    ReedSolomon::new(data_shards, parity_shards)
        .map(Some)
        .map_err(|_| FecError::InvalidShards {
            data: data_shards,
            parity: parity_shards,
        })
}

// =============================================================================
// Encoder
// =============================================================================

/// Accumulates outgoing datagrams into shard groups and emits parity.
///
/// `encode` stamps the FEC header and length prefix directly into the
/// caller's buffer; on every `data_shards`-th call it returns freshly
/// allocated parity datagrams whose sequence numbers continue the group.
pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    shard_size: usize,
    /// Largest sequence multiple of the group size; `next` wraps here so
    /// groups stay aligned across the u32 boundary.
    paws: u32,
    next: u32,

    shard_count: usize,
    max_size: usize,

    /// Bytes reserved ahead of the FEC header (the crypto header).
    header_offset: usize,
    /// Where shard payload (and the parity math) begins.
    payload_offset: usize,

    shard_cache: Vec<Vec<u8>>,
    codec: Option<ReedSolomon>,
}

impl FecEncoder {
    pub fn new(
        data_shards: usize,
        parity_shards: usize,
        header_offset: usize,
    ) -> Result<Self, FecError> {
        let codec = build_codec(data_shards, parity_shards)?;
        let shard_size = data_shards + parity_shards;
        Ok(FecEncoder {
            data_shards,
            parity_shards,
            shard_size,
            paws: (u32::MAX / shard_size as u32) * shard_size as u32,
            next: 0,
            shard_count: 0,
            max_size: 0,
            header_offset,
            payload_offset: header_offset + FEC_HEADER_SIZE,
            shard_cache: vec![Vec::new(); shard_size],
            codec,
        })
    }

    /// Stamps `b` as the next data shard and returns the group's parity
    /// datagrams when this call completes a group.
    ///
    /// `b` is a whole outgoing datagram: `header_offset` reserved bytes, the
    /// 8-byte FEC region, then the ARQ frame.
    pub fn encode(&mut self, b: &mut [u8]) -> Vec<Vec<u8>> {
        let header_offset = self.header_offset;
        let payload_offset = self.payload_offset;

        self.mark_data(&mut b[header_offset..]);
        let sz = (b.len() - payload_offset) as u16;
        b[payload_offset..payload_offset + 2].copy_from_slice(&sz.to_be_bytes());

        if self.parity_shards == 0 {
            return Vec::new();
        }

        let slot = &mut self.shard_cache[self.shard_count];
        slot.clear();
        slot.extend_from_slice(b);
        self.shard_count += 1;
        self.max_size = self.max_size.max(b.len());

        if self.shard_count < self.data_shards {
            return Vec::new();
        }

        // Group complete: zero-pad everything to the longest shard and run
        // the codec over the payload region.
        let max_size = self.max_size;
        for shard in self.shard_cache.iter_mut() {
            shard.resize(max_size, 0);
        }
        let (data, parity) = self.shard_cache.split_at_mut(self.data_shards);
        let data_views: Vec<&[u8]> = data.iter().map(|d| &d[payload_offset..]).collect();
        let mut parity_views: Vec<&mut [u8]> = parity
            .iter_mut()
            .map(|p| &mut p[payload_offset..])
            .collect();

        let mut out = Vec::new();
        let encoded = match &self.codec {
            Some(codec) => codec.encode_sep(&data_views, &mut parity_views).is_ok(),
            None => false,
        };
        if encoded {
            for i in self.data_shards..self.shard_size {
                let mut p = self.shard_cache[i].clone();
                self.mark_parity(&mut p[header_offset..]);
                out.push(p);
            }
        }

        self.shard_count = 0;
        self.max_size = 0;
        for parity in &mut self.shard_cache[self.data_shards..] {
            parity.clear();
        }
        out
    }

    fn mark_data(&mut self, hdr: &mut [u8]) {
        hdr[0..4].copy_from_slice(&self.next.to_le_bytes());
        hdr[4..6].copy_from_slice(&TYPE_DATA.to_le_bytes());
        self.next = self.next.wrapping_add(1);
    }

    fn mark_parity(&mut self, hdr: &mut [u8]) {
        hdr[0..4].copy_from_slice(&self.next.to_le_bytes());
        hdr[4..6].copy_from_slice(&TYPE_FEC.to_le_bytes());
        self.next = (self.next + 1) % self.paws;
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Reassembles shard groups from whatever subset of each group arrives.
///
/// Shards sit in one window ordered by sequence number. As soon as a group
/// holds `data_shards` members (any mix of data and parity) the missing data
/// shards are reconstructed and the group is released; the window evicts its
/// oldest shard once `rx_limit` is exceeded, resolved or not.
pub struct FecDecoder {
    rx_limit: usize,
    data_shards: usize,
    shard_size: usize,

    rx: Vec<FecPacket>,
    codec: Option<ReedSolomon>,
}

impl FecDecoder {
    pub fn new(
        rx_limit: usize,
        data_shards: usize,
        parity_shards: usize,
    ) -> Result<Self, FecError> {
        let codec = build_codec(data_shards, parity_shards)?;
        Ok(FecDecoder {
            rx_limit,
            data_shards,
            shard_size: data_shards + parity_shards,
            rx: Vec::new(),
            codec,
        })
    }

    /// Absorbs one shard and returns any data shards recovered by it.
    ///
    /// Recovered buffers are full padded shards; the leading big-endian
    /// length prefix tells the caller how much of each is real.
    pub fn decode(&mut self, pkt: FecPacket) -> Vec<Vec<u8>> {
        let mut recovered = Vec::new();

        // Ordered insert, scanning from the tail (in-order arrival is the
        // common case).
        let mut insert_idx = 0;
        for i in (0..self.rx.len()).rev() {
            if pkt.seq == self.rx[i].seq {
                return recovered;
            }
            if timediff(pkt.seq, self.rx[i].seq) > 0 {
                insert_idx = i + 1;
                break;
            }
        }
        let pkt_seq = pkt.seq;
        self.rx.insert(insert_idx, pkt);

        let shard_size = self.shard_size as u32;
        let shard_begin = pkt_seq - pkt_seq % shard_size;
        let shard_end = shard_begin + shard_size - 1;

        // The group's members can only sit within shard_size slots around the
        // insertion point.
        let search_begin = insert_idx.saturating_sub((pkt_seq % shard_size) as usize);
        let search_end = (search_begin + self.shard_size - 1).min(self.rx.len() - 1);

        if search_end - search_begin + 1 >= self.data_shards {
            let mut num_shard = 0;
            let mut num_data_shard = 0;
            let mut first = 0;
            let mut max_len = 0;
            let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.shard_size];

            for i in search_begin..=search_end {
                let seq = self.rx[i].seq;
                if timediff(seq, shard_end) > 0 {
                    break;
                }
                if timediff(seq, shard_begin) >= 0 {
                    shards[(seq % shard_size) as usize] = Some(self.rx[i].data.clone());
                    if self.rx[i].flag == TYPE_DATA {
                        num_data_shard += 1;
                    }
                    if num_shard == 0 {
                        first = i;
                    }
                    num_shard += 1;
                    max_len = max_len.max(self.rx[i].data.len());
                }
            }

            if num_data_shard == self.data_shards {
                // Nothing missing; just release the group.
                self.rx.drain(first..first + num_shard);
            } else if num_shard >= self.data_shards {
                if let Some(codec) = &self.codec {
                    let present: Vec<bool> = shards.iter().map(Option::is_some).collect();
                    for shard in shards.iter_mut().flatten() {
                        shard.resize(max_len, 0);
                    }
                    if codec.reconstruct_data(&mut shards).is_ok() {
                        for (k, was_present) in present.iter().enumerate().take(self.data_shards) {
                            if !was_present {
                                if let Some(shard) = shards[k].take() {
                                    recovered.push(shard);
                                }
                            }
                        }
                    }
                }
                self.rx.drain(first..first + num_shard);
            }
        }

        if self.rx.len() > self.rx_limit {
            self.rx.remove(0);
        }
        recovered
    }
}
