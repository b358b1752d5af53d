//! Copy/insert binary delta codec
//!
//! A delta encodes a target byte sequence against a base. Wire layout:
//!
//! - varint target length
//! - command stream:
//!   - `0x00` copy: varint base offset, varint length
//!   - `0x01` insert: varint length, raw bytes
//! - `0x02` trailer: big-endian u32 checksum of the full target
//!
//! [`apply`] walks the commands, emits bytes, and verifies both the
//! declared length and the checksum before returning. [`compute`] is a
//! block-match generator; whether a delta is worth storing at all is the
//! caller's policy.

use bytes::Buf;
use std::collections::HashMap;
use thiserror::Error;

const OP_COPY: u8 = 0x00;
const OP_INSERT: u8 = 0x01;
const OP_END: u8 = 0x02;

/// Match granularity for [`compute`].
const BLOCK: usize = 16;

/// Candidate offsets examined per block before settling on the best.
const MAX_CANDIDATES: usize = 8;

/// Upper bound on a declared target size; guards hostile headers.
const MAX_TARGET: u64 = 1 << 31;

/// Delta codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,
    #[error("unknown delta command {0:#04x}")]
    BadCommand(u8),
    #[error("copy range outside base")]
    CopyOutOfRange,
    #[error("declared target size {0} too large")]
    TooLarge(u64),
    #[error("output length {got} != declared {want}")]
    LengthMismatch { got: u64, want: u64 },
    #[error("target checksum mismatch")]
    ChecksumMismatch,
    #[error("bytes after delta trailer")]
    TrailingBytes,
}

/// Big-endian word sum over `data`, the integrity trailer of a delta.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(4);
    for c in &mut chunks {
        sum = sum.wrapping_add(u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        sum = sum.wrapping_add(u32::from_be_bytes(last));
    }
    sum
}

fn read_varint(buf: &mut impl Buf) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(DeltaError::Truncated);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(DeltaError::TooLarge(u64::MAX));
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reconstruct the target from `base` and `delta`.
pub fn apply(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut buf = delta;
    let target_len = read_varint(&mut buf)?;
    if target_len > MAX_TARGET {
        return Err(DeltaError::TooLarge(target_len));
    }
    let mut out = Vec::with_capacity(target_len.min(1 << 20) as usize);
    loop {
        if !buf.has_remaining() {
            return Err(DeltaError::Truncated);
        }
        match buf.get_u8() {
            OP_COPY => {
                let offset = read_varint(&mut buf)? as usize;
                let len = read_varint(&mut buf)? as usize;
                let end = offset.checked_add(len).ok_or(DeltaError::CopyOutOfRange)?;
                if end > base.len() {
                    return Err(DeltaError::CopyOutOfRange);
                }
                out.extend_from_slice(&base[offset..end]);
            }
            OP_INSERT => {
                let len = read_varint(&mut buf)? as usize;
                if buf.remaining() < len {
                    return Err(DeltaError::Truncated);
                }
                out.extend_from_slice(&buf.chunk()[..len]);
                buf.advance(len);
            }
            OP_END => {
                if buf.remaining() < 4 {
                    return Err(DeltaError::Truncated);
                }
                let want = buf.get_u32();
                if buf.has_remaining() {
                    return Err(DeltaError::TrailingBytes);
                }
                if out.len() as u64 != target_len {
                    return Err(DeltaError::LengthMismatch {
                        got: out.len() as u64,
                        want: target_len,
                    });
                }
                if checksum(&out) != want {
                    return Err(DeltaError::ChecksumMismatch);
                }
                return Ok(out);
            }
            other => return Err(DeltaError::BadCommand(other)),
        }
        if out.len() as u64 > target_len {
            return Err(DeltaError::LengthMismatch {
                got: out.len() as u64,
                want: target_len,
            });
        }
    }
}

fn push_insert(out: &mut Vec<u8>, literal: &[u8]) {
    if literal.is_empty() {
        return;
    }
    out.push(OP_INSERT);
    write_varint(out, literal.len() as u64);
    out.extend_from_slice(literal);
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Encode `target` as a delta against `base`.
///
/// Greedy block matcher: `base` is indexed in [`BLOCK`]-byte strides, the
/// target is scanned for matching blocks, and each match is extended as
/// far forward as the bytes agree. Unmatched stretches become inserts.
/// Always produces a valid delta; it may be larger than the target itself
/// when the inputs share nothing.
pub fn compute(base: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_varint(&mut out, target.len() as u64);

    let mut index: HashMap<&[u8], Vec<usize>> = HashMap::new();
    let mut off = 0;
    while off + BLOCK <= base.len() {
        index.entry(&base[off..off + BLOCK]).or_default().push(off);
        off += BLOCK;
    }

    let mut lit_start = 0;
    let mut i = 0;
    while i + BLOCK <= target.len() {
        if let Some(offsets) = index.get(&target[i..i + BLOCK]) {
            let mut best_off = 0;
            let mut best_len = 0;
            for &cand in offsets.iter().take(MAX_CANDIDATES) {
                let len = common_prefix(&base[cand..], &target[i..]);
                if len > best_len {
                    best_len = len;
                    best_off = cand;
                }
            }
            if best_len >= BLOCK {
                push_insert(&mut out, &target[lit_start..i]);
                out.push(OP_COPY);
                write_varint(&mut out, best_off as u64);
                write_varint(&mut out, best_len as u64);
                i += best_len;
                lit_start = i;
                continue;
            }
        }
        i += 1;
    }
    push_insert(&mut out, &target[lit_start..]);

    out.push(OP_END);
    out.extend_from_slice(&checksum(target).to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic byte stream for repeatable corpus tests.
    fn xorshift_bytes(mut seed: u64, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            out.extend_from_slice(&seed.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn roundtrip(base: &[u8], target: &[u8]) {
        let delta = compute(base, target);
        assert_eq!(apply(base, &delta).unwrap(), target);
    }

    #[test]
    fn test_roundtrip_basic() {
        roundtrip(b"", b"");
        roundtrip(b"", b"hello world, entirely new content");
        roundtrip(b"shared prefix and some tail bytes here", b"");
        let base = xorshift_bytes(7, 4096);
        roundtrip(&base, &base);
    }

    #[test]
    fn test_roundtrip_edits() {
        let base = xorshift_bytes(11, 8192);
        // splice an insertion into the middle
        let mut target = base[..3000].to_vec();
        target.extend_from_slice(b"INSERTED RUN OF NEW BYTES");
        target.extend_from_slice(&base[3000..]);
        roundtrip(&base, &target);

        // deletion
        let mut target = base[..1000].to_vec();
        target.extend_from_slice(&base[5000..]);
        roundtrip(&base, &target);

        // disjoint content
        let other = xorshift_bytes(99, 2048);
        roundtrip(&base, &other);
    }

    #[test]
    fn test_similar_inputs_produce_small_delta() {
        let base = xorshift_bytes(3, 16384);
        let mut target = base.clone();
        target[8000] ^= 0xff;
        let delta = compute(&base, &target);
        assert!(delta.len() < 256, "delta len {}", delta.len());
    }

    #[test]
    fn test_apply_rejects_corruption() {
        let base = xorshift_bytes(5, 2048);
        let target = xorshift_bytes(6, 2048);
        let delta = compute(&base, &target);

        let mut flipped = delta.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert_eq!(apply(&base, &flipped), Err(DeltaError::ChecksumMismatch));

        let truncated = &delta[..delta.len() - 6];
        assert_eq!(apply(&base, truncated), Err(DeltaError::Truncated));

        let mut trailing = delta.clone();
        trailing.push(0);
        assert_eq!(apply(&base, &trailing), Err(DeltaError::TrailingBytes));
    }

    #[test]
    fn test_apply_rejects_copy_outside_base() {
        // copy(0, 10) against an empty base
        let mut delta = Vec::new();
        super::write_varint(&mut delta, 10);
        delta.push(OP_COPY);
        super::write_varint(&mut delta, 0);
        super::write_varint(&mut delta, 10);
        delta.push(OP_END);
        delta.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(apply(b"", &delta), Err(DeltaError::CopyOutOfRange));
    }

    #[test]
    fn test_checksum_word_sum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0, 0, 0, 1]), 1);
        // short tail is zero-padded on the right
        assert_eq!(checksum(&[1]), 0x0100_0000);
    }
}
