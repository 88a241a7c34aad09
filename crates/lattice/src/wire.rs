// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Authenticated probe packet encoding and validation.
//!
//! # Wire Format
//!
//! ```text
//! +--------+---------+--------------+--------+--------+-------+
//! | magic  | version | send_time_ns | seq    | nonce  | tag   |
//! | "LATO" | u32 BE  | u64 BE       | u32 BE | u64 BE | 4 B   |
//! +--------+---------+--------------+--------+--------+-------+
//! 0        4         8              16       20       28     32
//! ```
//!
//! The tag is the leading 32 bits of HMAC-SHA256 over bytes 0..28 under the
//! shared secret. Fixed size plus a 1:1 echo means the responder can never
//! amplify; the truncated tag is acceptable only in combination with the
//! responder's per-source rate limit.

use crate::config::{MAGIC, PACKET_LEN, TAGGED_PREFIX_LEN, TAG_LEN, WIRE_VERSION};
use ring::{constant_time, hmac};

/// Outcome of validating a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Length, magic, and tag all check out.
    Accept,
    /// Datagram is not exactly [`PACKET_LEN`] bytes.
    RejectLength,
    /// Leading four bytes are not `LATO`.
    RejectMagic,
    /// Authentication tag mismatch.
    RejectTag,
}

/// Fields carried by a packet, exclusive of magic and tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFields {
    pub version: u32,
    pub send_ns: u64,
    pub seq: u32,
    pub nonce: u64,
}

/// Encode a probe packet.
#[must_use]
pub fn encode_packet(seq: u32, send_ns: u64, nonce: u64, secret: &[u8]) -> [u8; PACKET_LEN] {
    let mut buf = [0u8; PACKET_LEN];
    buf[0..4].copy_from_slice(&MAGIC);
    buf[4..8].copy_from_slice(&WIRE_VERSION.to_be_bytes());
    buf[8..16].copy_from_slice(&send_ns.to_be_bytes());
    buf[16..20].copy_from_slice(&seq.to_be_bytes());
    buf[20..28].copy_from_slice(&nonce.to_be_bytes());

    let tag = compute_tag(secret, &buf[..TAGGED_PREFIX_LEN]);
    buf[TAGGED_PREFIX_LEN..].copy_from_slice(&tag);
    buf
}

/// Validate a received datagram. The tag comparison is constant-time.
#[must_use]
pub fn validate_packet(bytes: &[u8], secret: &[u8]) -> Verdict {
    if bytes.len() != PACKET_LEN {
        return Verdict::RejectLength;
    }
    if bytes[0..4] != MAGIC {
        return Verdict::RejectMagic;
    }
    let expected = compute_tag(secret, &bytes[..TAGGED_PREFIX_LEN]);
    if constant_time::verify_slices_are_equal(&expected, &bytes[TAGGED_PREFIX_LEN..]).is_err() {
        return Verdict::RejectTag;
    }
    Verdict::Accept
}

/// Decode the header fields of a well-sized packet.
///
/// Version is read but not enforced; callers authenticate via
/// [`validate_packet`], not via field inspection.
#[must_use]
pub fn decode_fields(bytes: &[u8; PACKET_LEN]) -> PacketFields {
    PacketFields {
        version: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        send_ns: u64::from_be_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]),
        seq: u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        nonce: u64::from_be_bytes([
            bytes[20], bytes[21], bytes[22], bytes[23], bytes[24], bytes[25], bytes[26], bytes[27],
        ]),
    }
}

fn compute_tag(secret: &[u8], prefix: &[u8]) -> [u8; TAG_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let full = hmac::sign(&key, prefix);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full.as_ref()[..TAG_LEN]);
    tag
}
