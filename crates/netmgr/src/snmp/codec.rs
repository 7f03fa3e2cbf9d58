// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 netmgr contributors

//! BER encoding of the discovery probe and header decoding of replies.

use crate::error::{Error, Result};
use crate::snmp::SnmpVersion;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_GET_REQUEST: u8 = 0xA0;

/// The part of an SNMP reply a liveness probe cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub version: SnmpVersion,
    pub request_id: i32,
}

/// Encode a single-varbind GetRequest message.
pub fn encode_get(
    version: SnmpVersion,
    community: &str,
    request_id: i32,
    oid: &str,
) -> Result<Vec<u8>> {
    let varbind = tlv(
        TAG_SEQUENCE,
        &[
            tlv(TAG_OID, &oid_body(oid)?),
            tlv(TAG_NULL, &[]),
        ]
        .concat(),
    );
    let pdu = tlv(
        TAG_GET_REQUEST,
        &[
            tlv(TAG_INTEGER, &int_body(request_id)),
            tlv(TAG_INTEGER, &int_body(0)), // error-status
            tlv(TAG_INTEGER, &int_body(0)), // error-index
            tlv(TAG_SEQUENCE, &varbind),
        ]
        .concat(),
    );
    let message = tlv(
        TAG_SEQUENCE,
        &[
            tlv(TAG_INTEGER, &int_body(i32::from(version.wire()))),
            tlv(TAG_OCTET_STRING, community.as_bytes()),
            pdu,
        ]
        .concat(),
    );
    Ok(message)
}

/// Decode version and request id out of an SNMP message.
///
/// Accepts any PDU type, so a looped-back request decodes the same way a
/// real GetResponse does. Every length is bounds-checked; anything short
/// or misshapen is a [`Error::Codec`].
pub fn decode_header(buf: &[u8]) -> Result<ReplyHeader> {
    let mut outer = Reader::new(buf);
    let mut msg = Reader::new(outer.tlv(TAG_SEQUENCE)?);

    let version = msg.int()?;
    let version = u8::try_from(version)
        .ok()
        .and_then(SnmpVersion::from_wire)
        .ok_or_else(|| Error::Codec(format!("unknown snmp version {}", version)))?;

    msg.tlv(TAG_OCTET_STRING)?; // community, not needed

    let pdu_tag = msg.peek()?;
    if pdu_tag & 0xE0 != 0xA0 {
        return Err(Error::Codec(format!("unexpected pdu tag {:#04x}", pdu_tag)));
    }
    let mut pdu = Reader::new(msg.tlv(pdu_tag)?);
    let request_id = pdu.int()?;
    let request_id = i32::try_from(request_id)
        .map_err(|_| Error::Codec(format!("request id {} out of range", request_id)))?;

    Ok(ReplyHeader {
        version,
        request_id,
    })
}

// ===== encoding primitives =====

fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.push(tag);
    if body.len() < 0x80 {
        out.push(body.len() as u8);
    } else {
        let bytes = body.len().to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(body);
    out
}

/// Minimal two's-complement body of an INTEGER.
fn int_body(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn oid_body(oid: &str) -> Result<Vec<u8>> {
    let invalid = || Error::Codec(format!("invalid oid '{}'", oid));
    let arcs = oid
        .split('.')
        .map(|part| part.parse::<u32>())
        .collect::<core::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    if arcs.len() < 2 || arcs[0] > 2 || arcs[1] > 39 {
        return Err(invalid());
    }
    let mut out = vec![(arcs[0] * 40 + arcs[1]) as u8];
    for &arc in &arcs[2..] {
        let mut groups = [0u8; 5];
        let mut n = 0;
        let mut rest = arc;
        loop {
            groups[n] = (rest & 0x7F) as u8;
            n += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            let continued = if i == 0 { 0 } else { 0x80 };
            out.push(groups[i] | continued);
        }
    }
    Ok(out)
}

// ===== decoding primitives =====

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::Codec("message truncated".into()))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Codec("message truncated".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn length(&mut self) -> Result<usize> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let n = (first & 0x7F) as usize;
        if n == 0 || n > std::mem::size_of::<usize>() {
            return Err(Error::Codec(format!("unsupported length form {:#04x}", first)));
        }
        let mut len = 0usize;
        for &b in self.take(n)? {
            len = (len << 8) | b as usize;
        }
        Ok(len)
    }

    /// Expect a TLV with the given tag and return its body.
    fn tlv(&mut self, tag: u8) -> Result<&'a [u8]> {
        let actual = self.byte()?;
        if actual != tag {
            return Err(Error::Codec(format!(
                "expected tag {:#04x}, found {:#04x}",
                tag, actual
            )));
        }
        let len = self.length()?;
        self.take(len)
    }

    fn int(&mut self) -> Result<i64> {
        let body = self.tlv(TAG_INTEGER)?;
        if body.is_empty() || body.len() > 8 {
            return Err(Error::Codec("integer of unsupported width".into()));
        }
        let mut value: i64 = if body[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in body {
            value = (value << 8) | i64::from(b);
        }
        Ok(value)
    }
}
