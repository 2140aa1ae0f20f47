//! # Control Message Wire Format
//!
//! All multi-byte fields are little-endian.
//!
//! ```text
//! header   : id u32 | ex_msg u32 | data_len u32                 (12 bytes)
//! query    : head 0x5a5a5a5a | ft_set[64] | tail 0xa5a5a5a5      (72 bytes)
//! entry    : feature_id u8 | support_info u8 | reserved[2]
//!            | data_len u32 | data[data_len]                      (8 + n)
//!
//! HS1 = header(Hs1) + query
//! HS2 = header(Hs2) + query + entry*
//! HS3 = header(Hs3) + entry*
//! ```

use alloc::vec::Vec;

use static_assertions::const_assert_eq;

use crate::error::{HandshakeError, HandshakeResult};
use crate::feature::{FeatureDescriptor, FeatureId};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Query head sentinel
pub const HEAD_PATTERN: u32 = 0x5a5a_5a5a;
/// Query tail sentinel
pub const TAIL_PATTERN: u32 = 0xa5a5_a5a5;
/// Number of slots in the feature table
pub const FEATURE_COUNT: usize = 64;
/// Maximum stage-3 entry bytes
pub const RT_DATA_BUDGET: usize = 3 * 1024;
/// Check id carried by the exception message
pub const MDEE_CHK_ID: u32 = 0x4558_4350;
/// Check id carried by the exception receive-ok reply
pub const MDEE_REC_OK_CHK_ID: u32 = 0x4552_4543;

// =============================================================================
// MESSAGE IDS
// =============================================================================

/// Control message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CtrlMsgId {
    /// Host feature query
    Hs1       = 0,
    /// Device feature query and runtime data
    Hs2       = 1,
    /// Host runtime data
    Hs3       = 2,
    /// Device acknowledgement (flashless parts)
    Hs4       = 3,
    /// Device exception notice
    Mdee      = 4,
    /// Exception notice received
    MdeeRecOk = 6,
    /// Device finished exception handling
    MdeePass  = 8,
}

impl TryFrom<u32> for CtrlMsgId {
    type Error = HandshakeError;

    fn try_from(value: u32) -> HandshakeResult<Self> {
        match value {
            0 => Ok(Self::Hs1),
            1 => Ok(Self::Hs2),
            2 => Ok(Self::Hs3),
            3 => Ok(Self::Hs4),
            4 => Ok(Self::Mdee),
            6 => Ok(Self::MdeeRecOk),
            8 => Ok(Self::MdeePass),
            other => Err(HandshakeError::UnknownMessage(other)),
        }
    }
}

// =============================================================================
// READ HELPERS
// =============================================================================

fn need(buf: &[u8], n: usize) -> HandshakeResult<()> {
    if buf.len() < n {
        return Err(HandshakeError::Truncated {
            needed: n,
            got: buf.len(),
        });
    }
    Ok(())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

// =============================================================================
// HEADER
// =============================================================================

/// Control message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlHeader {
    /// Raw message id
    pub id: u32,
    /// Extra word (check id for exception messages)
    pub ex_msg: u32,
    /// Payload length following the header
    pub data_len: u32,
}

impl CtrlHeader {
    /// Encoded size
    pub const SIZE: usize = 12;

    /// Append the encoded header
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.ex_msg.to_le_bytes());
        out.extend_from_slice(&self.data_len.to_le_bytes());
    }

    /// Split a message into header and payload
    pub fn parse(msg: &[u8]) -> HandshakeResult<(Self, &[u8])> {
        need(msg, Self::SIZE)?;
        let hdr = Self {
            id: read_u32(msg, 0),
            ex_msg: read_u32(msg, 4),
            data_len: read_u32(msg, 8),
        };
        let body = &msg[Self::SIZE..];
        let len = hdr.data_len as usize;
        need(body, len)?;
        Ok((hdr, &body[..len]))
    }

    /// Typed message id
    pub fn msg_id(&self) -> HandshakeResult<CtrlMsgId> {
        CtrlMsgId::try_from(self.id)
    }
}

/// Frame a payload behind a header
pub fn frame(id: CtrlMsgId, ex_msg: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CtrlHeader::SIZE + payload.len());
    CtrlHeader {
        id: id as u32,
        ex_msg,
        data_len: payload.len() as u32,
    }
    .encode_into(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Parse a header and check its id
pub fn expect(msg: &[u8], id: CtrlMsgId) -> HandshakeResult<(CtrlHeader, &[u8])> {
    let (hdr, body) = CtrlHeader::parse(msg)?;
    if hdr.id != id as u32 {
        return Err(HandshakeError::UnexpectedMessage {
            expected: id as u32,
            got: hdr.id,
        });
    }
    Ok((hdr, body))
}

// =============================================================================
// FEATURE QUERY
// =============================================================================

/// Fixed feature table bracketed by sentinels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureQuery {
    /// Info byte per feature id
    pub ft_set: [u8; FEATURE_COUNT],
}

impl FeatureQuery {
    /// Encoded size
    pub const SIZE: usize = 4 + FEATURE_COUNT + 4;

    /// Wrap a table
    pub const fn new(ft_set: [u8; FEATURE_COUNT]) -> Self {
        Self { ft_set }
    }

    /// Append the encoded query
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&HEAD_PATTERN.to_le_bytes());
        out.extend_from_slice(&self.ft_set);
        out.extend_from_slice(&TAIL_PATTERN.to_le_bytes());
    }

    /// Parse a query from the front of `buf`, returning the rest
    pub fn parse(buf: &[u8]) -> HandshakeResult<(Self, &[u8])> {
        need(buf, Self::SIZE)?;
        let head = read_u32(buf, 0);
        let tail = read_u32(buf, 4 + FEATURE_COUNT);
        if head != HEAD_PATTERN || tail != TAIL_PATTERN {
            return Err(HandshakeError::BadSentinel { head, tail });
        }
        let mut ft_set = [0u8; FEATURE_COUNT];
        ft_set.copy_from_slice(&buf[4..4 + FEATURE_COUNT]);
        Ok((Self { ft_set }, &buf[Self::SIZE..]))
    }

    /// Decode the descriptor at `id`
    pub fn descriptor(&self, id: FeatureId) -> HandshakeResult<FeatureDescriptor> {
        let info = self
            .ft_set
            .get(id.index())
            .copied()
            .ok_or(HandshakeError::FeatureIdOutOfRange(id.0))?;
        FeatureDescriptor::from_info(id, info)
    }
}

// =============================================================================
// RUNTIME ENTRIES
// =============================================================================

/// One runtime-data entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureEntry<'a> {
    /// Feature id
    pub id: FeatureId,
    /// Packed level/version
    pub info: u8,
    /// Feature payload
    pub data: &'a [u8],
}

impl<'a> FeatureEntry<'a> {
    /// Fixed part of an entry
    pub const HEADER_SIZE: usize = 8;

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    /// Append the encoded entry
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.id.0);
        out.push(self.info);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(self.data);
    }

    /// Decoded level/version
    pub fn descriptor(&self) -> HandshakeResult<FeatureDescriptor> {
        FeatureDescriptor::from_info(self.id, self.info)
    }
}

/// Iterator over packed runtime entries
pub struct EntryIter<'a> {
    buf: &'a [u8],
}

impl<'a> EntryIter<'a> {
    /// Iterate over `buf`
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = HandshakeResult<FeatureEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        if let Err(e) = need(self.buf, FeatureEntry::HEADER_SIZE) {
            self.buf = &[];
            return Some(Err(e));
        }
        let id = FeatureId(self.buf[0]);
        let info = self.buf[1];
        let len = read_u32(self.buf, 4) as usize;
        let rest = &self.buf[FeatureEntry::HEADER_SIZE..];
        if let Err(e) = need(rest, len) {
            self.buf = &[];
            return Some(Err(e));
        }
        self.buf = &rest[len..];
        Some(Ok(FeatureEntry {
            id,
            info,
            data: &rest[..len],
        }))
    }
}

// =============================================================================
// STAGE MESSAGES
// =============================================================================

/// Build the stage-1 message
pub fn build_hs1(table: [u8; FEATURE_COUNT]) -> Vec<u8> {
    let mut body = Vec::with_capacity(FeatureQuery::SIZE);
    FeatureQuery::new(table).encode_into(&mut body);
    frame(CtrlMsgId::Hs1, 0, &body)
}

/// Decoded stage-2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs2Message<'a> {
    /// What the device asks of the host
    pub query: FeatureQuery,
    /// Device runtime data
    pub entries: Vec<FeatureEntry<'a>>,
}

impl<'a> Hs2Message<'a> {
    /// Parse a stage-2 message
    pub fn parse(msg: &'a [u8]) -> HandshakeResult<Self> {
        let (_, body) = expect(msg, CtrlMsgId::Hs2)?;
        let (query, rest) = FeatureQuery::parse(body)?;
        let entries = EntryIter::new(rest).collect::<HandshakeResult<Vec<_>>>()?;
        Ok(Self { query, entries })
    }

    /// Runtime entry for `id`, if the device sent one
    pub fn entry(&self, id: FeatureId) -> Option<&FeatureEntry<'a>> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Build the stage-3 message from an already-encoded entry block
pub fn build_hs3(entries: &[u8]) -> Vec<u8> {
    frame(CtrlMsgId::Hs3, 0, entries)
}

/// Validate a device exception message
pub fn parse_mdee(msg: &[u8]) -> HandshakeResult<()> {
    let (hdr, _) = expect(msg, CtrlMsgId::Mdee)?;
    if hdr.ex_msg != MDEE_CHK_ID {
        return Err(HandshakeError::BadCheckId(hdr.ex_msg));
    }
    Ok(())
}

/// Build the exception receive-ok reply
pub fn build_mdee_rec_ok() -> Vec<u8> {
    frame(CtrlMsgId::MdeeRecOk, MDEE_REC_OK_CHK_ID, &[])
}

const_assert_eq!(CtrlHeader::SIZE, 12);
const_assert_eq!(FeatureQuery::SIZE, 72);
const_assert_eq!(FeatureEntry::HEADER_SIZE, 8);
