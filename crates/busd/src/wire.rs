//! Name-service wire codec (C1).
//!
//! Encodes and decodes the NS datagram: a one-byte version, a count byte,
//! then that many WhoHas questions followed by that many IsAt answers.
//! Field ordering and widths are fixed per version; this is the only
//! compatibility surface later versions must preserve bit-exactly.
//!
//! ```text
//! byte 0        : (major << 4) | minor
//! byte 1        : (question_count << 4) | answer_count
//! question_count x WhoHas
//! answer_count   x IsAt
//! ```
//!
//! Version 1 records carry an explicit presence flag per address family;
//! absent families are omitted entirely. Version 0 records always carry
//! both the IPv4 and IPv6 slots, with an address of all-zeros and port 0
//! meaning "absent" (matching §4.3.7's "omitted (v1) or zeroed (v0)").

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::guid::Guid;

/// Maximum encoded datagram size (fits inside a 1500-byte Ethernet MTU).
pub const NS_MESSAGE_MAX: usize = 1454;

/// Maximum length of a single advertised/queried name.
pub const MAX_NAME_LEN: usize = 255;

/// TTL sentinel meaning "does not expire".
pub const DURATION_INFINITE: u8 = 255;

const CURRENT_MAJOR: u8 = 1;
const CURRENT_MINOR: u8 = 0;

/// The version byte: `(major << 4) | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsHeader {
    pub major: u8,
    pub minor: u8,
}

impl NsHeader {
    pub fn current() -> Self {
        Self {
            major: CURRENT_MAJOR,
            minor: CURRENT_MINOR,
        }
    }

    fn from_byte(b: u8) -> Self {
        Self {
            major: b >> 4,
            minor: b & 0x0f,
        }
    }

    fn to_byte(self) -> u8 {
        (self.major << 4) | (self.minor & 0x0f)
    }
}

/// A discovery query: "who has any of these names?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHas {
    pub transport_mask: u16,
    pub ipv4: bool,
    pub ipv6: bool,
    pub reliable: bool,
    pub unreliable: bool,
    pub names: Vec<String>,
}

/// A discovery answer: "these names are reachable here."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsAt {
    pub transport_mask: u16,
    pub complete: bool,
    pub ttl: u8,
    pub guid: Guid,
    pub reliable_ipv4: Option<(Ipv4Addr, u16)>,
    pub reliable_ipv6: Option<(Ipv6Addr, u16)>,
    pub unreliable_ipv4: Option<(Ipv4Addr, u16)>,
    pub unreliable_ipv6: Option<(Ipv6Addr, u16)>,
    pub names: Vec<String>,
}

impl IsAt {
    /// `ttl == 0` means the advertiser is withdrawing these names.
    pub fn is_lost(&self) -> bool {
        self.ttl == 0
    }
}

/// A full NS datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsMessage {
    pub header: NsHeader,
    pub who_has: Vec<WhoHas>,
    pub is_at: Vec<IsAt>,
}

impl NsMessage {
    pub fn new(who_has: Vec<WhoHas>, is_at: Vec<IsAt>) -> Self {
        Self {
            header: NsHeader::current(),
            who_has,
            is_at,
        }
    }

    /// Encode to bytes. Fails if the result would exceed [`NS_MESSAGE_MAX`];
    /// callers are responsible for splitting large advertisements (S6) into
    /// several messages before calling this.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.who_has.len() > 15 || self.is_at.len() > 15 {
            return Err(Error::ProtocolError(
                "too many records for one datagram".into(),
            ));
        }

        let mut buf = Vec::with_capacity(64);
        buf.push(self.header.to_byte());
        buf.push(((self.who_has.len() as u8) << 4) | (self.is_at.len() as u8));

        for wh in &self.who_has {
            encode_who_has(self.header, wh, &mut buf)?;
        }
        for ia in &self.is_at {
            encode_is_at(self.header, ia, &mut buf)?;
        }

        if buf.len() > NS_MESSAGE_MAX {
            return Err(Error::ProtocolError(format!(
                "encoded message {} bytes exceeds maximum {}",
                buf.len(),
                NS_MESSAGE_MAX
            )));
        }
        Ok(buf)
    }

    /// Decode from bytes. Unknown majors are reported as [`Error::ProtocolError`]
    /// so the caller drops the datagram and logs; reserved flag bits are
    /// ignored rather than rejected, for forward compatibility.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > NS_MESSAGE_MAX {
            return Err(Error::ProtocolError(format!(
                "datagram {} bytes exceeds maximum {}",
                data.len(),
                NS_MESSAGE_MAX
            )));
        }
        let mut cur = Cursor::new(data);
        let header = NsHeader::from_byte(cur.u8()?);
        if header.major > CURRENT_MAJOR {
            return Err(Error::ProtocolError(format!(
                "unsupported NS major version {}",
                header.major
            )));
        }

        let counts = cur.u8()?;
        let question_count = counts >> 4;
        let answer_count = counts & 0x0f;

        let mut who_has = Vec::with_capacity(question_count as usize);
        for _ in 0..question_count {
            who_has.push(decode_who_has(header, &mut cur)?);
        }

        let mut is_at = Vec::with_capacity(answer_count as usize);
        for _ in 0..answer_count {
            is_at.push(decode_is_at(header, &mut cur)?);
        }

        Ok(Self {
            header,
            who_has,
            is_at,
        })
    }
}

// Flag bits for a v1 WhoHas record.
const WHOHAS_F_IPV4: u8 = 1 << 0;
const WHOHAS_F_IPV6: u8 = 1 << 1;
const WHOHAS_F_RELIABLE: u8 = 1 << 2;
const WHOHAS_F_UNRELIABLE: u8 = 1 << 3;
// bits 4-7 reserved for forward compatibility; ignored on decode.

fn encode_who_has(header: NsHeader, wh: &WhoHas, buf: &mut Vec<u8>) -> Result<()> {
    buf.extend_from_slice(&wh.transport_mask.to_le_bytes());

    if header.major >= 1 {
        let mut flags = 0u8;
        if wh.ipv4 {
            flags |= WHOHAS_F_IPV4;
        }
        if wh.ipv6 {
            flags |= WHOHAS_F_IPV6;
        }
        if wh.reliable {
            flags |= WHOHAS_F_RELIABLE;
        }
        if wh.unreliable {
            flags |= WHOHAS_F_UNRELIABLE;
        }
        buf.push(flags);
    }

    encode_names(&wh.names, buf)
}

fn decode_who_has(header: NsHeader, cur: &mut Cursor) -> Result<WhoHas> {
    let transport_mask = cur.u16_le()?;

    let (ipv4, ipv6, reliable, unreliable) = if header.major >= 1 {
        let flags = cur.u8()?;
        (
            flags & WHOHAS_F_IPV4 != 0,
            flags & WHOHAS_F_IPV6 != 0,
            flags & WHOHAS_F_RELIABLE != 0,
            flags & WHOHAS_F_UNRELIABLE != 0,
        )
    } else {
        (true, true, true, true)
    };

    let names = decode_names(cur)?;
    Ok(WhoHas {
        transport_mask,
        ipv4,
        ipv6,
        reliable,
        unreliable,
        names,
    })
}

// Flag bits for a v1 IsAt record.
const ISAT_F_COMPLETE: u8 = 1 << 0;
const ISAT_F_RELIABLE_IPV4: u8 = 1 << 1;
const ISAT_F_RELIABLE_IPV6: u8 = 1 << 2;
const ISAT_F_UNRELIABLE_IPV4: u8 = 1 << 3;
const ISAT_F_UNRELIABLE_IPV6: u8 = 1 << 4;

fn encode_is_at(header: NsHeader, ia: &IsAt, buf: &mut Vec<u8>) -> Result<()> {
    buf.extend_from_slice(&ia.transport_mask.to_le_bytes());

    if header.major >= 1 {
        let mut flags = 0u8;
        if ia.complete {
            flags |= ISAT_F_COMPLETE;
        }
        if ia.reliable_ipv4.is_some() {
            flags |= ISAT_F_RELIABLE_IPV4;
        }
        if ia.reliable_ipv6.is_some() {
            flags |= ISAT_F_RELIABLE_IPV6;
        }
        if ia.unreliable_ipv4.is_some() {
            flags |= ISAT_F_UNRELIABLE_IPV4;
        }
        if ia.unreliable_ipv6.is_some() {
            flags |= ISAT_F_UNRELIABLE_IPV6;
        }
        buf.push(flags);
    } else {
        buf.push(if ia.complete { ISAT_F_COMPLETE } else { 0 });
    }

    buf.push(ia.ttl);
    buf.extend_from_slice(&ia.guid.0);

    if header.major >= 1 {
        if let Some((addr, port)) = ia.reliable_ipv4 {
            buf.extend_from_slice(&addr.octets());
            buf.extend_from_slice(&port.to_le_bytes());
        }
        if let Some((addr, port)) = ia.reliable_ipv6 {
            buf.extend_from_slice(&addr.octets());
            buf.extend_from_slice(&port.to_le_bytes());
        }
        if let Some((addr, port)) = ia.unreliable_ipv4 {
            buf.extend_from_slice(&addr.octets());
            buf.extend_from_slice(&port.to_le_bytes());
        }
        if let Some((addr, port)) = ia.unreliable_ipv6 {
            buf.extend_from_slice(&addr.octets());
            buf.extend_from_slice(&port.to_le_bytes());
        }
    } else {
        // Version 0: fixed dual-slot layout, zeroed when absent.
        write_v0_slot(buf, ia.reliable_ipv4);
        write_v0_slot_v6(buf, ia.reliable_ipv6);
    }

    encode_names(&ia.names, buf)
}

fn write_v0_slot(buf: &mut Vec<u8>, slot: Option<(Ipv4Addr, u16)>) {
    let (addr, port) = slot.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
    buf.extend_from_slice(&addr.octets());
    buf.extend_from_slice(&port.to_le_bytes());
}

fn write_v0_slot_v6(buf: &mut Vec<u8>, slot: Option<(Ipv6Addr, u16)>) {
    let (addr, port) = slot.unwrap_or((Ipv6Addr::UNSPECIFIED, 0));
    buf.extend_from_slice(&addr.octets());
    buf.extend_from_slice(&port.to_le_bytes());
}

fn decode_is_at(header: NsHeader, cur: &mut Cursor) -> Result<IsAt> {
    let transport_mask = cur.u16_le()?;

    let flags = if header.major >= 1 {
        cur.u8()?
    } else {
        cur.u8()?
    };
    let complete = flags & ISAT_F_COMPLETE != 0;

    let ttl = cur.u8()?;
    let guid = Guid(cur.bytes::<16>()?);

    let (reliable_ipv4, reliable_ipv6, unreliable_ipv4, unreliable_ipv6);
    if header.major >= 1 {
        reliable_ipv4 = if flags & ISAT_F_RELIABLE_IPV4 != 0 {
            Some(read_v4_slot(cur)?)
        } else {
            None
        };
        reliable_ipv6 = if flags & ISAT_F_RELIABLE_IPV6 != 0 {
            Some(read_v6_slot(cur)?)
        } else {
            None
        };
        unreliable_ipv4 = if flags & ISAT_F_UNRELIABLE_IPV4 != 0 {
            Some(read_v4_slot(cur)?)
        } else {
            None
        };
        unreliable_ipv6 = if flags & ISAT_F_UNRELIABLE_IPV6 != 0 {
            Some(read_v6_slot(cur)?)
        } else {
            None
        };
    } else {
        let v4 = read_v4_slot(cur)?;
        let v6 = read_v6_slot(cur)?;
        reliable_ipv4 = (v4.0 != Ipv4Addr::UNSPECIFIED || v4.1 != 0).then_some(v4);
        reliable_ipv6 = (v6.0 != Ipv6Addr::UNSPECIFIED || v6.1 != 0).then_some(v6);
        unreliable_ipv4 = None;
        unreliable_ipv6 = None;
    }

    let names = decode_names(cur)?;

    Ok(IsAt {
        transport_mask,
        complete,
        ttl,
        guid,
        reliable_ipv4,
        reliable_ipv6,
        unreliable_ipv4,
        unreliable_ipv6,
        names,
    })
}

fn read_v4_slot(cur: &mut Cursor) -> Result<(Ipv4Addr, u16)> {
    let octets = cur.bytes::<4>()?;
    let port = cur.u16_le()?;
    Ok((Ipv4Addr::from(octets), port))
}

fn read_v6_slot(cur: &mut Cursor) -> Result<(Ipv6Addr, u16)> {
    let octets = cur.bytes::<16>()?;
    let port = cur.u16_le()?;
    Ok((Ipv6Addr::from(octets), port))
}

fn encode_names(names: &[String], buf: &mut Vec<u8>) -> Result<()> {
    if names.len() > 255 {
        return Err(Error::ProtocolError("too many names in one record".into()));
    }
    buf.push(names.len() as u8);
    for name in names {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::ProtocolError(format!(
                "name {:?} exceeds {} bytes",
                name, MAX_NAME_LEN
            )));
        }
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
    }
    Ok(())
}

fn decode_names(cur: &mut Cursor) -> Result<Vec<String>> {
    let count = cur.u8()?;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = cur.u8()? as usize;
        let raw = cur.take(len)?;
        let name = std::str::from_utf8(raw)
            .map_err(|e| Error::ProtocolError(format!("name is not UTF-8: {e}")))?;
        names.push(name.to_string());
    }
    Ok(names)
}

/// A small bounds-checked cursor over the decode buffer.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(Error::ProtocolError("datagram truncated".into()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_who_has() -> WhoHas {
        WhoHas {
            transport_mask: 0x0001,
            ipv4: true,
            ipv6: false,
            reliable: true,
            unreliable: false,
            names: vec!["org.example.*".into()],
        }
    }

    fn sample_is_at() -> IsAt {
        IsAt {
            transport_mask: 0x0001,
            complete: true,
            ttl: 120,
            guid: Guid::generate(),
            reliable_ipv4: Some((Ipv4Addr::new(10, 0, 0, 1), 9955)),
            reliable_ipv6: None,
            unreliable_ipv4: None,
            unreliable_ipv6: None,
            names: vec!["org.example.svc".into()],
        }
    }

    #[test]
    fn round_trips_who_has_only() {
        let msg = NsMessage::new(vec![sample_who_has()], vec![]);
        let bytes = msg.encode().unwrap();
        let decoded = NsMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_is_at_only() {
        let msg = NsMessage::new(vec![], vec![sample_is_at()]);
        let bytes = msg.encode().unwrap();
        let decoded = NsMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_mixed_message() {
        let msg = NsMessage::new(vec![sample_who_has()], vec![sample_is_at()]);
        let bytes = msg.encode().unwrap();
        assert!(bytes.len() <= NS_MESSAGE_MAX);
        let decoded = NsMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn version_byte_round_trips() {
        let header = NsHeader {
            major: 1,
            minor: 3,
        };
        assert_eq!(NsHeader::from_byte(header.to_byte()), header);
    }

    #[test]
    fn unknown_major_is_rejected() {
        let bytes = vec![0xF0, 0x00];
        let err = NsMessage::decode(&bytes).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn truncated_datagram_is_malformed() {
        let bytes = vec![0x10];
        let err = NsMessage::decode(&bytes).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn non_utf8_name_is_malformed() {
        let mut bytes = vec![0x10, 0x10]; // version, 1 question, 0 answers
        bytes.extend_from_slice(&0x0001u16.to_le_bytes());
        bytes.push(0); // flags
        bytes.push(1); // name count
        bytes.push(1); // name length
        bytes.push(0xFF); // invalid UTF-8 byte
        let err = NsMessage::decode(&bytes).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn reserved_flag_bits_are_ignored() {
        let mut wh = sample_who_has();
        let msg = NsMessage::new(vec![wh.clone()], vec![]);
        let mut bytes = msg.encode().unwrap();
        // Set a reserved bit (bit 7) in the WhoHas flags byte (offset 4).
        bytes[4] |= 0x80;
        let decoded = NsMessage::decode(&bytes).unwrap();
        wh.names = decoded.who_has[0].names.clone();
        assert_eq!(decoded.who_has[0], wh);
    }

    #[test]
    fn max_datagram_size_is_enforced() {
        let mut names = Vec::new();
        for i in 0..40 {
            names.push(format!("org.example.service.number.{i:02}.padding.padding"));
        }
        let is_at = IsAt {
            names,
            ..sample_is_at()
        };
        let msg = NsMessage::new(vec![], vec![is_at]);
        let err = msg.encode().unwrap_err();
        assert!(err.is_protocol_error());
    }
}
