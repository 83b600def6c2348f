//! QUIC long-header parsing for Initial packets (RFC 9000 §17.2.2)

use super::version::QuicVersion;
use crate::wire::{read_u32, read_varint};

/// Connection IDs longer than this are invalid in QUIC v1/v2
pub const MAX_CID_LEN: usize = 20;

/// Long header form bit
pub const LONG_HEADER_FORM: u8 = 0x80;

/// Whether `payload` looks like a client Initial of a recognised version.
///
/// Checks the form bit, the version and that version's Initial type bits.
pub fn is_initial(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };
    if first & LONG_HEADER_FORM == 0 {
        return false;
    }
    let Some(version) = read_u32(payload, 1).and_then(QuicVersion::from_wire) else {
        return false;
    };
    (first & 0x30) >> 4 == version.initial_type_bits()
}

/// Parsed long-header fields up to the packet-number field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHeader {
    /// Version as carried on the wire; may be unrecognised
    pub version: u32,
    pub dcid: Vec<u8>,
    pub scid: Vec<u8>,
    pub token_len: usize,
    /// Value of the Length field: packet number plus protected payload
    pub length: usize,
    /// Offset of the packet-number field, which is the header length
    pub pn_offset: usize,
}

impl InitialHeader {
    /// Parse the header fields of a long-header packet.
    ///
    /// Does not check the version or type bits (see [`is_initial`]). Returns
    /// `None` if any field runs past the datagram or the Length field claims
    /// more bytes than remain.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if *payload.first()? & LONG_HEADER_FORM == 0 {
            return None;
        }
        let version = read_u32(payload, 1)?;
        let mut pos = 5;

        let dcid = read_cid(payload, &mut pos)?;
        let scid = read_cid(payload, &mut pos)?;

        let (token_len, n) = read_varint(payload.get(pos..)?);
        if n == 0 {
            return None;
        }
        pos += n;
        let token_len = usize::try_from(token_len).ok()?;
        pos = pos.checked_add(token_len)?;

        let (length, n) = read_varint(payload.get(pos..)?);
        if n == 0 {
            return None;
        }
        pos += n;
        let length = usize::try_from(length).ok()?;

        if pos.checked_add(length)? > payload.len() {
            return None;
        }

        Some(Self {
            version,
            dcid,
            scid,
            token_len,
            length,
            pn_offset: pos,
        })
    }
}

fn read_cid(payload: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let len = *payload.get(*pos)? as usize;
    if len > MAX_CID_LEN {
        return None;
    }
    let cid = payload.get(*pos + 1..*pos + 1 + len)?.to_vec();
    *pos += 1 + len;
    Some(cid)
}

/// Packet-number length learned from a protected first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketNumberLength {
    /// Header protection was removed; the length is exact
    Recovered(usize),
    /// Keys were unavailable and a default was used; best effort only
    Assumed(usize),
}

impl PacketNumberLength {
    pub fn len(self) -> usize {
        match self {
            Self::Recovered(n) | Self::Assumed(n) => n,
        }
    }

    pub fn is_recovered(self) -> bool {
        matches!(self, Self::Recovered(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_header(first: u8, version: u32, token: &[u8], length: usize) -> Vec<u8> {
        let mut buf = vec![first];
        buf.extend_from_slice(&version.to_be_bytes());
        buf.push(8);
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.push(3);
        buf.extend_from_slice(&[9, 9, 9]);
        crate::wire::encode_varint(token.len() as u64, &mut buf);
        buf.extend_from_slice(token);
        crate::wire::encode_varint(length as u64, &mut buf);
        buf.resize(buf.len() + length, 0);
        buf
    }

    #[test]
    fn test_is_initial_v1_and_v2() {
        assert!(is_initial(&long_header(0xc3, 1, &[], 20)));
        assert!(!is_initial(&long_header(0xe3, 1, &[], 20))); // Handshake
        assert!(is_initial(&long_header(0xd3, QuicVersion::V2_WIRE, &[], 20)));
        assert!(!is_initial(&long_header(0xc3, QuicVersion::V2_WIRE, &[], 20)));
        assert!(!is_initial(&long_header(0xc3, 0xff00_001d, &[], 20)));
        assert!(!is_initial(&[0x43, 0, 0, 0, 1]));
        assert!(!is_initial(&[]));
    }

    #[test]
    fn test_parse_fields() {
        let packet = long_header(0xc3, 1, &[0xaa; 5], 100);
        let header = InitialHeader::parse(&packet).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.dcid, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(header.scid, vec![9, 9, 9]);
        assert_eq!(header.token_len, 5);
        assert_eq!(header.length, 100);
        // 1 + 4 + 1 + 8 + 1 + 3 + 1 + 5 + 2
        assert_eq!(header.pn_offset, 26);
    }

    #[test]
    fn test_parse_unknown_version_still_parses() {
        let packet = long_header(0xc0, 0x1234_5678, &[], 30);
        assert_eq!(InitialHeader::parse(&packet).unwrap().version, 0x1234_5678);
    }

    #[test]
    fn test_parse_truncated() {
        let packet = long_header(0xc3, 1, &[0xaa; 5], 100);
        for cut in 0..packet.len() {
            assert!(InitialHeader::parse(&packet[..cut]).is_none(), "cut {}", cut);
        }
    }

    #[test]
    fn test_parse_rejects_long_cid() {
        let mut packet = long_header(0xc3, 1, &[], 10);
        packet[5] = 21;
        assert!(InitialHeader::parse(&packet).is_none());
    }

    #[test]
    fn test_pn_length_fallback_for_unknown_version() {
        let packet = long_header(0xc0, 0x1234_5678, &[], 40);
        let header = InitialHeader::parse(&packet).unwrap();
        let pn = super::super::keys::packet_number_length(&packet, &header);
        assert_eq!(pn, PacketNumberLength::Assumed(2));
        assert!(!pn.is_recovered());
    }

    #[test]
    fn test_pn_length_recovered_for_v1() {
        let packet = long_header(0xc0, 1, &[], 40);
        let header = InitialHeader::parse(&packet).unwrap();
        let pn = super::super::keys::packet_number_length(&packet, &header);
        assert!(pn.is_recovered());
        assert!((1..=4).contains(&pn.len()));
    }
}
