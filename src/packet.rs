//! Owned IPv4/IPv6 TCP and UDP packets
//!
//! Every field is read from the bytes on demand; nothing is cached next to the
//! buffer. [`Packet::parse_tcp`] validates the layout once so the accessors can
//! index without further checks.

use crate::wire::{read_u16, read_u32};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Minimum IPv4 header length
pub const IPV4_HEADER_MIN: usize = 20;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

/// Minimum TCP header length
pub const TCP_HEADER_MIN: usize = 20;

/// Smallest buffer worth inspecting (IPv4 + TCP without options)
pub const MIN_TCP_PACKET_LEN: usize = IPV4_HEADER_MIN + TCP_HEADER_MIN;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// TCP flag bits (byte 13 of the header)
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// IP version of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Read the IP version nibble of a raw datagram
pub fn ip_version(raw: &[u8]) -> Option<IpVersion> {
    match raw.first()? >> 4 {
        4 => Some(IpVersion::V4),
        6 => Some(IpVersion::V6),
        _ => None,
    }
}

/// Destination address of a raw IPv4/IPv6 datagram
pub fn destination_addr(raw: &[u8]) -> Option<IpAddr> {
    match ip_version(raw)? {
        IpVersion::V4 => {
            let d: [u8; 4] = raw.get(16..20)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(d)))
        }
        IpVersion::V6 => {
            let d: [u8; 16] = raw.get(24..40)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(d)))
        }
    }
}

/// Smallest UDP datagram worth inspecting (IPv4 + UDP header)
pub const MIN_UDP_PACKET_LEN: usize = IPV4_HEADER_MIN + UDP_HEADER_LEN;

/// Fixed UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Check the IP layer of `buf` and return `(ip_header_len, total_len)` when
/// it is an unfragmented datagram carrying `protocol`
fn ip_layout(buf: &[u8], protocol: u8) -> Option<(usize, usize)> {
    match ip_version(buf)? {
        IpVersion::V4 => {
            if buf.len() < IPV4_HEADER_MIN {
                return None;
            }
            let ihl = ((buf[0] & 0x0f) as usize) * 4;
            let total = read_u16(buf, 2)? as usize;
            if ihl < IPV4_HEADER_MIN || total < ihl || total > buf.len() {
                return None;
            }
            if buf[9] != protocol {
                return None;
            }
            // MF set or nonzero offset: already a fragment
            if read_u16(buf, 6)? & 0x3fff != 0 {
                return None;
            }
            Some((ihl, total))
        }
        IpVersion::V6 => {
            if buf.len() < IPV6_HEADER_LEN {
                return None;
            }
            let total = IPV6_HEADER_LEN + read_u16(buf, 4)? as usize;
            if total > buf.len() || buf[6] != protocol {
                return None;
            }
            Some((IPV6_HEADER_LEN, total))
        }
    }
}

/// IP-layer fields shared by the TCP and UDP packet types. `buf` has
/// already passed [`ip_layout`].
mod ip {
    use super::{IpVersion, IPV6_HEADER_LEN};
    use crate::wire::{self, read_u16};

    pub(super) fn version(buf: &[u8]) -> IpVersion {
        if buf[0] >> 4 == 6 {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    pub(super) fn header_len(buf: &[u8]) -> usize {
        match version(buf) {
            IpVersion::V4 => ((buf[0] & 0x0f) as usize) * 4,
            IpVersion::V6 => IPV6_HEADER_LEN,
        }
    }

    pub(super) fn ttl(buf: &[u8]) -> u8 {
        match version(buf) {
            IpVersion::V4 => buf[8],
            IpVersion::V6 => buf[7],
        }
    }

    pub(super) fn set_ttl(buf: &mut [u8], ttl: u8) {
        match version(buf) {
            IpVersion::V4 => buf[8] = ttl,
            IpVersion::V6 => buf[7] = ttl,
        }
    }

    pub(super) fn id(buf: &[u8]) -> u16 {
        match version(buf) {
            IpVersion::V4 => read_u16(buf, 4).unwrap_or_default(),
            IpVersion::V6 => 0,
        }
    }

    pub(super) fn set_id(buf: &mut [u8], id: u16) {
        if version(buf) == IpVersion::V4 {
            buf[4..6].copy_from_slice(&id.to_be_bytes());
        }
    }

    pub(super) fn fix_length(buf: &mut [u8]) {
        match version(buf) {
            IpVersion::V4 => {
                let total = buf.len() as u16;
                buf[2..4].copy_from_slice(&total.to_be_bytes());
            }
            IpVersion::V6 => {
                let payload = (buf.len() - IPV6_HEADER_LEN) as u16;
                buf[4..6].copy_from_slice(&payload.to_be_bytes());
            }
        }
    }

    /// Transport checksum over the pseudo-header and the bytes after the IP
    /// header. The caller zeroes the checksum field first.
    pub(super) fn transport_checksum(buf: &[u8], protocol: u8) -> u16 {
        let ip_len = header_len(buf);
        match version(buf) {
            IpVersion::V4 => {
                let (src, dst) = v4_addrs(buf);
                wire::transport_checksum_v4(&src, &dst, protocol, &buf[ip_len..])
            }
            IpVersion::V6 => {
                let (src, dst) = v6_addrs(buf);
                wire::transport_checksum_v6(&src, &dst, protocol, &buf[ip_len..])
            }
        }
    }

    /// Whether the transport checksum covering the bytes after the IP header
    /// verifies
    pub(super) fn transport_checksum_ok(buf: &[u8], protocol: u8) -> bool {
        let segment = &buf[header_len(buf)..];
        let len = segment.len() as u32;
        let sum = match version(buf) {
            IpVersion::V4 => {
                let (src, dst) = v4_addrs(buf);
                let sum = wire::ones_complement_sum(&dst, wire::ones_complement_sum(&src, 0));
                sum.wrapping_add(protocol as u32 + len)
            }
            IpVersion::V6 => {
                let (src, dst) = v6_addrs(buf);
                let sum = wire::ones_complement_sum(&dst, wire::ones_complement_sum(&src, 0));
                sum.wrapping_add((len >> 16) + (len & 0xffff) + protocol as u32)
            }
        };
        wire::checksum_fold(wire::ones_complement_sum(segment, sum)) == 0
    }

    pub(super) fn write_header_checksum(buf: &mut [u8]) {
        if version(buf) == IpVersion::V4 {
            let ip_len = header_len(buf);
            buf[10..12].fill(0);
            let csum = wire::ipv4_header_checksum(&buf[..ip_len]);
            buf[10..12].copy_from_slice(&csum.to_be_bytes());
        }
    }

    pub(super) fn header_checksum_ok(buf: &[u8]) -> bool {
        match version(buf) {
            IpVersion::V4 => {
                wire::checksum_fold(wire::ones_complement_sum(&buf[..header_len(buf)], 0)) == 0
            }
            IpVersion::V6 => true,
        }
    }

    fn v4_addrs(buf: &[u8]) -> ([u8; 4], [u8; 4]) {
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&buf[12..16]);
        dst.copy_from_slice(&buf[16..20]);
        (src, dst)
    }

    fn v6_addrs(buf: &[u8]) -> ([u8; 16], [u8; 16]) {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        (src, dst)
    }
}

/// A validated TCP segment carried in IPv4 or IPv6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Validate `buf` as an unfragmented IPv4 or IPv6 datagram carrying TCP.
    ///
    /// Trailing bytes past the IP length field are dropped. Returns `None` for
    /// anything else (UDP, IP fragments, extension headers, truncation).
    pub fn parse_tcp(mut buf: Vec<u8>) -> Option<Self> {
        let (ip_len, total_len) = ip_layout(&buf, IPPROTO_TCP)?;
        if total_len < ip_len + TCP_HEADER_MIN {
            return None;
        }
        let doff = ((buf[ip_len + 12] >> 4) as usize) * 4;
        if doff < TCP_HEADER_MIN || ip_len + doff > total_len {
            return None;
        }

        buf.truncate(total_len);
        Some(Self { buf })
    }

    /// Parse a borrowed buffer into an owned copy
    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        Self::parse_tcp(raw.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn ip_version(&self) -> IpVersion {
        ip::version(&self.buf)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip_version() == IpVersion::V6
    }

    pub fn ip_header_len(&self) -> usize {
        ip::header_len(&self.buf)
    }

    pub fn tcp_header_len(&self) -> usize {
        ((self.buf[self.ip_header_len() + 12] >> 4) as usize) * 4
    }

    /// Offset of the TCP payload within the datagram
    pub fn payload_offset(&self) -> usize {
        self.ip_header_len() + self.tcp_header_len()
    }

    /// IP header plus TCP header
    pub fn headers(&self) -> &[u8] {
        &self.buf[..self.payload_offset()]
    }

    /// TCP header and payload
    pub fn segment(&self) -> &[u8] {
        &self.buf[self.ip_header_len()..]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    fn tcp_field(&self, offset: usize) -> usize {
        self.ip_header_len() + offset
    }

    pub fn src_port(&self) -> u16 {
        read_u16(&self.buf, self.tcp_field(0)).unwrap_or_default()
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(&self.buf, self.tcp_field(2)).unwrap_or_default()
    }

    pub fn seq(&self) -> u32 {
        read_u32(&self.buf, self.tcp_field(4)).unwrap_or_default()
    }

    pub fn set_seq(&mut self, seq: u32) {
        let at = self.tcp_field(4);
        self.buf[at..at + 4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn flags(&self) -> u8 {
        self.buf[self.tcp_field(13)]
    }

    pub fn is_syn(&self) -> bool {
        self.flags() & tcp_flags::SYN != 0
    }

    pub fn window(&self) -> u16 {
        read_u16(&self.buf, self.tcp_field(14)).unwrap_or_default()
    }

    pub fn set_window(&mut self, window: u16) {
        let at = self.tcp_field(14);
        self.buf[at..at + 2].copy_from_slice(&window.to_be_bytes());
    }

    pub fn tcp_checksum(&self) -> u16 {
        read_u16(&self.buf, self.tcp_field(16)).unwrap_or_default()
    }

    /// IPv4 TTL or IPv6 hop limit
    pub fn ttl(&self) -> u8 {
        ip::ttl(&self.buf)
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        ip::set_ttl(&mut self.buf, ttl)
    }

    /// IPv4 identification field; always 0 for IPv6
    pub fn ip_id(&self) -> u16 {
        ip::id(&self.buf)
    }

    pub fn set_ip_id(&mut self, id: u16) {
        ip::set_id(&mut self.buf, id)
    }

    /// Copy of this packet with the TCP payload replaced.
    ///
    /// IP length fields are updated; checksums are left stale for the caller
    /// to recompute after any further edits.
    pub fn with_payload(&self, payload: &[u8]) -> Packet {
        let mut buf = Vec::with_capacity(self.payload_offset() + payload.len());
        buf.extend_from_slice(self.headers());
        buf.extend_from_slice(payload);
        ip::fix_length(&mut buf);
        Packet { buf }
    }

    /// Recompute the TCP checksum and, for IPv4, the header checksum
    pub fn recompute_checksums(&mut self) {
        let at = self.tcp_field(16);
        self.buf[at..at + 2].fill(0);
        let csum = ip::transport_checksum(&self.buf, IPPROTO_TCP);
        self.buf[at..at + 2].copy_from_slice(&csum.to_be_bytes());
        ip::write_header_checksum(&mut self.buf);
    }

    /// Flip the TCP checksum so the receiving stack discards the segment
    pub fn corrupt_tcp_checksum(&mut self) {
        let at = self.tcp_field(16);
        let bad = self.tcp_checksum().wrapping_add(1).max(1);
        self.buf[at..at + 2].copy_from_slice(&bad.to_be_bytes());
    }

    /// Whether the stored checksums match the bytes
    pub fn checksums_valid(&self) -> bool {
        ip::transport_checksum_ok(&self.buf, IPPROTO_TCP) && ip::header_checksum_ok(&self.buf)
    }
}

/// A validated UDP datagram carried in IPv4 or IPv6
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    buf: Vec<u8>,
}

impl UdpPacket {
    /// Validate `buf` as an unfragmented IPv4 or IPv6 datagram carrying UDP.
    ///
    /// The UDP length field must agree with the IP length.
    pub fn parse_udp(mut buf: Vec<u8>) -> Option<Self> {
        let (ip_len, total_len) = ip_layout(&buf, IPPROTO_UDP)?;
        if total_len < ip_len + UDP_HEADER_LEN {
            return None;
        }
        if read_u16(&buf, ip_len + 4)? as usize != total_len - ip_len {
            return None;
        }

        buf.truncate(total_len);
        Some(Self { buf })
    }

    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        Self::parse_udp(raw.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn ip_version(&self) -> IpVersion {
        ip::version(&self.buf)
    }

    pub fn ip_header_len(&self) -> usize {
        ip::header_len(&self.buf)
    }

    /// Offset of the UDP payload within the datagram
    pub fn payload_offset(&self) -> usize {
        self.ip_header_len() + UDP_HEADER_LEN
    }

    /// UDP header and payload
    pub fn segment(&self) -> &[u8] {
        &self.buf[self.ip_header_len()..]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset()..]
    }

    pub fn src_port(&self) -> u16 {
        read_u16(&self.buf, self.ip_header_len()).unwrap_or_default()
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(&self.buf, self.ip_header_len() + 2).unwrap_or_default()
    }

    pub fn udp_checksum(&self) -> u16 {
        read_u16(&self.buf, self.ip_header_len() + 6).unwrap_or_default()
    }

    pub fn ttl(&self) -> u8 {
        ip::ttl(&self.buf)
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        ip::set_ttl(&mut self.buf, ttl)
    }

    pub fn ip_id(&self) -> u16 {
        ip::id(&self.buf)
    }

    pub fn set_ip_id(&mut self, id: u16) {
        ip::set_id(&mut self.buf, id)
    }

    /// Copy with the UDP payload replaced; IP and UDP lengths are updated,
    /// checksums are left stale
    pub fn with_payload(&self, payload: &[u8]) -> UdpPacket {
        let offset = self.payload_offset();
        let mut buf = Vec::with_capacity(offset + payload.len());
        buf.extend_from_slice(&self.buf[..offset]);
        buf.extend_from_slice(payload);
        ip::fix_length(&mut buf);
        let udp_len = ((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes();
        let at = self.ip_header_len() + 4;
        buf[at..at + 2].copy_from_slice(&udp_len);
        UdpPacket { buf }
    }

    /// Recompute the UDP checksum and, for IPv4, the header checksum.
    ///
    /// A computed zero is sent as `0xffff`, since zero means "no checksum".
    pub fn recompute_checksums(&mut self) {
        let at = self.ip_header_len() + 6;
        self.buf[at..at + 2].fill(0);
        let csum = match ip::transport_checksum(&self.buf, IPPROTO_UDP) {
            0 => 0xffff,
            csum => csum,
        };
        self.buf[at..at + 2].copy_from_slice(&csum.to_be_bytes());
        ip::write_header_checksum(&mut self.buf);
    }

    /// Replace the UDP checksum with a wrong nonzero value
    pub fn corrupt_udp_checksum(&mut self) {
        let at = self.ip_header_len() + 6;
        let bad = self.udp_checksum().wrapping_add(1).max(1);
        self.buf[at..at + 2].copy_from_slice(&bad.to_be_bytes());
    }

    /// Whether the stored checksums match the bytes. An IPv4 UDP checksum of
    /// zero is accepted as absent.
    pub fn checksums_valid(&self) -> bool {
        let udp_ok = (self.ip_version() == IpVersion::V4 && self.udp_checksum() == 0)
            || ip::transport_checksum_ok(&self.buf, IPPROTO_UDP);
        udp_ok && ip::header_checksum_ok(&self.buf)
    }
}
