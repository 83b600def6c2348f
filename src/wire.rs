//! Byte primitives shared by the TLS, QUIC and packet code
//!
//! QUIC variable-length integers (RFC 9000 §16) and the Internet checksum
//! (RFC 1071) over IPv4 headers and TCP/UDP pseudo-headers.

/// Read a big-endian u16 at `pos`, if in bounds
#[inline]
pub fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian 24-bit length at `pos`, if in bounds
#[inline]
pub fn read_u24(buf: &[u8], pos: usize) -> Option<usize> {
    let bytes = buf.get(pos..pos.checked_add(3)?)?;
    Some(((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
}

/// Read a big-endian u32 at `pos`, if in bounds
#[inline]
pub fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos.checked_add(4)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Decode a QUIC variable-length integer.
///
/// Returns `(value, bytes_consumed)`. A `bytes_consumed` of 0 means the input
/// was too short; callers treat that as a parse failure.
pub fn read_varint(buf: &[u8]) -> (u64, usize) {
    let Some(&first) = buf.first() else {
        return (0, 0);
    };
    let len = 1usize << (first >> 6);
    if buf.len() < len {
        return (0, 0);
    }

    let mut value = (first & 0x3f) as u64;
    for &b in &buf[1..len] {
        value = (value << 8) | b as u64;
    }
    (value, len)
}

/// Encode `value` as a QUIC varint using the shortest form.
///
/// Values above 2^62 - 1 cannot be represented and are clamped.
pub fn encode_varint(value: u64, out: &mut Vec<u8>) {
    const MAX: u64 = (1 << 62) - 1;
    let value = value.min(MAX);
    if value < 1 << 6 {
        out.push(value as u8);
    } else if value < 1 << 14 {
        out.extend_from_slice(&((value as u16) | 0x4000).to_be_bytes());
    } else if value < 1 << 30 {
        out.extend_from_slice(&((value as u32) | 0x8000_0000).to_be_bytes());
    } else {
        out.extend_from_slice(&(value | 0xc000_0000_0000_0000).to_be_bytes());
    }
}

/// Accumulate the 16-bit one's-complement sum of `data` onto `seed`
pub fn ones_complement_sum(data: &[u8], seed: u32) -> u32 {
    let mut sum = seed;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold carries and complement
pub fn checksum_fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header whose checksum field has been zeroed
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    checksum_fold(ones_complement_sum(header, 0))
}

/// TCP/UDP checksum over the IPv4 pseudo-header plus `segment`.
///
/// The segment's own checksum field must be zero when this is called.
pub fn transport_checksum_v4(src: &[u8; 4], dst: &[u8; 4], protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = ones_complement_sum(src, 0);
    sum = ones_complement_sum(dst, sum);
    sum = sum.wrapping_add(protocol as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    checksum_fold(ones_complement_sum(segment, sum))
}

/// TCP/UDP checksum over the IPv6 pseudo-header plus `segment`
pub fn transport_checksum_v6(
    src: &[u8; 16],
    dst: &[u8; 16],
    next_header: u8,
    segment: &[u8],
) -> u16 {
    let mut sum = ones_complement_sum(src, 0);
    sum = ones_complement_sum(dst, sum);
    let len = segment.len() as u32;
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xffff);
    sum = sum.wrapping_add(next_header as u32);
    checksum_fold(ones_complement_sum(segment, sum))
}
