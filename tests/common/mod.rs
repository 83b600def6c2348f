//! Packet builders shared by the integration tests

#![allow(dead_code)]

use nfmangle::packet::{Packet, UdpPacket, IPPROTO_TCP, IPPROTO_UDP};
use nfmangle::quic::frames::FRAME_CRYPTO;
use nfmangle::quic::{InitialKeys, QuicVersion};
use nfmangle::wire::encode_varint;
use ring::aead;

pub const ACK_PSH: u8 = 0x18;
pub const SYN: u8 = 0x02;

/// IPv4/TCP packet from 10.1.1.2:41000 with valid checksums
pub fn ipv4_tcp(dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![
        0x45, 0x00, 0x00, 0x00, 0xbe, 0xef, 0x40, 0x00, 0x40, IPPROTO_TCP, 0x00, 0x00, 10, 1, 1,
        2, 142, 250, 74, 46,
    ];
    let total = (40 + payload.len()) as u16;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(&41_000u16.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&0x1000_0000u32.to_be_bytes());
    buf.extend_from_slice(&0x2000_0000u32.to_be_bytes());
    buf.extend_from_slice(&[0x50, flags, 0x40, 0x00, 0, 0, 0, 0]);
    buf.extend_from_slice(payload);

    let mut packet = Packet::parse_tcp(buf).expect("test packet parses");
    packet.recompute_checksums();
    packet.into_bytes()
}

/// IPv4/UDP datagram from 10.1.1.2:41001 with valid checksums
pub fn ipv4_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![
        0x45, 0x00, 0x00, 0x00, 0xca, 0xfe, 0x40, 0x00, 0x40, IPPROTO_UDP, 0x00, 0x00, 10, 1, 1,
        2, 142, 250, 74, 46,
    ];
    let total = (28 + payload.len()) as u16;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(&41_001u16.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(payload);

    let mut datagram = UdpPacket::parse_udp(buf).expect("test datagram parses");
    datagram.recompute_checksums();
    datagram.into_bytes()
}

/// CRYPTO frame carrying `data` at stream `offset`
pub fn crypto_frame(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut out = vec![FRAME_CRYPTO];
    encode_varint(offset, &mut out);
    encode_varint(data.len() as u64, &mut out);
    out.extend_from_slice(data);
    out
}

/// A protected client Initial, as a client would put on the wire
pub struct SealedInitial {
    pub datagram: Vec<u8>,
    /// Offset of the packet number field
    pub pn_offset: usize,
    pub pn_len: usize,
}

impl SealedInitial {
    /// Offset of the first protected payload byte
    pub fn payload_offset(&self) -> usize {
        self.pn_offset + self.pn_len
    }
}

/// Encrypt `plaintext` into a client Initial and apply header protection
pub fn seal_initial(
    version: QuicVersion,
    dcid: &[u8],
    packet_number: u32,
    pn_len: usize,
    plaintext: &[u8],
) -> SealedInitial {
    assert!((1..=4).contains(&pn_len));
    let keys = InitialKeys::derive(version, dcid).expect("known version");

    let mut header = vec![0xc0 | (version.initial_type_bits() << 4) | (pn_len as u8 - 1)];
    header.extend_from_slice(&version.to_wire().to_be_bytes());
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(0); // empty SCID
    encode_varint(0, &mut header); // no token
    let length = pn_len + plaintext.len() + aead::AES_128_GCM.tag_len();
    // fixed 2-byte varint, as most clients send
    header.extend_from_slice(&(0x4000 | length as u16).to_be_bytes());
    let pn_offset = header.len();
    header.extend_from_slice(&packet_number.to_be_bytes()[4 - pn_len..]);

    let key = aead::LessSafeKey::new(
        aead::UnboundKey::new(&aead::AES_128_GCM, &keys.key).expect("aes key"),
    );
    let nonce = aead::Nonce::assume_unique_for_key(keys.nonce(packet_number as u64));
    let mut payload = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::from(&header), &mut payload)
        .expect("seal");

    let mut datagram = header;
    datagram.extend_from_slice(&payload);

    let sample_start = pn_offset + 4;
    let mask = keys
        .header_mask(&datagram[sample_start..sample_start + 16])
        .expect("sample");
    datagram[0] ^= mask[0] & 0x0f;
    for i in 0..pn_len {
        datagram[pn_offset + i] ^= mask[1 + i];
    }

    SealedInitial {
        datagram,
        pn_offset,
        pn_len,
    }
}

/// Initial plaintext: frames followed by PADDING up to 1162 bytes
pub fn padded(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out: Vec<u8> = frames.concat();
    if out.len() < 1162 {
        out.resize(1162, 0);
    }
    out
}
