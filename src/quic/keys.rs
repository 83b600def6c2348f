//! QUIC Initial packet protection (RFC 9001 §5)
//!
//! Initial keys are derived from a public salt and the client's DCID, so any
//! observer can remove them. Only the client direction is derived here.

use super::header::{InitialHeader, PacketNumberLength};
use super::version::QuicVersion;
use ring::aead::{self, quic};
use ring::hkdf;

/// AES-128-GCM key length
pub const KEY_LEN: usize = 16;

/// AEAD nonce length
pub const IV_LEN: usize = 12;

/// Header protection key length (AES-128)
pub const HP_KEY_LEN: usize = 16;

/// Header protection sample length
pub const SAMPLE_LEN: usize = 16;

/// The sample starts this far past the packet-number field start
pub const SAMPLE_OFFSET: usize = 4;

/// AES-GCM tag length
pub const TAG_LEN: usize = 16;

/// Client Initial key material
#[derive(Clone, PartialEq, Eq)]
pub struct InitialKeys {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub hp: [u8; HP_KEY_LEN],
}

impl std::fmt::Debug for InitialKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitialKeys").finish_non_exhaustive()
    }
}

impl InitialKeys {
    /// Derive the client Initial keys for `dcid`
    pub fn derive(version: QuicVersion, dcid: &[u8]) -> Option<Self> {
        let client_secret = client_initial_secret(version, dcid)?;
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &client_secret);

        let mut keys = Self {
            key: [0u8; KEY_LEN],
            iv: [0u8; IV_LEN],
            hp: [0u8; HP_KEY_LEN],
        };
        hkdf_expand_label(&prk, version.key_label(), &mut keys.key)?;
        hkdf_expand_label(&prk, version.iv_label(), &mut keys.iv)?;
        hkdf_expand_label(&prk, version.hp_label(), &mut keys.hp)?;
        Some(keys)
    }

    /// Header protection mask for a 16-byte sample (AES-ECB, first 5 bytes)
    pub fn header_mask(&self, sample: &[u8]) -> Option<[u8; 5]> {
        header_mask(&self.hp, sample)
    }

    /// AEAD nonce for a packet number
    pub fn nonce(&self, packet_number: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (n, p) in nonce[IV_LEN - 8..].iter_mut().zip(packet_number.to_be_bytes()) {
            *n ^= p;
        }
        nonce
    }
}

/// `client_initial_secret = HKDF-Expand-Label(HKDF-Extract(salt, dcid), "client in", "", 32)`
pub fn client_initial_secret(version: QuicVersion, dcid: &[u8]) -> Option<[u8; 32]> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, version.initial_salt());
    let initial_secret = salt.extract(dcid);
    let mut client_secret = [0u8; 32];
    hkdf_expand_label(&initial_secret, b"client in", &mut client_secret)?;
    Some(client_secret)
}

/// Header protection key alone, for learning the packet-number length
/// without deriving the payload keys
pub fn header_protection_key(version: QuicVersion, dcid: &[u8]) -> Option<[u8; HP_KEY_LEN]> {
    let client_secret = client_initial_secret(version, dcid)?;
    let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &client_secret);
    let mut hp = [0u8; HP_KEY_LEN];
    hkdf_expand_label(&prk, version.hp_label(), &mut hp)?;
    Some(hp)
}

fn header_mask(hp_key: &[u8], sample: &[u8]) -> Option<[u8; 5]> {
    let key = quic::HeaderProtectionKey::new(&quic::AES_128, hp_key).ok()?;
    key.new_mask(sample.get(..SAMPLE_LEN)?).ok()
}

/// HKDF-Expand-Label with an empty context (RFC 8446 §7.1)
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Option<()> {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let info = [&out_len[..], &label_len[..], PREFIX, label, &[0u8][..]];

    prk.expand(&info, OkmLen(out.len()))
        .ok()?
        .fill(out)
        .ok()
}

// ring wants a KeyType to size the output
struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Learn the packet-number length by removing header protection from the
/// first byte only.
///
/// For a version without known keys this falls back to assuming two bytes;
/// that result is marked [`PacketNumberLength::Assumed`].
pub fn packet_number_length(packet: &[u8], header: &InitialHeader) -> PacketNumberLength {
    let recovered = QuicVersion::from_wire(header.version)
        .and_then(|version| header_protection_key(version, &header.dcid))
        .and_then(|hp| {
            let start = header.pn_offset + SAMPLE_OFFSET;
            let sample = packet.get(start..start + SAMPLE_LEN)?;
            header_mask(&hp, sample)
        })
        .map(|mask| {
            let first = packet[0] ^ (mask[0] & 0x0f);
            (first & 0x03) as usize + 1
        });

    match recovered {
        Some(len) => PacketNumberLength::Recovered(len),
        None => {
            log::trace!(
                "QUIC version {:#010x}: header protection unavailable, assuming 2-byte packet number",
                header.version
            );
            PacketNumberLength::Assumed(2)
        }
    }
}

/// A decrypted client Initial packet
#[derive(Debug, Clone)]
pub struct DecryptedInitial {
    pub version: QuicVersion,
    pub dcid: Vec<u8>,
    /// Start of the packet-number field in the datagram
    pub pn_offset: usize,
    /// Packet-number length after header protection removal
    pub pn_len: usize,
    pub packet_number: u64,
    /// Decrypted frames
    pub plaintext: Vec<u8>,
}

impl DecryptedInitial {
    /// Map a plaintext offset back to the datagram.
    ///
    /// AES-GCM is a stream cipher over the payload, so plaintext byte `i`
    /// sits at ciphertext byte `pn_offset + pn_len + i`.
    pub fn packet_offset(&self, plaintext_offset: usize) -> usize {
        self.pn_offset + self.pn_len + plaintext_offset
    }
}

/// Remove header protection and decrypt a client Initial packet.
///
/// Any failure (unknown version, short sample, tag mismatch) yields `None`.
pub fn decrypt_initial(packet: &[u8]) -> Option<DecryptedInitial> {
    let header = InitialHeader::parse(packet)?;
    let version = QuicVersion::from_wire(header.version)?;
    let keys = InitialKeys::derive(version, &header.dcid)?;

    let sample_start = header.pn_offset + SAMPLE_OFFSET;
    let sample = packet.get(sample_start..sample_start + SAMPLE_LEN)?;
    let mask = keys.header_mask(sample)?;

    let first = packet[0] ^ (mask[0] & 0x0f);
    let pn_len = (first & 0x03) as usize + 1;
    let pn_end = header.pn_offset + pn_len;
    let payload_end = header.pn_offset + header.length;
    if pn_end + TAG_LEN > payload_end {
        log::trace!("QUIC Initial payload shorter than packet number and tag");
        return None;
    }

    let mut aad = Vec::with_capacity(pn_end);
    aad.push(first);
    aad.extend_from_slice(&packet[1..header.pn_offset]);
    let mut packet_number = 0u64;
    for (i, &b) in packet[header.pn_offset..pn_end].iter().enumerate() {
        let pn_byte = b ^ mask[1 + i];
        aad.push(pn_byte);
        packet_number = (packet_number << 8) | pn_byte as u64;
    }

    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &keys.key).ok()?;
    let key = aead::LessSafeKey::new(key);
    let nonce = aead::Nonce::assume_unique_for_key(keys.nonce(packet_number));

    let mut in_out = packet[pn_end..payload_end].to_vec();
    let plaintext_len = match key.open_in_place(nonce, aead::Aad::from(&aad), &mut in_out) {
        Ok(plaintext) => plaintext.len(),
        Err(_) => {
            log::trace!("QUIC Initial authentication failed (pn {})", packet_number);
            return None;
        }
    };
    in_out.truncate(plaintext_len);

    Some(DecryptedInitial {
        version,
        dcid: header.dcid,
        pn_offset: header.pn_offset,
        pn_len,
        packet_number,
        plaintext: in_out,
    })
}
