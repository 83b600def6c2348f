//! Decoy packet synthesis
//!
//! Decoys copy the real packet's headers and carry a payload the middlebox
//! will parse first, while the faking strategy keeps them from being accepted
//! by the real server. TCP decoys and QUIC (UDP) decoys are built separately.

use crate::config::{FakePayloadKind, FakingConfig, FakingStrategy, SequenceOffset};
use crate::error::MangleError;
use crate::packet::{IpVersion, Packet, UdpPacket};
use crate::tls::ClientHelloBuilder;
use rand::Rng;

/// Largest TCP payload that still fits an IPv4/IPv6 length field with
/// maximal headers
const MAX_DECOY_PAYLOAD: usize = u16::MAX as usize - 120;

/// Decoy payload for one packet.
///
/// `original_len` sizes random payloads to match the real data.
pub fn fake_payload(config: &FakingConfig, original_len: usize) -> Result<Vec<u8>, MangleError> {
    let payload = match config.payload {
        FakePayloadKind::Default => ClientHelloBuilder::new(config.fake_sni.as_str())
            .randomized()
            .build(),
        FakePayloadKind::Custom => config
            .template
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MangleError::Synthesis("custom decoy has no template".into()))?,
        FakePayloadKind::Random => {
            let mut bytes = vec![0u8; original_len.max(1)];
            rand::thread_rng().fill(&mut bytes[..]);
            bytes
        }
    };

    if payload.len() > MAX_DECOY_PAYLOAD {
        return Err(MangleError::Synthesis(format!(
            "decoy payload of {} bytes does not fit one packet",
            payload.len()
        )));
    }
    Ok(payload)
}

/// Build `config.count` decoys from the real packet.
///
/// Decoys form one run of consecutive sequence space. Where the run starts
/// depends on [`SequenceOffset`]; `Past` places it so that it ends exactly
/// where the real data begins.
pub fn build_decoys(packet: &Packet, config: &FakingConfig) -> Result<Vec<Packet>, MangleError> {
    let count = config.count as usize;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut rng = rand::thread_rng();
    let payloads = (0..count)
        .map(|_| fake_payload(config, packet.payload().len()))
        .collect::<Result<Vec<_>, _>>()?;
    let run_len: usize = payloads.iter().map(Vec::len).sum();

    let mut seq = match config.seq_offset {
        SequenceOffset::Original => packet.seq(),
        SequenceOffset::Random => packet.seq().wrapping_add(rng.gen::<u32>()),
        SequenceOffset::Past => packet.seq().wrapping_sub(run_len as u32),
    };

    let mut decoys = Vec::with_capacity(count);
    for payload in &payloads {
        let mut decoy = packet.with_payload(payload);
        decoy.set_seq(seq);
        if decoy.ip_version() == IpVersion::V4 {
            decoy.set_ip_id(rng.gen());
        }
        if config.strategy == FakingStrategy::Ttl {
            decoy.set_ttl(config.ttl);
        }
        decoy.recompute_checksums();
        if config.strategy == FakingStrategy::TcpCheck {
            decoy.corrupt_tcp_checksum();
        }

        seq = seq.wrapping_add(payload.len() as u32);
        decoys.push(decoy);
    }

    log::trace!(
        "Built {} decoys ({:?}, {:?}, {} bytes)",
        decoys.len(),
        config.strategy,
        config.seq_offset,
        run_len
    );
    Ok(decoys)
}

/// Long-header first byte plus version, copied from the real Initial
const QUIC_PREFIX_LEN: usize = 5;

/// Decoy payload for a QUIC Initial.
///
/// `Custom` uses the template. `Default` and `Random` are random bytes as long
/// as the real datagram payload; `Default` keeps its first byte and version so
/// the decoy still classifies as an Initial of the same version.
pub fn fake_quic_payload(config: &FakingConfig, original: &[u8]) -> Result<Vec<u8>, MangleError> {
    let mut payload = match config.payload {
        FakePayloadKind::Custom => return fake_payload(config, original.len()),
        FakePayloadKind::Default | FakePayloadKind::Random => {
            let mut bytes = vec![0u8; original.len().max(1)];
            rand::thread_rng().fill(&mut bytes[..]);
            bytes
        }
    };
    if config.payload == FakePayloadKind::Default && original.len() >= QUIC_PREFIX_LEN {
        payload[..QUIC_PREFIX_LEN].copy_from_slice(&original[..QUIC_PREFIX_LEN]);
    }
    Ok(payload)
}

/// Build `config.count` decoy datagrams from a real QUIC Initial.
///
/// UDP has no sequence space, so [`SequenceOffset`] does not apply.
/// [`FakingStrategy::TcpCheck`] corrupts the UDP checksum instead.
pub fn build_udp_decoys(
    datagram: &UdpPacket,
    config: &FakingConfig,
) -> Result<Vec<UdpPacket>, MangleError> {
    let mut rng = rand::thread_rng();
    let mut decoys = Vec::with_capacity(config.count as usize);
    for _ in 0..config.count {
        let payload = fake_quic_payload(config, datagram.payload())?;
        let mut decoy = datagram.with_payload(&payload);
        if decoy.ip_version() == IpVersion::V4 {
            decoy.set_ip_id(rng.gen());
        }
        if config.strategy == FakingStrategy::Ttl {
            decoy.set_ttl(config.ttl);
        }
        decoy.recompute_checksums();
        if config.strategy == FakingStrategy::TcpCheck {
            decoy.corrupt_udp_checksum();
        }
        decoys.push(decoy);
    }

    log::trace!("Built {} QUIC decoys ({:?})", decoys.len(), config.strategy);
    Ok(decoys)
}
