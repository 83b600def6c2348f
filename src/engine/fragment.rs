//! Fragmentation of the real packet
//!
//! Split positions come from the configuration and the SNI location. TCP
//! splitting produces independent segments; IP splitting produces IPv4
//! fragments of one checksummed segment. UDP datagrams can only be split at
//! the IP layer.

use crate::config::{FragmentationConfig, FragmentationStrategy};
use crate::packet::{IpVersion, Packet, UdpPacket, UDP_HEADER_LEN};
use crate::tls::SniSpan;
use crate::wire;

/// IPv4 fragment offsets are counted in 8-byte units
pub const IP_FRAGMENT_UNIT: usize = 8;

const IP_FLAG_DF: u16 = 0x4000;
const IP_FLAG_MF: u16 = 0x2000;

/// Split positions for one packet, ascending and deduplicated.
///
/// For [`FragmentationStrategy::Tcp`] positions index the transport payload.
/// For [`FragmentationStrategy::Ip`] they index the IP payload (transport
/// header included) and are multiples of [`IP_FRAGMENT_UNIT`]. Only positions
/// strictly inside the split range are returned.
pub fn split_points(
    strategy: FragmentationStrategy,
    config: &FragmentationConfig,
    payload_len: usize,
    transport_header_len: usize,
    sni: Option<SniSpan>,
) -> Vec<usize> {
    let mut candidates = Vec::with_capacity(2);
    if config.position > 0 {
        candidates.push(config.position);
    }
    if config.sni_midpoint {
        if let Some(span) = sni {
            candidates.push(span.midpoint());
        }
    }

    let mut points: Vec<usize> = match strategy {
        FragmentationStrategy::None => return Vec::new(),
        FragmentationStrategy::Tcp => candidates
            .into_iter()
            .filter(|&p| p > 0 && p < payload_len)
            .collect(),
        FragmentationStrategy::Ip => {
            let segment_len = transport_header_len + payload_len;
            candidates
                .into_iter()
                .map(|p| round_up(transport_header_len + p, IP_FRAGMENT_UNIT))
                .filter(|&p| p > 0 && p < segment_len)
                .collect()
        }
    };
    points.sort_unstable();
    points.dedup();
    points
}

fn round_up(value: usize, unit: usize) -> usize {
    value.div_ceil(unit) * unit
}

/// Consecutive `[start, end)` ranges cut at `points`
fn ranges(points: &[usize], len: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(points.len() + 1);
    let mut start = 0;
    for &p in points {
        out.push((start, p));
        start = p;
    }
    out.push((start, len));
    out
}

/// One TCP segment per payload range, each with its own sequence number and
/// valid checksums
pub fn split_tcp(packet: &Packet, points: &[usize]) -> Vec<Vec<u8>> {
    let payload = packet.payload();
    ranges(points, payload.len())
        .into_iter()
        .map(|(start, end)| {
            let mut segment = packet.with_payload(&payload[start..end]);
            segment.set_seq(packet.seq().wrapping_add(start as u32));
            segment.recompute_checksums();
            segment.into_bytes()
        })
        .collect()
}

/// IPv4 fragments of the packet's TCP segment.
///
/// `points` index the TCP segment and must be multiples of
/// [`IP_FRAGMENT_UNIT`]. The TCP checksum is computed once over the whole
/// segment; each fragment gets its own header checksum.
pub fn split_ipv4(packet: &Packet, points: &[usize]) -> Vec<Vec<u8>> {
    let mut whole = packet.clone();
    whole.recompute_checksums();
    fragment_datagram(whole.as_bytes(), whole.ip_header_len(), points)
}

/// IPv4 fragments of a UDP datagram, cut like [`split_ipv4`]
pub fn split_ipv4_udp(datagram: &UdpPacket, points: &[usize]) -> Vec<Vec<u8>> {
    let mut whole = datagram.clone();
    whole.recompute_checksums();
    fragment_datagram(whole.as_bytes(), whole.ip_header_len(), points)
}

fn fragment_datagram(whole: &[u8], ip_len: usize, points: &[usize]) -> Vec<Vec<u8>> {
    let header = &whole[..ip_len];
    let body = &whole[ip_len..];
    let pieces = ranges(points, body.len());
    let last = pieces.len() - 1;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let mut frag = Vec::with_capacity(ip_len + end - start);
            frag.extend_from_slice(header);
            frag.extend_from_slice(&body[start..end]);

            let total = frag.len() as u16;
            frag[2..4].copy_from_slice(&total.to_be_bytes());

            let old = u16::from_be_bytes([frag[6], frag[7]]);
            let mut flags_offset = (old & !(IP_FLAG_DF | IP_FLAG_MF | 0x1fff))
                | (start / IP_FRAGMENT_UNIT) as u16;
            if i < last {
                flags_offset |= IP_FLAG_MF;
            }
            frag[6..8].copy_from_slice(&flags_offset.to_be_bytes());

            frag[10..12].fill(0);
            let csum = wire::ipv4_header_checksum(&frag[..ip_len]);
            frag[10..12].copy_from_slice(&csum.to_be_bytes());
            frag
        })
        .collect()
}

/// Split `packet` per configuration.
///
/// Falls back to TCP splitting for IPv6 under the IP strategy, and to the
/// whole packet when no split point applies.
pub fn fragment(packet: &Packet, config: &FragmentationConfig, sni: Option<SniSpan>) -> Vec<Vec<u8>> {
    let mut strategy = config.strategy;
    if strategy == FragmentationStrategy::Ip && packet.ip_version() == IpVersion::V6 {
        log::debug!("IP fragmentation not supported for IPv6, splitting TCP segments instead");
        strategy = FragmentationStrategy::Tcp;
    }

    let points = split_points(
        strategy,
        config,
        packet.payload().len(),
        packet.tcp_header_len(),
        sni,
    );
    if points.is_empty() {
        log::debug!("No usable split point, sending packet whole");
        let mut whole = packet.clone();
        whole.recompute_checksums();
        return vec![whole.into_bytes()];
    }

    let mut pieces = match strategy {
        FragmentationStrategy::Ip => split_ipv4(packet, &points),
        _ => split_tcp(packet, &points),
    };
    if config.reverse {
        pieces.reverse();
    }
    log::debug!(
        "Split into {} {:?} pieces at {:?}{}",
        pieces.len(),
        strategy,
        points,
        if config.reverse { " (reversed)" } else { "" }
    );
    pieces
}

/// Split a UDP datagram per configuration.
///
/// Only IPv4 fragmentation applies, so the TCP strategy is carried out at the
/// IP layer. IPv6 datagrams and datagrams with no usable split point are sent
/// whole.
pub fn fragment_udp(datagram: &UdpPacket, config: &FragmentationConfig, sni: Option<SniSpan>) -> Vec<Vec<u8>> {
    let send_whole = || {
        let mut whole = datagram.clone();
        whole.recompute_checksums();
        vec![whole.into_bytes()]
    };

    if config.strategy == FragmentationStrategy::None {
        return send_whole();
    }
    if datagram.ip_version() == IpVersion::V6 {
        log::debug!("IPv6 UDP datagram cannot be fragmented here, sending whole");
        return send_whole();
    }

    let points = split_points(
        FragmentationStrategy::Ip,
        config,
        datagram.payload().len(),
        UDP_HEADER_LEN,
        sni,
    );
    if points.is_empty() {
        log::debug!("No usable split point, sending datagram whole");
        return send_whole();
    }

    let mut pieces = split_ipv4_udp(datagram, &points);
    if config.reverse {
        pieces.reverse();
    }
    log::debug!(
        "Split UDP datagram into {} IP fragments at {:?}{}",
        pieces.len(),
        points,
        if config.reverse { " (reversed)" } else { "" }
    );
    pieces
}
