//! Verdicts for the literal packet scenarios the queue layer relies on

mod common;

use common::{ipv4_tcp, ACK_PSH, SYN};
use nfmangle::{
    ClientHelloBuilder, Engine, EvasionConfig, FragmentationStrategy, Packet, RecordingSink,
    Verdict,
};

fn hello(host: &str) -> Vec<u8> {
    ClientHelloBuilder::new(host).randomized().build()
}

fn engine_for(domains: &[&str], strategy: FragmentationStrategy) -> Engine {
    let mut config = EvasionConfig::default();
    config.tls.domains = domains.iter().map(|d| d.to_string()).collect();
    config.fragmentation.strategy = strategy;
    config.fragmentation.sni_midpoint = true;
    Engine::new(config)
}

#[test]
fn test_bare_buffer_is_accepted() {
    let engine = engine_for(&[], FragmentationStrategy::Tcp);
    let sink = RecordingSink::new();
    assert_eq!(engine.process(&[0u8; 10], &sink).unwrap(), Verdict::Accept);
    assert!(sink.is_empty());
}

#[test]
fn test_syn_to_443_continues() {
    let engine = engine_for(&[], FragmentationStrategy::Tcp);
    let raw = ipv4_tcp(443, SYN, &[]);
    assert_eq!(
        engine.process(&raw, &RecordingSink::new()).unwrap(),
        Verdict::Continue
    );
}

#[test]
fn test_port_80_is_accepted() {
    let engine = engine_for(&[], FragmentationStrategy::Tcp);
    let raw = ipv4_tcp(80, ACK_PSH, &hello("example.com"));
    assert_eq!(
        engine.process(&raw, &RecordingSink::new()).unwrap(),
        Verdict::Accept
    );
}

#[test]
fn test_tls_disabled_continues() {
    let engine = engine_for(&[], FragmentationStrategy::Tcp);
    let mut config = engine.config().clone();
    config.tls.enabled = false;

    let raw = ipv4_tcp(443, ACK_PSH, &hello("example.com"));
    let sink = RecordingSink::new();
    assert_eq!(
        engine.process_with(&config, &raw, &sink).unwrap(),
        Verdict::Continue
    );
    assert!(sink.is_empty());
}

#[test]
fn test_non_matching_domain_continues() {
    let engine = engine_for(&["blocked.example"], FragmentationStrategy::Ip);
    let raw = ipv4_tcp(443, ACK_PSH, &hello("allowed.example"));
    let sink = RecordingSink::new();
    assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Continue);
    assert!(sink.is_empty());
}

#[test]
fn test_matching_domain_ip_fragments_reconstruct_payload() {
    let engine = engine_for(&["blocked.example"], FragmentationStrategy::Ip);
    let payload = hello("www.blocked.example");
    let raw = ipv4_tcp(443, ACK_PSH, &payload);
    let sink = RecordingSink::new();

    assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);

    let fragments = sink.packets();
    assert!(fragments.len() >= 2);

    // reassemble by fragment offset, as the receiving host would
    let mut segment = Vec::new();
    for frag in &fragments {
        let ihl = ((frag[0] & 0x0f) as usize) * 4;
        let offset = (u16::from_be_bytes([frag[6], frag[7]]) & 0x1fff) as usize * 8;
        assert_eq!(offset, segment.len());
        segment.extend_from_slice(&frag[ihl..]);
    }
    let tcp_header_len = ((segment[12] >> 4) as usize) * 4;
    assert_eq!(&segment[tcp_header_len..], &payload[..]);
}

#[test]
fn test_matching_domain_tcp_segments_reconstruct_payload() {
    let engine = engine_for(&["blocked.example"], FragmentationStrategy::Tcp);
    let payload = hello("blocked.example");
    let raw = ipv4_tcp(443, ACK_PSH, &payload);
    let sink = RecordingSink::new();

    assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);

    let original = Packet::from_slice(&raw).unwrap();
    let mut joined = Vec::new();
    for raw in sink.packets() {
        let piece = Packet::from_slice(&raw).unwrap();
        assert!(piece.checksums_valid());
        assert_eq!(piece.seq(), original.seq().wrapping_add(joined.len() as u32));
        joined.extend_from_slice(piece.payload());
    }
    assert_eq!(joined, payload);
}

#[test]
fn test_handle_never_drops_on_failure() {
    let engine = engine_for(&[], FragmentationStrategy::Tcp);
    let raw = ipv4_tcp(443, ACK_PSH, &hello("example.com"));
    let failing = |_: &[u8]| -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no CAP_NET_RAW"))
    };
    let (verdict, err) = engine.handle(&raw, &failing);
    assert_eq!(verdict, Verdict::Accept);
    assert!(err.is_some());
}
