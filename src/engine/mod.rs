//! Evasion strategy engine
//!
//! Classifies one queued packet and, for a TLS ClientHello or QUIC Initial to
//! a matching host, replaces it with decoys and fragments sent through a
//! [`PacketSink`]. The returned [`Verdict`] tells the queue layer what to do
//! with the original.

pub mod fake;
pub mod fragment;
pub mod sink;

pub use sink::{ChannelSink, PacketSink, RecordingSink};

#[cfg(target_os = "linux")]
pub use sink::RawSocketSink;

use crate::config::{EvasionConfig, FragmentationStrategy};
use crate::error::MangleError;
use crate::packet::{Packet, UdpPacket, MIN_TCP_PACKET_LEN};
use crate::quic::{QuicSni, QuicSniLocator};
use crate::tls::{self, SniSpan};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// What the queue layer does with the original packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Pass the packet exactly as received
    Accept,
    /// Forward through the queue's default path
    Continue,
    /// Discard; substitutes were already sent
    Drop,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "accept"),
            Verdict::Continue => write!(f, "continue"),
            Verdict::Drop => write!(f, "drop"),
        }
    }
}

/// Packet-processing entry point, shared by all queue workers
#[derive(Debug, Clone)]
pub struct Engine {
    config: EvasionConfig,
    quic: Option<QuicSniLocator>,
}

impl Engine {
    pub fn new(config: EvasionConfig) -> Self {
        Self { config, quic: None }
    }

    /// Attach the QUIC locator and its reassembly cache
    pub fn with_quic(mut self, locator: QuicSniLocator) -> Self {
        self.quic = Some(locator);
        self
    }

    pub fn config(&self) -> &EvasionConfig {
        &self.config
    }

    pub fn quic(&self) -> Option<&QuicSniLocator> {
        self.quic.as_ref()
    }

    /// Locate the SNI in a UDP payload, if a QUIC locator is attached
    pub fn locate_quic_sni(&self, udp_payload: &[u8]) -> Option<QuicSni> {
        self.quic.as_ref()?.locate(udp_payload)
    }

    /// Process one raw IP packet with the engine's configuration
    pub fn process<S>(&self, raw: &[u8], sink: &S) -> Result<Verdict, MangleError>
    where
        S: PacketSink + ?Sized,
    {
        self.process_with(&self.config, raw, sink)
    }

    /// Process one raw IP packet with a configuration for this call only.
    ///
    /// `raw` is never modified. On `Ok(Verdict::Drop)` every substitute packet
    /// has been handed to `sink`.
    pub fn process_with<S>(
        &self,
        config: &EvasionConfig,
        raw: &[u8],
        sink: &S,
    ) -> Result<Verdict, MangleError>
    where
        S: PacketSink + ?Sized,
    {
        if raw.len() < MIN_TCP_PACKET_LEN {
            log::trace!("{}-byte packet too short, accepting", raw.len());
            return Ok(Verdict::Accept);
        }

        let packet = match Packet::from_slice(raw) {
            Some(packet) => packet,
            None => {
                return match UdpPacket::from_slice(raw) {
                    Some(datagram) => self.process_udp(config, datagram, sink),
                    None => Ok(Verdict::Accept),
                };
            }
        };
        if packet.dst_port() != config.tls.port {
            return Ok(Verdict::Accept);
        }

        if packet.is_syn() {
            return Ok(Verdict::Continue);
        }
        if !config.tls.enabled {
            return Ok(Verdict::Continue);
        }

        let Some(span) = tls::locate_sni(packet.payload()) else {
            return Ok(Verdict::Continue);
        };
        let hostname = span.hostname(packet.payload());

        if config.has_domain_filter() && !hostname.is_some_and(|h| config.matches_domain(h)) {
            log::debug!("SNI {:?} not in domain list, skipping", hostname);
            return Ok(Verdict::Continue);
        }

        log::debug!(
            "Mangling ClientHello for {} ({} payload bytes)",
            hostname.unwrap_or("<non-utf8>"),
            packet.payload().len()
        );
        self.mangle(config, packet, span, sink)?;
        Ok(Verdict::Drop)
    }

    /// Apply the verdict logic to a QUIC Initial whose SNI was located
    /// elsewhere, e.g. by [`Self::locate_quic_sni`].
    ///
    /// `raw` is the whole IP packet carrying the UDP datagram. An SNI that was
    /// only found after reassembly has no position in this packet, so the
    /// packet is forwarded with `Continue`.
    pub fn process_quic<S>(
        &self,
        config: &EvasionConfig,
        raw: &[u8],
        sni: &QuicSni,
        sink: &S,
    ) -> Result<Verdict, MangleError>
    where
        S: PacketSink + ?Sized,
    {
        match UdpPacket::from_slice(raw) {
            Some(datagram) if datagram.dst_port() == config.tls.port => {
                if !config.tls.enabled {
                    return Ok(Verdict::Continue);
                }
                self.mangle_quic(config, datagram, sni, sink)
            }
            _ => Ok(Verdict::Accept),
        }
    }

    fn process_udp<S>(
        &self,
        config: &EvasionConfig,
        datagram: UdpPacket,
        sink: &S,
    ) -> Result<Verdict, MangleError>
    where
        S: PacketSink + ?Sized,
    {
        if datagram.dst_port() != config.tls.port {
            return Ok(Verdict::Accept);
        }
        // without a locator UDP is not ours to judge
        let Some(locator) = self.quic.as_ref() else {
            return Ok(Verdict::Accept);
        };
        if !config.tls.enabled {
            return Ok(Verdict::Continue);
        }
        let Some(sni) = locator.locate(datagram.payload()) else {
            return Ok(Verdict::Continue);
        };
        self.mangle_quic(config, datagram, &sni, sink)
    }

    fn mangle_quic<S>(
        &self,
        config: &EvasionConfig,
        datagram: UdpPacket,
        sni: &QuicSni,
        sink: &S,
    ) -> Result<Verdict, MangleError>
    where
        S: PacketSink + ?Sized,
    {
        if config.has_domain_filter() && !config.matches_domain(&sni.hostname) {
            log::debug!("QUIC SNI {} not in domain list, skipping", sni.hostname);
            return Ok(Verdict::Continue);
        }
        let Some(span) = sni.packet_span else {
            log::debug!(
                "QUIC SNI {} was reassembled from earlier packets, forwarding",
                sni.hostname
            );
            return Ok(Verdict::Continue);
        };

        log::debug!(
            "Mangling QUIC Initial for {} ({} datagram bytes)",
            sni.hostname,
            datagram.payload().len()
        );
        let mut pacer = Pacer::new(sink, config.inter_segment_delay);
        if config.faking.enabled {
            for decoy in fake::build_udp_decoys(&datagram, &config.faking)? {
                pacer.send(decoy.as_bytes())?;
            }
        }
        for piece in fragment::fragment_udp(&datagram, &config.fragmentation, Some(span)) {
            pacer.send(&piece)?;
        }

        log::trace!("Sent {} packets", pacer.sent);
        Ok(Verdict::Drop)
    }

    /// Like [`Self::process`], but failures fall back to `Accept` so real
    /// traffic is never lost to an internal fault.
    pub fn handle<S>(&self, raw: &[u8], sink: &S) -> (Verdict, Option<MangleError>)
    where
        S: PacketSink + ?Sized,
    {
        match self.process(raw, sink) {
            Ok(verdict) => (verdict, None),
            Err(e) => {
                log::warn!("Packet processing failed, accepting original: {}", e);
                (Verdict::Accept, Some(e))
            }
        }
    }

    fn mangle<S>(
        &self,
        config: &EvasionConfig,
        mut packet: Packet,
        span: SniSpan,
        sink: &S,
    ) -> Result<(), MangleError>
    where
        S: PacketSink + ?Sized,
    {
        if config.tcp_window_override != 0 {
            packet.set_window(config.tcp_window_override);
            packet.recompute_checksums();
        }

        let mut pacer = Pacer::new(sink, config.inter_segment_delay);

        if config.faking.enabled {
            for decoy in fake::build_decoys(&packet, &config.faking)? {
                pacer.send(decoy.as_bytes())?;
            }
        }

        match config.fragmentation.strategy {
            FragmentationStrategy::None => {
                packet.recompute_checksums();
                pacer.send(packet.as_bytes())?;
            }
            FragmentationStrategy::Tcp | FragmentationStrategy::Ip => {
                for piece in fragment::fragment(&packet, &config.fragmentation, Some(span)) {
                    pacer.send(&piece)?;
                }
            }
        }

        log::trace!("Sent {} packets", pacer.sent);
        Ok(())
    }
}

/// Sends through a sink, pausing between consecutive packets
struct Pacer<'a, S: PacketSink + ?Sized> {
    sink: &'a S,
    delay: Duration,
    sent: usize,
}

impl<'a, S: PacketSink + ?Sized> Pacer<'a, S> {
    fn new(sink: &'a S, delay: Duration) -> Self {
        Self {
            sink,
            delay,
            sent: 0,
        }
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), MangleError> {
        if self.sent > 0 && !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.sink.send(packet).map_err(MangleError::Send)?;
        self.sent += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FakingStrategy;
    use crate::packet::tcp_flags;
    use crate::packet::tests::{ipv4_tcp, ipv4_udp, ipv6_tcp};
    use crate::quic::ReassemblyCache;
    use crate::tls::ClientHelloBuilder;
    use std::io;
    use std::sync::Arc;

    fn hello_packet(host: &str, port: u16) -> Vec<u8> {
        let hello = ClientHelloBuilder::new(host).build();
        ipv4_tcp(port, tcp_flags::ACK | tcp_flags::PSH, &hello)
    }

    fn tcp_payloads(packets: &[Vec<u8>]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|raw| Packet::from_slice(raw).unwrap().payload().to_vec())
            .collect()
    }

    #[test]
    fn test_short_and_foreign_packets_accept() {
        let engine = Engine::new(EvasionConfig::default());
        let sink = RecordingSink::new();
        assert_eq!(engine.process(&[0u8; 10], &sink).unwrap(), Verdict::Accept);
        assert_eq!(
            engine.process(&hello_packet("a.example", 80), &sink).unwrap(),
            Verdict::Accept
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_syn_and_disabled_continue() {
        let engine = Engine::new(EvasionConfig::default());
        let sink = RecordingSink::new();
        let syn = ipv4_tcp(443, tcp_flags::SYN, &[]);
        assert_eq!(engine.process(&syn, &sink).unwrap(), Verdict::Continue);

        let mut config = EvasionConfig::default();
        config.tls.enabled = false;
        let raw = hello_packet("a.example", 443);
        assert_eq!(
            engine.process_with(&config, &raw, &sink).unwrap(),
            Verdict::Continue
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_non_hello_payload_continues() {
        let engine = Engine::new(EvasionConfig::default());
        let raw = ipv4_tcp(443, tcp_flags::ACK, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(
            engine.process(&raw, &RecordingSink::new()).unwrap(),
            Verdict::Continue
        );
    }

    #[test]
    fn test_tcp_split_at_midpoint() {
        let engine = Engine::new(EvasionConfig::default());
        let raw = hello_packet("blocked.example.net", 443);
        let sink = RecordingSink::new();
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);

        let sent = sink.packets();
        assert_eq!(sent.len(), 2);
        let original = Packet::from_slice(&raw).unwrap();
        assert_eq!(tcp_payloads(&sent), original.payload());
        // hostname is not whole in either segment
        for raw in &sent {
            let piece = Packet::from_slice(raw).unwrap();
            assert!(tls::locate_sni(piece.payload()).is_none());
        }
    }

    #[test]
    fn test_no_fragmentation_sends_window_override() {
        let mut config = EvasionConfig::default();
        config.fragmentation.strategy = FragmentationStrategy::None;
        config.tcp_window_override = 40;
        let engine = Engine::new(config);

        let raw = hello_packet("blocked.example.net", 443);
        let sink = RecordingSink::new();
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);

        let sent = sink.packets();
        assert_eq!(sent.len(), 1);
        let packet = Packet::from_slice(&sent[0]).unwrap();
        assert_eq!(packet.window(), 40);
        assert!(packet.checksums_valid());
        // caller's buffer is untouched
        assert_eq!(Packet::from_slice(&raw).unwrap().window(), 0xfaf0);
    }

    #[test]
    fn test_decoys_precede_real_data() {
        let mut config = EvasionConfig::default();
        config.faking.enabled = true;
        config.faking.count = 2;
        config.faking.strategy = FakingStrategy::Ttl;
        config.faking.ttl = 3;
        let engine = Engine::new(config);

        let raw = hello_packet("blocked.example.net", 443);
        let sink = RecordingSink::new();
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);

        let sent = sink.packets();
        assert_eq!(sent.len(), 4);
        for decoy in &sent[..2] {
            let decoy = Packet::from_slice(decoy).unwrap();
            assert_eq!(decoy.ttl(), 3);
            let span = tls::locate_sni(decoy.payload()).unwrap();
            assert_eq!(span.hostname(decoy.payload()), Some("www.google.com"));
        }
        assert_eq!(tcp_payloads(&sent[2..]), Packet::from_slice(&raw).unwrap().payload());
    }

    #[test]
    fn test_domain_filter() {
        let mut config = EvasionConfig::default();
        config.tls.domains = vec!["example.net".into()];
        let engine = Engine::new(config);
        let sink = RecordingSink::new();

        let other = hello_packet("allowed.org", 443);
        assert_eq!(engine.process(&other, &sink).unwrap(), Verdict::Continue);

        let matching = hello_packet("cdn.example.net", 443);
        assert_eq!(engine.process(&matching, &sink).unwrap(), Verdict::Drop);
    }

    #[test]
    fn test_ipv6_hello() {
        let engine = Engine::new(EvasionConfig::default());
        let hello = ClientHelloBuilder::new("v6.example.net").build();
        let raw = ipv6_tcp(443, tcp_flags::ACK, &hello);
        let sink = RecordingSink::new();
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Drop);
        assert_eq!(tcp_payloads(&sink.packets()), hello);
    }

    #[test]
    fn test_send_failure_fails_open() {
        let engine = Engine::new(EvasionConfig::default());
        let raw = hello_packet("blocked.example.net", 443);
        let broken = |_: &[u8]| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "queue gone"))
        };

        assert!(matches!(
            engine.process(&raw, &broken),
            Err(MangleError::Send(_))
        ));
        let (verdict, err) = engine.handle(&raw, &broken);
        assert_eq!(verdict, Verdict::Accept);
        assert!(err.is_some());
    }

    #[test]
    fn test_synthesis_failure_fails_open() {
        let mut config = EvasionConfig::default();
        config.faking.enabled = true;
        config.faking.payload = crate::config::FakePayloadKind::Custom;
        let engine = Engine::new(config);
        let sink = RecordingSink::new();

        let (verdict, err) = engine.handle(&hello_packet("blocked.example.net", 443), &sink);
        assert_eq!(verdict, Verdict::Accept);
        assert!(matches!(err, Some(MangleError::Synthesis(_))));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_quic_locator_optional() {
        let engine = Engine::new(EvasionConfig::default());
        assert!(engine.quic().is_none());
        assert!(engine.locate_quic_sni(&[0xc0; 64]).is_none());

        let cache = Arc::new(ReassemblyCache::new(Default::default()));
        let engine = engine.with_quic(QuicSniLocator::new(cache));
        assert!(engine.quic().is_some());
        assert!(engine.locate_quic_sni(&[0x40; 64]).is_none());
    }

    #[test]
    fn test_inter_segment_delay() {
        let mut config = EvasionConfig::default();
        config.inter_segment_delay = Duration::from_millis(20);
        let engine = Engine::new(config);

        let start = std::time::Instant::now();
        let sink = RecordingSink::new();
        engine
            .process(&hello_packet("blocked.example.net", 443), &sink)
            .unwrap();
        // two fragments, one pause between them
        assert_eq!(sink.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    fn located(hostname: &str, packet_span: Option<SniSpan>) -> QuicSni {
        QuicSni {
            hostname: hostname.to_string(),
            dcid: vec![1, 2, 3, 4],
            packet_span,
        }
    }

    fn ip_payloads(fragments: &[Vec<u8>]) -> Vec<u8> {
        fragments.iter().flat_map(|f| f[20..].to_vec()).collect()
    }

    #[test]
    fn test_udp_needs_quic_locator() {
        let engine = Engine::new(EvasionConfig::default());
        let sink = RecordingSink::new();
        let raw = ipv4_udp(443, &[0xc0; 64]);
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Accept);

        let cache = Arc::new(ReassemblyCache::new(Default::default()));
        let engine = engine.with_quic(QuicSniLocator::new(cache));
        // not a decryptable Initial
        assert_eq!(engine.process(&raw, &sink).unwrap(), Verdict::Continue);
        assert_eq!(
            engine.process(&ipv4_udp(53, &[0xc0; 64]), &sink).unwrap(),
            Verdict::Accept
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_located_quic_sni_is_fragmented() {
        let mut config = EvasionConfig::default();
        config.tls.domains = vec!["example.net".into()];
        let engine = Engine::new(config.clone());
        let payload: Vec<u8> = (0..200u8).collect();
        let raw = ipv4_udp(443, &payload);
        let sink = RecordingSink::new();

        let sni = located("cdn.example.net", Some(SniSpan { offset: 80, len: 15 }));
        assert_eq!(
            engine.process_quic(&config, &raw, &sni, &sink).unwrap(),
            Verdict::Drop
        );
        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        let original = UdpPacket::from_slice(&raw).unwrap();
        assert_eq!(ip_payloads(&sent), original.segment());
    }

    #[test]
    fn test_quic_sni_outside_domains_or_reassembled_continues() {
        let mut config = EvasionConfig::default();
        config.tls.domains = vec!["example.net".into()];
        let engine = Engine::new(config.clone());
        let raw = ipv4_udp(443, &[0u8; 200]);
        let sink = RecordingSink::new();

        let other = located("allowed.org", Some(SniSpan { offset: 80, len: 11 }));
        assert_eq!(
            engine.process_quic(&config, &raw, &other, &sink).unwrap(),
            Verdict::Continue
        );
        let reassembled = located("cdn.example.net", None);
        assert_eq!(
            engine.process_quic(&config, &raw, &reassembled, &sink).unwrap(),
            Verdict::Continue
        );
        assert!(sink.is_empty());

        let tcp = hello_packet("cdn.example.net", 443);
        assert_eq!(
            engine.process_quic(&config, &tcp, &reassembled, &sink).unwrap(),
            Verdict::Accept
        );
    }
}
