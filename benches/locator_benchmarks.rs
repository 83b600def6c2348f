use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nfmangle::quic::QuicVersion;
use nfmangle::{
    locate_sni, ClientHelloBuilder, Engine, EvasionConfig, FragmentationStrategy, QuicSniLocator,
    ReassemblyCache,
};
use std::sync::Arc;

#[path = "../tests/common/mod.rs"]
mod common;

/// TLS SNI walk over hellos with growing extension blocks
fn bench_tls_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("tls_locate");

    for padding in [0usize, 512, 4096] {
        let hello = ClientHelloBuilder::new("www.example.com")
            .extension(0x0015, &vec![0u8; padding])
            .server_name_last()
            .build();
        group.throughput(Throughput::Bytes(hello.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(padding), &hello, |b, hello| {
            b.iter(|| locate_sni(black_box(hello)));
        });
    }

    group.finish();
}

/// Full engine pass per fragmentation strategy
fn bench_engine_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_process");
    let hello = ClientHelloBuilder::new("blocked.example.net").build();
    let raw = common::ipv4_tcp(443, common::ACK_PSH, &hello);
    let sink = |_: &[u8]| -> std::io::Result<()> { Ok(()) };

    for (name, strategy) in [
        ("none", FragmentationStrategy::None),
        ("tcp", FragmentationStrategy::Tcp),
        ("ip", FragmentationStrategy::Ip),
    ] {
        let mut config = EvasionConfig::default();
        config.fragmentation.strategy = strategy;
        config.faking.enabled = true;
        let engine = Engine::new(config);
        group.bench_function(name, |b| {
            b.iter(|| engine.process(black_box(&raw), &sink));
        });
    }

    group.finish();
}

/// Initial key derivation, decryption and SNI walk
fn bench_quic_locate(c: &mut Criterion) {
    let mut group = c.benchmark_group("quic_locate");
    let hello = ClientHelloBuilder::new("video.example.org").build_handshake();
    let plaintext = common::padded(&[common::crypto_frame(0, &hello)]);
    let locator = QuicSniLocator::new(Arc::new(ReassemblyCache::new(Default::default())));

    for version in [QuicVersion::V1, QuicVersion::V2] {
        let sealed = common::seal_initial(version, &[1, 2, 3, 4, 5, 6, 7, 8], 0, 2, &plaintext);
        group.throughput(Throughput::Bytes(sealed.datagram.len() as u64));
        group.bench_function(format!("{:?}", version), |b| {
            b.iter(|| locator.locate(black_box(&sealed.datagram)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tls_locate, bench_engine_process, bench_quic_locate);
criterion_main!(benches);
