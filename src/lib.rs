//! nfmangle: SNI-aware packet mangling for censorship evasion
//!
//! nfmangle sits behind a kernel packet queue and rewrites outbound TLS/QUIC
//! handshakes so that passive DPI middleboxes cannot read the requested
//! hostname, while the real server still receives a valid ClientHello.
//!
//! ## Features
//!
//! - **TLS SNI location**: bounds-checked ClientHello walk over untrusted bytes
//! - **QUIC Initial decryption**: v1 and v2 keys, header protection, AES-GCM
//! - **CRYPTO reassembly**: per-connection buffers with TTL and size eviction
//! - **Decoys**: fake ClientHellos with low TTL or broken checksums
//! - **Fragmentation**: TCP segments or IPv4 fragments split inside the SNI
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nfmangle::{Engine, EvasionConfig, RecordingSink, Verdict};
//!
//! let engine = Engine::new(EvasionConfig::default());
//! let sink = RecordingSink::new();
//! # let raw_packet: Vec<u8> = Vec::new();
//! let (verdict, error) = engine.handle(&raw_packet, &sink);
//! if verdict == Verdict::Drop {
//!     println!("replaced by {} packets", sink.len());
//! }
//! # let _ = error;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Packet queue│────▶│    Engine    │────▶│  PacketSink  │
//! │  (verdict)  │◀────│              │     │ (raw socket) │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!                       │          │
//!                  TLS  ▼          ▼  QUIC
//!              ┌──────────┐  ┌─────────────────┐
//!              │ tls::    │  │ quic::sni +     │
//!              │ locate   │  │ ReassemblyCache │
//!              └──────────┘  └─────────────────┘
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod packet;
pub mod quic;
pub mod tls;
pub mod wire;

pub use config::{
    EvasionConfig, FakePayloadKind, FakingConfig, FakingStrategy, FragmentationConfig,
    FragmentationStrategy, SequenceOffset, TlsConfig,
};
pub use engine::{ChannelSink, Engine, PacketSink, RecordingSink, Verdict};
pub use error::MangleError;
pub use packet::{Packet, UdpPacket};
pub use quic::{CacheLimits, QuicSni, QuicSniLocator, ReassemblyCache};
pub use tls::{locate_sni, ClientHelloBuilder, SniSpan};

#[cfg(target_os = "linux")]
pub use engine::RawSocketSink;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
