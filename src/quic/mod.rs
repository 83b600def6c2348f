//! QUIC Initial inspection
//!
//! Just enough of RFC 9000/9001 to read the ClientHello a client sends in its
//! Initial packets:
//! - version: recognised versions and their salts and labels
//! - header: long-header parsing and packet-number length recovery
//! - keys: Initial key derivation, header protection, AES-GCM decryption
//! - frames: PADDING/PING/CRYPTO walk over the plaintext
//! - reassembly: per-DCID CRYPTO stream buffers with eviction
//! - sni: single-packet and reassembled SNI location

pub mod frames;
pub mod header;
pub mod keys;
pub mod reassembly;
pub mod sni;
pub mod version;

pub use header::{is_initial, InitialHeader, PacketNumberLength};
pub use keys::{decrypt_initial, packet_number_length, DecryptedInitial, InitialKeys};
pub use reassembly::{CacheLimits, EntryStore, LockedMap, ReassemblyCache, ReassemblyEntry};
pub use sni::{locate_in_frames, locate_in_stream, QuicSni, QuicSniLocator};
pub use version::QuicVersion;
