//! SNI location inside QUIC Initial packets

use super::frames::FrameWalk;
use super::header::{is_initial, InitialHeader, PacketNumberLength};
use super::keys::{decrypt_initial, packet_number_length};
use super::reassembly::{EntryStore, LockedMap, ReassemblyCache};
use crate::tls::{self, SniSpan};
use std::sync::Arc;

/// Find the SNI in a decrypted Initial payload without reassembly.
///
/// Only the first CRYPTO frame at stream offset 0 is searched, and the
/// hostname must lie entirely inside it. A ClientHello whose first frame in
/// this packet has a nonzero offset is not handled here. The span is relative
/// to `plaintext`.
pub fn locate_in_frames(plaintext: &[u8]) -> Option<SniSpan> {
    let frame = FrameWalk::new(plaintext).find(|frame| frame.offset == 0)?;
    let span = tls::locate_in_handshake(frame.data, 0, frame.data.len())?;
    Some(span.shifted(frame.data_start))
}

/// Find the SNI in a reassembled CRYPTO stream starting at offset 0
pub fn locate_in_stream(stream: &[u8]) -> Option<SniSpan> {
    tls::locate_in_handshake(stream, 0, stream.len())
}

/// An SNI found in a QUIC Initial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuicSni {
    pub hostname: String,
    pub dcid: Vec<u8>,
    /// Hostname position in the original datagram. `None` when the hostname
    /// was only found after reassembling several packets.
    pub packet_span: Option<SniSpan>,
}

impl QuicSni {
    pub fn is_reassembled(&self) -> bool {
        self.packet_span.is_none()
    }
}

/// Runs the QUIC path: decrypt, try the single packet, then reassemble
pub struct QuicSniLocator<S: EntryStore = LockedMap> {
    cache: Arc<ReassemblyCache<S>>,
}

impl<S: EntryStore> Clone for QuicSniLocator<S> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<S: EntryStore> std::fmt::Debug for QuicSniLocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicSniLocator")
            .field("cache", &self.cache)
            .finish()
    }
}

impl<S: EntryStore> QuicSniLocator<S> {
    pub fn new(cache: Arc<ReassemblyCache<S>>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ReassemblyCache<S>> {
        &self.cache
    }

    /// Locate the SNI in one UDP payload.
    ///
    /// Anything that is not a decryptable client Initial yields `None`.
    pub fn locate(&self, datagram: &[u8]) -> Option<QuicSni> {
        if !is_initial(datagram) {
            return None;
        }
        let initial = decrypt_initial(datagram)?;

        if let Some(span) = locate_in_frames(&initial.plaintext) {
            let hostname = span.hostname(&initial.plaintext)?.to_owned();
            let packet_span = SniSpan {
                offset: initial.packet_offset(span.offset),
                len: span.len,
            };
            // drop fragments an earlier packet of this connection left behind
            self.cache.clear(&initial.dcid);
            log::debug!(
                "QUIC SNI {} at datagram offset {}",
                hostname,
                packet_span.offset
            );
            return Some(QuicSni {
                hostname,
                dcid: initial.dcid,
                packet_span: Some(packet_span),
            });
        }

        let stream = self.cache.assemble(&initial.dcid, &initial.plaintext)?;
        let span = locate_in_stream(&stream)?;
        let hostname = span.hostname(&stream)?.to_owned();
        // the hello is complete; nothing more to collect for this connection
        self.cache.clear(&initial.dcid);
        log::debug!(
            "QUIC SNI {} reassembled from {} stream bytes",
            hostname,
            stream.len()
        );
        Some(QuicSni {
            hostname,
            dcid: initial.dcid,
            packet_span: None,
        })
    }

    /// Offset of the protected payload in a long-header datagram.
    ///
    /// For unrecognised versions the packet-number length is assumed, which
    /// the returned [`PacketNumberLength`] records.
    pub fn payload_offset(&self, datagram: &[u8]) -> Option<(usize, PacketNumberLength)> {
        let header = InitialHeader::parse(datagram)?;
        let pn_len = packet_number_length(datagram, &header);
        Some((header.pn_offset + pn_len.len(), pn_len))
    }

    /// Forget a connection, e.g. on teardown
    pub fn clear(&self, dcid: &[u8]) -> bool {
        self.cache.clear(dcid)
    }
}
