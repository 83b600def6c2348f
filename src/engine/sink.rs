//! Packet sinks
//!
//! The engine hands every crafted packet to a [`PacketSink`]. Sends are
//! synchronous: when `send` returns, the packet has been handed off or the
//! error is known.

use std::io;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Capability to emit a raw IP datagram
pub trait PacketSink {
    fn send(&self, packet: &[u8]) -> io::Result<()>;
}

impl<F> PacketSink for F
where
    F: Fn(&[u8]) -> io::Result<()>,
{
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self(packet)
    }
}

/// Forwards packets to an async task over an unbounded channel.
///
/// The send is confirmed once the packet is queued; the receiving task owns
/// actual delivery.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl PacketSink for ChannelSink {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet channel closed"))
    }
}

/// Keeps every packet it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets sent so far, in send order
    pub fn packets(&self) -> Vec<Vec<u8>> {
        self.lock().clone()
    }

    /// Drain the recorded packets
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.packets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PacketSink for RecordingSink {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.lock().push(packet.to_vec());
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use raw::RawSocketSink;

#[cfg(target_os = "linux")]
mod raw {
    use super::PacketSink;
    use crate::packet::destination_addr;
    use std::io;
    use std::mem;
    use std::net::IpAddr;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// Sends complete IP datagrams through raw sockets.
    ///
    /// Needs CAP_NET_RAW. With a firewall mark set, the host rules can let the
    /// crafted packets bypass the queue they were generated from.
    #[derive(Debug)]
    pub struct RawSocketSink {
        v4: OwnedFd,
        v6: Option<OwnedFd>,
    }

    impl RawSocketSink {
        pub fn open(mark: Option<u32>) -> io::Result<Self> {
            let v4 = open_raw(libc::AF_INET, mark)?;
            // IPv6 may be disabled on the host
            let v6 = match open_raw(libc::AF_INET6, mark) {
                Ok(fd) => Some(fd),
                Err(e) => {
                    log::warn!("IPv6 raw socket unavailable: {}", e);
                    None
                }
            };
            log::info!("Raw socket sink ready (mark: {:?})", mark);
            Ok(Self { v4, v6 })
        }
    }

    fn open_raw(domain: libc::c_int, mark: Option<u32>) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::socket(domain, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        if let Some(mark) = mark {
            let optval = mark as libc::c_int;
            let ret = unsafe {
                libc::setsockopt(
                    owned.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_MARK,
                    &optval as *const _ as *const libc::c_void,
                    mem::size_of_val(&optval) as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(owned)
    }

    fn send_to(
        fd: RawFd,
        packet: &[u8],
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
    ) -> io::Result<()> {
        let ret = unsafe {
            libc::sendto(
                fd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                addr,
                addr_len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl PacketSink for RawSocketSink {
        fn send(&self, packet: &[u8]) -> io::Result<()> {
            match destination_addr(packet) {
                Some(IpAddr::V4(ip)) => {
                    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
                    addr.sin_family = libc::AF_INET as libc::sa_family_t;
                    addr.sin_addr.s_addr = u32::from_ne_bytes(ip.octets());
                    send_to(
                        self.v4.as_raw_fd(),
                        packet,
                        &addr as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
                Some(IpAddr::V6(ip)) => {
                    let fd = self.v6.as_ref().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::Unsupported, "no IPv6 raw socket")
                    })?;
                    let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                    addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    addr.sin6_addr.s6_addr = ip.octets();
                    send_to(
                        fd.as_raw_fd(),
                        packet,
                        &addr as *const _ as *const libc::sockaddr,
                        mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    )
                }
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "not an IP datagram",
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink() {
        let count = std::cell::Cell::new(0);
        let sink = |packet: &[u8]| -> io::Result<()> {
            count.set(count.get() + packet.len());
            Ok(())
        };
        sink.send(&[1, 2, 3]).unwrap();
        PacketSink::send(&sink, &[4]).unwrap();
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.send(&[1]).unwrap();
        sink.send(&[2, 2]).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take(), vec![vec![1], vec![2, 2]]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.send(&[9, 9]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![9, 9]);

        drop(rx);
        let err = sink.send(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
