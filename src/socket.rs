//! Datagram transport for the protocol engine.
//!
//! [`TftpSocket`] wraps a UDP socket and speaks [`Packet`]s: it decodes on
//! receive and encodes on send. Receives are always bounded waits, so the
//! event loop above it stays responsive to timers and the stop flag.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::wire::{self, MalformedPacket, Packet};

/// Receive buffer size. Larger than any legal packet so oversize datagrams
/// arrive whole and get rejected by the codec instead of being truncated.
const RX_BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
pub enum SocketError {
    Io(io::Error),
    /// The datagram did not decode. Non-fatal: drop it and keep listening.
    Malformed(MalformedPacket),
    /// Nothing arrived within the bounded wait.
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::Io(e) => write!(f, "socket I/O error: {e}"),
            SocketError::Malformed(e) => write!(f, "{e}"),
            SocketError::Timeout(_) => write!(f, "receive wait elapsed"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::Io(e)
    }
}

impl From<MalformedPacket> for SocketError {
    fn from(e: MalformedPacket) -> Self {
        SocketError::Malformed(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

/// Deterministic receive-side fault injection, for exercising the retry path
/// in tests. Production sockets always use [`FaultPolicy::None`].
#[derive(Debug, Clone, Copy)]
pub enum FaultPolicy {
    None,
    /// Silently discard every Nth received datagram.
    DropEveryNth(u32),
}

pub struct TftpSocket {
    sock: Async<UdpSocket>,
    fault: FaultPolicy,
    received: u32,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> Result<TftpSocket, SocketError> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            fault: FaultPolicy::None,
            received: 0,
        })
    }

    /// Binds to a random high port, retrying on collision. The bound port
    /// becomes this side's TID.
    pub fn bind_ephemeral() -> Result<TftpSocket, SocketError> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut last = None;
        for _ in 0..32 {
            let port: u16 = rng.gen_range(1024..65535);
            match TftpSocket::bind((Ipv4Addr::UNSPECIFIED, port).into()) {
                Ok(sock) => return Ok(sock),
                Err(e) => {
                    log::warn!("could not bind port {port}: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            SocketError::Io(io::Error::new(io::ErrorKind::AddrInUse, "no free ephemeral port"))
        }))
    }

    pub fn with_fault_policy(mut self, fault: FaultPolicy) -> TftpSocket {
        self.fault = fault;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    fn drop_this_one(&mut self) -> bool {
        self.received += 1;
        match self.fault {
            FaultPolicy::None => false,
            FaultPolicy::DropEveryNth(n) => n > 0 && self.received % n == 0,
        }
    }

    /// Waits at most `ttl` for one datagram and decodes it.
    ///
    /// Returns `SocketError::Timeout` when nothing arrives and
    /// `SocketError::Malformed` when the datagram does not decode; both leave
    /// the socket usable.
    pub async fn recv_with_timeout(
        &mut self,
        ttl: Duration,
    ) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = [0u8; RX_BUFFER_SIZE];
        timeout(ttl, async {
            loop {
                let (len, src) = self.sock.recv_from(&mut buf).await?;
                if self.drop_this_one() {
                    log::trace!("fault policy dropped a {len}-byte datagram from {src}");
                    continue;
                }
                let packet = wire::decode(&buf[..len])?;
                return Ok((packet, src));
            }
        })
        .await?
    }

    /// Encodes and sends one packet. Returns the bytes that went on the wire
    /// so the caller can keep them for verbatim retransmission.
    pub async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> Result<Vec<u8>, SocketError> {
        let bytes = wire::encode(packet)?;
        self.sock.send_to(&bytes, dst).await?;
        Ok(bytes)
    }

    /// Resends previously encoded bytes exactly as first transmitted.
    pub async fn send_raw(&mut self, bytes: &[u8], dst: SocketAddr) -> Result<(), SocketError> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_pair() -> (TftpSocket, TftpSocket, SocketAddr) {
        let a = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let b = TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, b_addr)
    }

    #[tokio::test]
    async fn delivers_decoded_packets() {
        let (mut tx, mut rx, rx_addr) = localhost_pair();
        tx.send(&Packet::Ack { block: 7 }, rx_addr).await.unwrap();
        let (packet, src) = rx.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(packet, Packet::Ack { block: 7 });
        assert_eq!(src, tx.local_addr().unwrap());
    }

    #[tokio::test]
    async fn reports_malformed_datagrams_without_closing() {
        let (mut tx, mut rx, rx_addr) = localhost_pair();
        tx.send_raw(&[0xFF, 0xFF, 0x00, 0x00], rx_addr).await.unwrap();
        tx.send(&Packet::Ack { block: 1 }, rx_addr).await.unwrap();

        match rx.recv_with_timeout(Duration::from_secs(2)).await {
            Err(SocketError::Malformed(_)) => {}
            other => panic!("expected malformed error, got {other:?}"),
        }
        // Socket is still usable afterwards.
        let (packet, _) = rx.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(packet, Packet::Ack { block: 1 });
    }

    #[tokio::test]
    async fn times_out_when_nothing_arrives() {
        let (_tx, mut rx, _) = localhost_pair();
        match rx.recv_with_timeout(Duration::from_millis(20)).await {
            Err(SocketError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fault_policy_drops_every_nth() {
        let (mut tx, rx, rx_addr) = localhost_pair();
        let mut rx = rx.with_fault_policy(FaultPolicy::DropEveryNth(2));

        for block in 1..=4u16 {
            tx.send(&Packet::Ack { block }, rx_addr).await.unwrap();
        }

        let (first, _) = rx.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        let (second, _) = rx.recv_with_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(first, Packet::Ack { block: 1 });
        assert_eq!(second, Packet::Ack { block: 3 });
        assert!(matches!(
            rx.recv_with_timeout(Duration::from_millis(50)).await,
            Err(SocketError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn ephemeral_bind_yields_high_port() {
        let sock = TftpSocket::bind_ephemeral().unwrap();
        assert!(sock.local_addr().unwrap().port() >= 1024);
    }
}
