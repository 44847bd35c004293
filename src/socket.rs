use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::timeout;

use crate::tftp::{Packet, PacketError, PACKET_BUFFER_SIZE};

/// How many random ports to try before letting the OS pick one.
const BIND_ATTEMPTS: usize = 16;

/// One byte more than the largest valid datagram, so an oversized one is noticed instead of
/// silently truncated.
const RECV_BUFFER_SIZE: usize = PACKET_BUFFER_SIZE + 1;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(PacketError),
    Timeout(Duration),
}

impl error::Error for SocketError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            SocketError::IO(e) => Some(e),
            SocketError::PacketParse(e) => Some(e),
            SocketError::Timeout(_) => None,
        }
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout(ttl) => write!(f, "Socket IO timeout after {:?}", ttl),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        SocketError::PacketParse(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// The datagram service a transfer runs over. Every datagram names its own destination; nothing
/// is connected.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Sends one already encoded datagram.
    async fn send_to(&mut self, datagram: &[u8], dst: SocketAddr) -> TftpResult<()>;

    /// Waits up to `ttl` for the next datagram and decodes it.
    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)>;

    /// Drops every datagram that has already arrived, returning how many were dropped.
    fn discard_pending(&mut self) -> TftpResult<usize>;

    async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.send_to(&packet.to_bytes(), dst).await
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    buf: [u8; RECV_BUFFER_SIZE],
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            buf: [0; RECV_BUFFER_SIZE],
        })
    }

    /// Binds to a random unprivileged port on `ip`, which becomes this side's transfer ID.
    pub fn bind_random(ip: IpAddr) -> TftpResult<TftpSocket> {
        let mut rng = rand::thread_rng();
        for _ in 0..BIND_ATTEMPTS {
            let addr = SocketAddr::new(ip, rng.gen_range(1024..65535));
            match TftpSocket::bind(addr) {
                Ok(sock) => return Ok(sock),
                Err(e) => log::warn!("Couldn't bind socket to {}: {}", addr, e),
            }
        }
        TftpSocket::bind(SocketAddr::new(ip, 0))
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }
}

impl Transport for TftpSocket {
    async fn send_to(&mut self, datagram: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(datagram, dst).await?;
        Ok(())
    }

    async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut self.buf))
            .await
            .map_err(|_| SocketError::Timeout(ttl))??;
        if total_written > PACKET_BUFFER_SIZE {
            log::warn!("Datagram from {} is longer than {} bytes", src, PACKET_BUFFER_SIZE);
        }

        let packet = Packet::parse_from_buf(&self.buf[..total_written])?;
        Ok((packet, src))
    }

    fn discard_pending(&mut self) -> TftpResult<usize> {
        // The socket is non-blocking, so an empty queue reports WouldBlock.
        let mut discarded = 0;
        loop {
            match self.sock.get_ref().recv_from(&mut self.buf) {
                Ok(_) => discarded += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(discarded),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ============================================================================
// Mock transport for testing
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// What the scripted peer puts on the wire in answer to a datagram.
    #[derive(Debug, Clone)]
    pub enum Reply {
        Datagram(Vec<u8>, SocketAddr),
        /// Nothing arrives before the receive timeout.
        Timeout,
    }

    impl Reply {
        pub fn packet(packet: Packet, src: SocketAddr) -> Reply {
            Reply::Datagram(packet.to_bytes(), src)
        }
    }

    /// A transport whose far end is a closure called with every packet sent.
    pub struct MockTransport<F> {
        peer: F,
        pending: VecDeque<Reply>,
        pub sent: Vec<(Vec<u8>, SocketAddr)>,
        pub discards: usize,
    }

    impl<F> MockTransport<F>
    where
        F: FnMut(&Packet, SocketAddr) -> Vec<Reply>,
    {
        pub fn new(peer: F) -> Self {
            MockTransport { peer, pending: VecDeque::new(), sent: Vec::new(), discards: 0 }
        }

        pub fn sent_packets(&self) -> Vec<(Packet, SocketAddr)> {
            self.sent
                .iter()
                .map(|(bytes, dst)| (Packet::parse_from_buf(bytes).unwrap(), *dst))
                .collect()
        }
    }

    impl<F> Transport for MockTransport<F>
    where
        F: FnMut(&Packet, SocketAddr) -> Vec<Reply>,
    {
        async fn send_to(&mut self, datagram: &[u8], dst: SocketAddr) -> TftpResult<()> {
            self.sent.push((datagram.to_vec(), dst));
            let packet = Packet::parse_from_buf(datagram)?;
            let replies = (self.peer)(&packet, dst);
            self.pending.extend(replies);
            Ok(())
        }

        async fn recv_with_timeout(&mut self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
            match self.pending.pop_front() {
                Some(Reply::Datagram(bytes, src)) => Ok((Packet::parse_from_buf(&bytes)?, src)),
                Some(Reply::Timeout) | None => Err(SocketError::Timeout(ttl)),
            }
        }

        fn discard_pending(&mut self) -> TftpResult<usize> {
            self.discards += 1;
            // A scripted timeout marks the end of what has already arrived.
            let arrived = self
                .pending
                .iter()
                .take_while(|reply| matches!(reply, Reply::Datagram(..)))
                .count();
            self.pending.drain(..arrived);
            Ok(arrived)
        }
    }
}
