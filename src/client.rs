// This module contains the client-side transfer driver.
//
// A transfer is started by calling receive_file or send_file on a TftpClient. Each call builds a
// processor for its direction and then runs the same loop until the processor reports a
// terminal action:
//
// 1. Carry out the actions the processor asked for. These are sending or resending packets,
//    writing a received block to the destination, or reading the next block from the source.
// 2. Wait for the next datagram, bounded by the per-receive timeout, and hand what happened to
//    the processor as an event.
//
// A received block is acknowledged only after it has been written and flushed.
// Only one packet is ever unacknowledged. The bytes of the last packet sent are kept so a
// retransmission is byte for byte identical to the original.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::netascii::{FromNetascii, ToNetascii};
use crate::processor::{
    DownloadProcessor, Event, Processor, ReadBlock, ResultAction, TransferError, UploadProcessor,
    WriteBlock,
};
use crate::socket::{SocketError, TftpSocket, Transport};
use crate::tftp::{ErrorCode, FileMode, Packet, DATA_BUFFER_SIZE, DEFAULT_PORT};

/// How long to wait for each reply before retransmitting.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// How many receive timeouts in a row end a transfer.
pub const DEFAULT_MAX_TIMEOUTS: u32 = 5;

/// Settings applied to every transfer a client runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// The server port requests are sent to when the caller has no better idea.
    pub port: u16,
    pub timeout: Duration,
    pub max_timeouts: u32,
    /// How long to keep answering a repeated final DATA block after a download completes.
    /// Zero disables lingering.
    pub linger: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            max_timeouts: DEFAULT_MAX_TIMEOUTS,
            linger: Duration::ZERO,
        }
    }
}

/// The sending half of a transfer. Remembers the last packet for retransmission.
struct Outbox<'a, T> {
    transport: &'a mut T,
    last_sent: Vec<u8>,
}

impl<'a, T: Transport> Outbox<'a, T> {
    fn new(transport: &'a mut T) -> Outbox<'a, T> {
        Outbox { transport, last_sent: Vec::new() }
    }

    async fn send(&mut self, packet: &Packet, dst: SocketAddr) -> Result<(), TransferError> {
        log::debug!("Sending {} to {}", packet, dst);
        self.last_sent = packet.to_bytes();
        self.transport.send_to(&self.last_sent, dst).await.map_err(TransferError::from)
    }

    async fn resend(&mut self, dst: SocketAddr) -> Result<(), TransferError> {
        log::debug!("Resending last packet ({} bytes) to {}", self.last_sent.len(), dst);
        self.transport.send_to(&self.last_sent, dst).await.map_err(TransferError::from)
    }

    async fn send_error(&mut self, code: ErrorCode, message: String, dst: SocketAddr) {
        log::debug!("Sending error {} '{}' to {}", code, message, dst);
        // Error packet is sent as a courtesy, we don't care how it goes.
        let _ = self.transport.send(&Packet::Error { code, message }, dst).await;
    }

    fn discard(&mut self) -> Result<(), TransferError> {
        let discarded = self.transport.discard_pending().map_err(TransferError::from)?;
        if discarded > 0 {
            log::debug!("Discarded {} queued datagrams", discarded);
        }
        Ok(())
    }

    async fn receive<D>(&mut self, ttl: Duration) -> Result<Event<D>, TransferError> {
        match self.transport.recv_with_timeout(ttl).await {
            Ok((packet, src)) => {
                log::debug!("Got {} from {}", packet, src);
                Ok(Event::Received { packet, src })
            }
            Err(SocketError::Timeout(_)) => Ok(Event::TimedOut),
            Err(SocketError::PacketParse(e)) => {
                log::warn!("Couldn't parse incoming datagram: {}", e);
                Ok(Event::Malformed(e))
            }
            Err(SocketError::IO(e)) => Err(TransferError::Socket(e)),
        }
    }
}

/// The local end of a transfer: where received blocks go, or where blocks to send come from.
trait LocalEnd {
    type Action;
    type Done;

    async fn perform(&mut self, action: Self::Action) -> io::Result<Self::Done>;
}

/// The destination of a download, decoding NETASCII on the way when asked to.
enum Sink<'a, W> {
    Octet(&'a mut W),
    NetAscii(FromNetascii<&'a mut W>),
}

impl<'a, W: AsyncWrite + Unpin> Sink<'a, W> {
    fn new(dst: &'a mut W, mode: FileMode) -> Sink<'a, W> {
        match mode {
            FileMode::Octet => Sink::Octet(dst),
            FileMode::NetAscii => Sink::NetAscii(FromNetascii::new(dst)),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Sink::Octet(w) => w.write_all(data).await,
            Sink::NetAscii(w) => w.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Octet(w) => w.flush().await,
            Sink::NetAscii(w) => w.flush().await,
        }
    }

    /// Flushes everything, including a CR held back by the NETASCII decoder.
    async fn finish(&mut self) -> io::Result<()> {
        match self {
            Sink::Octet(w) => w.flush().await,
            Sink::NetAscii(w) => w.finish().await,
        }
    }
}

impl<W: AsyncWrite + Unpin> LocalEnd for Sink<'_, W> {
    type Action = WriteBlock;
    type Done = ();

    // A block only counts as written once it has been flushed out of any buffering.
    async fn perform(&mut self, block: WriteBlock) -> io::Result<()> {
        self.write_all(&block.data).await?;
        if block.last {
            self.finish().await
        } else {
            self.flush().await
        }
    }
}

/// The source of an upload, encoding NETASCII on the way when asked to.
enum Source<'a, R> {
    Octet(&'a mut R),
    NetAscii(ToNetascii<&'a mut R>),
}

impl<'a, R: AsyncRead + Unpin> Source<'a, R> {
    fn new(src: &'a mut R, mode: FileMode) -> Source<'a, R> {
        match mode {
            FileMode::Octet => Source::Octet(src),
            FileMode::NetAscii => Source::NetAscii(ToNetascii::new(src)),
        }
    }
}

/// Fills a block from `reader`, stopping early only at the end of the data.
async fn read_block_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut block = vec![0; DATA_BUFFER_SIZE];
    let mut filled = 0;
    while filled < DATA_BUFFER_SIZE {
        let n = reader.read(&mut block[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    block.truncate(filled);
    Ok(block)
}

impl<R: AsyncRead + Unpin> LocalEnd for Source<'_, R> {
    type Action = ReadBlock;
    type Done = Vec<u8>;

    async fn perform(&mut self, _: ReadBlock) -> io::Result<Vec<u8>> {
        match self {
            Source::Octet(r) => read_block_from(r).await,
            Source::NetAscii(r) => read_block_from(r).await,
        }
    }
}

/// Runs a processor until it completes or fails.
async fn drive<T, P, L>(
    outbox: &mut Outbox<'_, T>,
    processor: &mut P,
    local: &mut L,
    ttl: Duration,
) -> Result<(), TransferError>
where
    T: Transport,
    P: Processor,
    L: LocalEnd<Action = P::Local, Done = P::Done>,
{
    let mut actions: VecDeque<ResultAction<P::Local>> = processor.start().into();
    loop {
        while let Some(action) = actions.pop_front() {
            match action {
                ResultAction::Send { packet, dst } => outbox.send(&packet, dst).await?,
                ResultAction::Resend { dst } => outbox.resend(dst).await?,
                ResultAction::SendError { code, message, dst } => {
                    outbox.send_error(code, message, dst).await
                }
                ResultAction::DiscardPending => outbox.discard()?,
                ResultAction::Local(action) => {
                    let event = match local.perform(action).await {
                        Ok(done) => Event::Local(done),
                        Err(e) => Event::LocalIo(e),
                    };
                    actions.extend(processor.process(event));
                }
                ResultAction::Complete => return Ok(()),
                ResultAction::Fail(e) => return Err(e),
            }
        }

        let event = outbox.receive(ttl).await?;
        actions.extend(processor.process(event));
    }
}

/// Keeps answering a repeated final DATA block until `linger` has passed or something else
/// arrives. Nothing that happens here can fail the transfer.
async fn linger<T: Transport>(
    outbox: &mut Outbox<'_, T>,
    processor: &mut DownloadProcessor,
    linger: Duration,
) {
    let deadline = Instant::now() + linger;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }

        let event = match outbox.receive(remaining).await {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Stopped lingering: {}", e);
                return;
            }
        };
        for action in processor.process(event) {
            match action {
                ResultAction::Resend { dst } => {
                    if let Err(e) = outbox.resend(dst).await {
                        log::warn!("Unable to resend final ACK: {}", e);
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// A TFTP client. Transfers run one at a time over the client's transport.
pub struct TftpClient<T = TftpSocket> {
    transport: T,
    config: ClientConfig,
    total_bytes_received: u64,
    total_bytes_sent: u64,
}

impl TftpClient<TftpSocket> {
    /// Opens a client on a random port of `local_ip`.
    pub fn open(local_ip: IpAddr, config: ClientConfig) -> Result<TftpClient<TftpSocket>, SocketError> {
        let sock = TftpSocket::bind_random(local_ip)?;
        log::info!("Client bound to {}", sock.local_addr()?);
        Ok(TftpClient::with_transport(sock, config))
    }

    /// Looks up `host`, returning the first address found.
    pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((host, port)).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses found for {host}"))
        })
    }
}

impl<T: Transport> TftpClient<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> TftpClient<T> {
        let mut client = TftpClient { transport, config, total_bytes_received: 0, total_bytes_sent: 0 };
        client.set_max_timeouts(config.max_timeouts);
        client
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn set_default_port(&mut self, port: u16) {
        self.config.port = port;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// Sets how many receive timeouts in a row end a transfer. Values below 1 count as 1.
    pub fn set_max_timeouts(&mut self, max_timeouts: u32) {
        self.config.max_timeouts = max_timeouts.max(1);
    }

    pub fn set_linger(&mut self, linger: Duration) {
        self.config.linger = linger;
    }

    /// Payload bytes received by the last download, as they travelled on the wire.
    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    /// Payload bytes sent by the last upload, as they travelled on the wire.
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// Fetches `filename` from the server at `host:port` into `dst`, returning how many payload
    /// bytes arrived.
    ///
    /// Data is written to `dst` as it arrives, so a failed transfer may leave partial output
    /// behind. Deciding what to do with it is up to the caller.
    pub async fn receive_file<W>(
        &mut self,
        filename: &str,
        mode: FileMode,
        dst: &mut W,
        host: IpAddr,
        port: u16,
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let target = SocketAddr::new(host, port);
        log::info!("Requesting '{}' from {} in {} mode", filename, target, mode);

        let mut processor = DownloadProcessor::new(filename, mode, target, self.config.max_timeouts);
        let mut sink = Sink::new(dst, mode);
        let mut outbox = Outbox::new(&mut self.transport);

        let result = drive(&mut outbox, &mut processor, &mut sink, self.config.timeout).await;
        self.total_bytes_received = processor.bytes_received();
        result?;

        if !self.config.linger.is_zero() {
            linger(&mut outbox, &mut processor, self.config.linger).await;
        }

        log::info!(
            "Received '{}' from {}, {} bytes",
            filename,
            processor.session().peer(),
            self.total_bytes_received
        );
        Ok(self.total_bytes_received)
    }

    /// Stores the contents of `src` on the server at `host:port` as `filename`.
    pub async fn send_file<R>(
        &mut self,
        filename: &str,
        mode: FileMode,
        src: &mut R,
        host: IpAddr,
        port: u16,
    ) -> Result<(), TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let target = SocketAddr::new(host, port);
        log::info!("Sending '{}' to {} in {} mode", filename, target, mode);

        let mut processor = UploadProcessor::new(filename, mode, target, self.config.max_timeouts);
        let mut source = Source::new(src, mode);
        let mut outbox = Outbox::new(&mut self.transport);

        let result = drive(&mut outbox, &mut processor, &mut source, self.config.timeout).await;
        self.total_bytes_sent = processor.bytes_sent();
        result?;

        log::info!(
            "Sent '{}' to {}, {} bytes",
            filename,
            processor.session().peer(),
            self.total_bytes_sent
        );
        Ok(())
    }
}
