// Client-side transfer state machines.
//
// A transfer is a strict stop-and-wait exchange: the client sends one packet (a request, a DATA
// block or an ACK), then waits for the single reply that moves the transfer forward. The
// processors in this module hold all of that state and decide what happens next, but perform no
// I/O. They consume one Event at a time (a packet arrived, a receive timed out, a local read or
// write finished) and answer with the ResultActions the caller must carry out, in order.
//
//   Idle --start--> AwaitingFirstReply --first reply latches TID--> Transferring --> Complete
//                          |                                             |
//                          +------------> TimedOut / ProtocolError / Aborted <-----+
//
// The server answers a request from a fresh port. That {address, port} pair is the transfer ID
// (TID) for the rest of the exchange; the first reply latches it and anything arriving from
// elsewhere afterwards is answered with an UnknownTid error and otherwise ignored.

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::socket::SocketError;
use crate::tftp::{ErrorCode, FileMode, Packet, PacketError, DATA_BUFFER_SIZE};

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Why a transfer ended without completing.
#[derive(Debug)]
pub enum TransferError {
    /// The peer stopped answering.
    Timeout { block: u16 },
    /// A datagram could not be decoded.
    MalformedPacket(PacketError),
    /// A well formed packet arrived that makes no sense at this point of the transfer.
    ProtocolViolation { block: u16, reason: String },
    /// The peer ended the transfer with an error packet.
    Peer { code: ErrorCode, message: String },
    /// Reading or writing the local data failed.
    LocalIo { offset: u64, source: io::Error },
    /// The socket itself failed.
    Socket(io::Error),
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransferError::MalformedPacket(e) => Some(e),
            TransferError::LocalIo { source, .. } => Some(source),
            TransferError::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Timeout { block } => {
                write!(f, "Connection timed out waiting on block {block}")
            }
            TransferError::MalformedPacket(e) => write!(f, "Bad packet: {e}"),
            TransferError::ProtocolViolation { block, reason } => {
                write!(f, "Protocol violation at block {block}: {reason}")
            }
            TransferError::Peer { code, message } => {
                write!(f, "Error code {code} received: '{message}'")
            }
            TransferError::LocalIo { offset, source } => {
                write!(f, "Local I/O failure at byte {offset}: {source}")
            }
            TransferError::Socket(e) => write!(f, "Socket I/O error: {e}"),
        }
    }
}

impl From<PacketError> for TransferError {
    fn from(e: PacketError) -> Self {
        TransferError::MalformedPacket(e)
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> Self {
        match e {
            SocketError::IO(e) => TransferError::Socket(e),
            SocketError::PacketParse(e) => e.into(),
            SocketError::Timeout(ttl) => TransferError::Socket(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("socket operation timed out after {ttl:?}"),
            )),
        }
    }
}

/// Where a transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingFirstReply,
    Transferring,
    Complete,
    TimedOut,
    ProtocolError,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            TransferState::Idle | TransferState::AwaitingFirstReply | TransferState::Transferring
        )
    }
}

/// Something that happened to a transfer. `D` is what a finished local operation hands back.
#[derive(Debug)]
pub enum Event<D> {
    /// A packet arrived from `src`.
    Received { packet: Packet, src: SocketAddr },
    /// A datagram arrived that could not be decoded.
    Malformed(PacketError),
    /// Nothing arrived within the receive timeout.
    TimedOut,
    /// The local operation asked for with [`ResultAction::Local`] finished.
    Local(D),
    /// Local data could not be read or written.
    LocalIo(io::Error),
}

/// Represents an action that the caller of a processor should take in
/// response to an event. `L` is the local operation the processor can ask for.
#[derive(Debug)]
pub enum ResultAction<L> {
    /// Send the packet and remember its bytes for retransmission.
    Send { packet: Packet, dst: SocketAddr },

    /// Send the remembered packet again, byte for byte.
    Resend { dst: SocketAddr },

    /// Send an error packet as a courtesy. It is never remembered or retransmitted.
    SendError { code: ErrorCode, message: String, dst: SocketAddr },

    /// Drop any datagrams already queued on the socket.
    DiscardPending,

    /// Carry out local I/O and report the outcome as [`Event::Local`] or [`Event::LocalIo`].
    Local(L),

    /// The transfer finished successfully.
    Complete,

    /// The transfer failed.
    Fail(TransferError),
}

/// Store a received block. Once it is safely written, answer with `Event::Local(())`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBlock {
    pub data: Vec<u8>,
    /// No more data follows, so anything still buffered must be written out too.
    pub last: bool,
}

/// Read up to one block of local data and answer with `Event::Local(block)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock;

/// The state machine driving one side of a transfer.
pub trait Processor {
    /// The local operation this direction asks for.
    type Local;
    /// What that operation hands back when it succeeds.
    type Done;

    /// Produces the request that opens the transfer.
    fn start(&mut self) -> Vec<ResultAction<Self::Local>>;

    /// Given an event, describes the actions the caller should take.
    fn process(&mut self, event: Event<Self::Done>) -> Vec<ResultAction<Self::Local>>;

    fn state(&self) -> TransferState;
}

/// Screening outcome for a reply's source address.
enum Admission<L> {
    Accepted,
    Rejected(Vec<ResultAction<L>>),
}

/// The state shared by uploads and downloads.
#[derive(Debug, Clone)]
pub struct Session {
    state: TransferState,
    /// Where the request was sent.
    target: SocketAddr,
    /// Where everything after the request goes; the TID once latched.
    peer: SocketAddr,
    latched: bool,
    timeouts: u32,
    max_timeouts: u32,
    /// The block most recently acknowledged, by us (download) or by the peer (upload).
    last_acked: Option<u16>,
}

impl Session {
    pub fn new(target: SocketAddr, max_timeouts: u32) -> Session {
        Session {
            state: TransferState::Idle,
            target,
            peer: target,
            latched: false,
            timeouts: 0,
            max_timeouts: max_timeouts.max(1),
            last_acked: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    fn begin(&mut self) {
        debug_assert_eq!(self.state, TransferState::Idle, "transfer started twice");
        self.state = TransferState::AwaitingFirstReply;
    }

    fn fail<L>(&mut self, state: TransferState, error: TransferError) -> Vec<ResultAction<L>> {
        log::warn!("Transfer with {} failed: {}", self.peer, error);
        self.state = state;
        vec![ResultAction::Fail(error)]
    }

    fn violation<L>(&mut self, block: u16, reason: String) -> Vec<ResultAction<L>> {
        self.fail(TransferState::ProtocolError, TransferError::ProtocolViolation { block, reason })
    }

    /// Tells the peer local I/O failed, then fails the transfer.
    fn local_failure<L>(&mut self, message: &str, offset: u64, source: io::Error) -> Vec<ResultAction<L>> {
        let mut actions = vec![ResultAction::SendError {
            code: ErrorCode::DiskFull,
            message: message.to_string(),
            dst: self.peer,
        }];
        actions.extend(self.fail(TransferState::Aborted, TransferError::LocalIo { offset, source }));
        actions
    }

    fn timed_out<L>(&mut self, block: u16) -> Vec<ResultAction<L>> {
        self.timeouts += 1;
        if self.timeouts >= self.max_timeouts {
            return self.fail(TransferState::TimedOut, TransferError::Timeout { block });
        }
        log::info!(
            "Timed out waiting on block {block}, trying again ({}/{})",
            self.timeouts,
            self.max_timeouts
        );
        vec![ResultAction::Resend { dst: self.peer }]
    }

    fn progressed(&mut self, acked: u16) {
        self.timeouts = 0;
        self.last_acked = Some(acked);
    }

    /// Checks where a reply came from, latching the TID on the first one.
    fn admit<L>(&mut self, src: SocketAddr) -> Admission<L> {
        if !self.latched {
            if src.port() == self.target.port() {
                self.state = TransferState::ProtocolError;
                let error = TransferError::ProtocolViolation {
                    block: 0,
                    reason: format!("reply came from the request port {}", src.port()),
                };
                return Admission::Rejected(vec![
                    ResultAction::SendError {
                        code: ErrorCode::UnknownTid,
                        message: "Incorrect source port".to_string(),
                        dst: src,
                    },
                    ResultAction::Fail(error),
                ]);
            }

            if src.ip() != self.target.ip() {
                log::info!("{} answered on behalf of {}", src.ip(), self.target.ip());
            }
            log::info!("Transfer ID latched to {}", src);
            self.latched = true;
            self.peer = src;
            self.state = TransferState::Transferring;
            return Admission::Accepted;
        }

        if src == self.peer {
            return Admission::Accepted;
        }

        log::warn!("Got a packet from {}, but the transfer is with {}", src, self.peer);
        Admission::Rejected(vec![
            ResultAction::SendError {
                code: ErrorCode::UnknownTid,
                message: "Unexpected host or port.".to_string(),
                dst: src,
            },
            ResultAction::Resend { dst: self.peer },
        ])
    }
}

///////////////////////////////////////////////////////////////
/// Receives a file: sends RRQ, then acknowledges each DATA block once it is written.
#[derive(Debug)]
pub struct DownloadProcessor {
    session: Session,
    path: String,
    mode: FileMode,
    /// The block number the next DATA packet must carry.
    expected: u16,
    last_len: usize,
    bytes_received: u64,
}

impl DownloadProcessor {
    pub fn new(path: &str, mode: FileMode, target: SocketAddr, max_timeouts: u32) -> DownloadProcessor {
        DownloadProcessor {
            session: Session::new(target, max_timeouts),
            path: path.to_string(),
            mode,
            expected: 1,
            last_len: 0,
            bytes_received: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Payload bytes accepted so far, as they arrived on the wire.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    fn process_data(&mut self, block: u16, data: Vec<u8>) -> Vec<ResultAction<WriteBlock>> {
        if block == self.expected {
            self.session.progressed(block);
            self.expected = block.wrapping_add(1);
            self.last_len = data.len();
            self.bytes_received += data.len() as u64;

            let last = data.len() < DATA_BUFFER_SIZE;
            return vec![ResultAction::Local(WriteBlock { data, last })];
        }

        if Some(block) == self.session.last_acked {
            // Our ACK was lost and the peer sent the block again.
            log::warn!("Got block {block} again, acknowledging it again");
            return vec![ResultAction::DiscardPending, ResultAction::Resend { dst: self.session.peer }];
        }

        let expected = self.expected;
        self.session.violation(expected, format!("received block {block} while expecting block {expected}"))
    }

    // The block just accepted is on disk, so it can be acknowledged.
    fn process_written(&mut self) -> Vec<ResultAction<WriteBlock>> {
        let block = self.expected.wrapping_sub(1);
        let mut actions = vec![ResultAction::Send { packet: Packet::Ack { block }, dst: self.session.peer }];
        if self.last_len < DATA_BUFFER_SIZE {
            log::info!("Received final block {block}, {} bytes in total", self.bytes_received);
            self.session.state = TransferState::Complete;
            actions.push(ResultAction::Complete);
        }
        actions
    }

    // After the final ACK the only useful reply is to a repeat of the final block.
    fn process_after_completion(&mut self, event: Event<()>) -> Vec<ResultAction<WriteBlock>> {
        match event {
            Event::Received { packet: Packet::Data { block, .. }, src }
                if src == self.session.peer && Some(block) == self.session.last_acked =>
            {
                log::info!("Final block {block} repeated, acknowledging again");
                vec![ResultAction::Resend { dst: src }]
            }
            _ => vec![ResultAction::Complete],
        }
    }
}

impl Processor for DownloadProcessor {
    type Local = WriteBlock;
    type Done = ();

    fn start(&mut self) -> Vec<ResultAction<WriteBlock>> {
        self.session.begin();
        vec![ResultAction::Send {
            packet: Packet::ReadReq { path: self.path.clone(), mode: self.mode },
            dst: self.session.target,
        }]
    }

    fn process(&mut self, event: Event<()>) -> Vec<ResultAction<WriteBlock>> {
        if self.session.state == TransferState::Complete {
            return self.process_after_completion(event);
        }

        match event {
            Event::Received { packet, src } => {
                if let Admission::Rejected(actions) = self.session.admit(src) {
                    return actions;
                }
                match packet {
                    Packet::Data { block, data } => self.process_data(block, data),
                    Packet::Error { code, message } => {
                        self.session.fail(TransferState::Aborted, TransferError::Peer { code, message })
                    }
                    other => {
                        let expected = self.expected;
                        self.session.violation(expected, format!("received unexpected packet {other}"))
                    }
                }
            }
            Event::Local(()) => self.process_written(),
            Event::Malformed(e) => self.session.fail(TransferState::ProtocolError, e.into()),
            Event::TimedOut => {
                let expected = self.expected;
                self.session.timed_out(expected)
            }
            Event::LocalIo(source) => {
                let offset = self.bytes_received - self.last_len as u64;
                self.session.local_failure("File write failed.", offset, source)
            }
        }
    }

    fn state(&self) -> TransferState {
        self.session.state
    }
}

///////////////////////////////////////////////////////////////
/// Sends a file: sends WRQ, then one DATA block per acknowledgement.
#[derive(Debug)]
pub struct UploadProcessor {
    session: Session,
    path: String,
    mode: FileMode,
    /// The block awaiting acknowledgement; 0 while the WRQ is outstanding.
    block: u16,
    final_sent: bool,
    bytes_sent: u64,
}

impl UploadProcessor {
    pub fn new(path: &str, mode: FileMode, target: SocketAddr, max_timeouts: u32) -> UploadProcessor {
        UploadProcessor {
            session: Session::new(target, max_timeouts),
            path: path.to_string(),
            mode,
            block: 0,
            final_sent: false,
            bytes_sent: 0,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Payload bytes handed to the wire so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn process_ack(&mut self, block: u16) -> Vec<ResultAction<ReadBlock>> {
        if block == self.block {
            self.session.progressed(block);
            if self.final_sent {
                log::info!("Final block {block} acknowledged, {} bytes in total", self.bytes_sent);
                self.session.state = TransferState::Complete;
                return vec![ResultAction::Complete];
            }
            return vec![ResultAction::Local(ReadBlock)];
        }

        if Some(block) == self.session.last_acked {
            // A late duplicate. Answering it with DATA would double every later block.
            log::warn!("Got a repeated ACK for block {block}, ignoring it");
            return vec![ResultAction::DiscardPending];
        }

        let expected = self.block;
        self.session.violation(expected, format!("received ACK for block {block} while expecting block {expected}"))
    }

    fn process_block(&mut self, data: Vec<u8>) -> Vec<ResultAction<ReadBlock>> {
        debug_assert!(data.len() <= DATA_BUFFER_SIZE);
        self.block = self.block.wrapping_add(1);
        self.final_sent = data.len() < DATA_BUFFER_SIZE;
        self.bytes_sent += data.len() as u64;
        vec![ResultAction::Send {
            packet: Packet::Data { block: self.block, data },
            dst: self.session.peer,
        }]
    }
}

impl Processor for UploadProcessor {
    type Local = ReadBlock;
    type Done = Vec<u8>;

    fn start(&mut self) -> Vec<ResultAction<ReadBlock>> {
        self.session.begin();
        vec![ResultAction::Send {
            packet: Packet::WriteReq { path: self.path.clone(), mode: self.mode },
            dst: self.session.target,
        }]
    }

    fn process(&mut self, event: Event<Vec<u8>>) -> Vec<ResultAction<ReadBlock>> {
        match event {
            Event::Received { packet, src } => {
                if let Admission::Rejected(actions) = self.session.admit(src) {
                    return actions;
                }
                match packet {
                    Packet::Ack { block } => self.process_ack(block),
                    Packet::Error { code, message } => {
                        self.session.fail(TransferState::Aborted, TransferError::Peer { code, message })
                    }
                    other => {
                        let block = self.block;
                        self.session.violation(block, format!("received unexpected packet {other}"))
                    }
                }
            }
            Event::Local(data) => self.process_block(data),
            Event::Malformed(e) => self.session.fail(TransferState::ProtocolError, e.into()),
            Event::TimedOut => {
                let block = self.block;
                self.session.timed_out(block)
            }
            Event::LocalIo(source) => {
                let offset = self.bytes_sent;
                self.session.local_failure("File read failed.", offset, source)
            }
        }
    }

    fn state(&self) -> TransferState {
        self.session.state
    }
}
