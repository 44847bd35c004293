use std::error;
use std::fmt;

/// Well-known port a TFTP server listens on for requests.
pub const DEFAULT_PORT: u16 = 69;

/// Maximum payload carried by a single DATA packet. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Smallest datagram that can hold any TFTP packet: opcode plus a two byte field.
pub const MIN_PACKET_SIZE: usize = 4;

/// Largest datagram exchanged during a transfer: DATA header plus a full block.
pub const PACKET_BUFFER_SIZE: usize = DATA_BUFFER_SIZE + MIN_PACKET_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Reasons a datagram could not be decoded into a [`Packet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The datagram is shorter than [`MIN_PACKET_SIZE`].
    TooShort(usize),
    /// The opcode is not one of RRQ, WRQ, DATA, ACK or ERROR.
    BadOpcode(u16),
    /// A request ends before the filename terminator.
    Truncated,
    /// A request names a mode other than netascii or octet.
    UnknownMode(String),
    /// An error packet carries no room for its message.
    NoMessage,
    /// A DATA packet carries more than one block of payload.
    OversizedData(usize),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::TooShort(len) => write!(f, "datagram of {len} bytes is too short"),
            PacketError::BadOpcode(code) => write!(f, "unknown opcode {code}"),
            PacketError::Truncated => write!(f, "request is missing its filename terminator"),
            PacketError::UnknownMode(mode) => write!(f, "unrecognized transfer mode '{mode}'"),
            PacketError::NoMessage => write!(f, "error packet has no message"),
            PacketError::OversizedData(len) => {
                write!(f, "DATA payload of {len} bytes exceeds {DATA_BUFFER_SIZE}")
            }
        }
    }
}

/// Represents the mode a file is transferred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Text, with lines delimited by CR LF on the wire.
    NetAscii,
    /// Raw bytes.
    Octet,
}

impl FileMode {
    /// The mode name as written into a request.
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }

    /// Parses a mode name in any combination of case.
    pub fn from_wire(raw: &str) -> Result<FileMode, PacketError> {
        if raw.eq_ignore_ascii_case("netascii") {
            Ok(FileMode::NetAscii)
        } else if raw.eq_ignore_ascii_case("octet") {
            Ok(FileMode::Octet)
        } else {
            Err(PacketError::UnknownMode(raw.to_string()))
        }
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    /// A code outside the RFC 1350 table, kept as received.
    Other(u16),
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorCode::Undefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full or allocation exceeded",
            ErrorCode::Illegal => "illegal TFTP operation",
            ErrorCode::UnknownTid => "unknown transfer ID",
            ErrorCode::FileAlreadyExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
            ErrorCode::Other(_) => "unknown error",
        };
        write!(f, "{} ({})", name, u16::from(*self))
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// The TFTP opcodes, as carried in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, PacketError> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(PacketError::BadOpcode(rawcode)),
    }
}

// The mode may run to the end of the datagram without its own terminator.
fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), PacketError> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(PacketError::Truncated);
    }

    let (raw_mode, _) = string_from_buffer(&buf[path_end + 1..]);
    let mode = FileMode::from_wire(&raw_mode)?;

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> Result<Packet, PacketError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> Result<Packet, PacketError> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> Result<Packet, PacketError> {
    let payload = &buf[4..];
    if payload.len() > DATA_BUFFER_SIZE {
        return Err(PacketError::OversizedData(payload.len()));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(payload) })
}

fn parse_ack(buf: &[u8]) -> Result<Packet, PacketError> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() < MIN_PACKET_SIZE + 1 {
        return Err(PacketError::NoMessage);
    }

    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..]);
    Ok(Packet::Error { code, message })
}

impl Packet {
    /// Decodes a received datagram.
    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooShort(buf.len()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet into its wire form.
    ///
    /// Strings must not contain NUL bytes and a DATA payload must fit in one block; both are
    /// programmer errors rather than runtime conditions.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_BUFFER_SIZE);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                debug_assert!(!path.as_bytes().contains(&0), "filename contains a NUL byte");
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0);
            }
            Packet::Data { block, data } => {
                debug_assert!(data.len() <= DATA_BUFFER_SIZE, "data block too large");
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                debug_assert!(!message.as_bytes().contains(&0), "message contains a NUL byte");
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
        }

        buf
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Packet::ReadReq { path, mode } => write!(f, "RRQ <'{path}', {mode}>"),
            Packet::WriteReq { path, mode } => write!(f, "WRQ <'{path}', {mode}>"),
            Packet::Data { block, data } => write!(f, "DATA <block={block}, {} bytes>", data.len()),
            Packet::Ack { block } => write!(f, "ACK <block={block}>"),
            Packet::Error { code, message } => write!(f, "ERROR <{code}, '{message}'>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Octet }));
    }

    #[test]
    fn test_packet_write_req_mixed_case_mode() {
        let mut buf = vec![0x00, 0x02];
        buf.extend_from_slice(b"README.TXT\0NetASCII\0");

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::WriteReq { path: "README.TXT".to_string(), mode: FileMode::NetAscii }));
    }

    #[test]
    fn test_packet_req_mode_without_terminator() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"a\0octet");

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::ReadReq { path: "a".to_string(), mode: FileMode::Octet }));
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] }));
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::Ack { block: 0x102f }));
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal!
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet, Ok(Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() }));
    }

    #[test]
    fn test_packet_keeps_unknown_error_code() {
        let buf = vec![0x00, 0x05, 0x00, 0x2A, b'x', 0x00];
        let packet = Packet::parse_from_buf(&buf).unwrap();
        assert_eq!(packet, Packet::Error { code: ErrorCode::Other(42), message: "x".to_string() });
        assert_eq!(packet.to_bytes(), buf);
    }

    #[test]
    fn test_packet_parse_failures() {
        assert_eq!(Packet::parse_from_buf(&[0x10]), Err(PacketError::TooShort(1)));
        assert_eq!(Packet::parse_from_buf(&[0x10, 0x00]), Err(PacketError::TooShort(2)));
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x00]), Err(PacketError::BadOpcode(9)));
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x00, 0x00, 0x01]), Err(PacketError::BadOpcode(0)));
        // Filename never terminated
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]), Err(PacketError::Truncated));
        // Missing mode string
        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]),
            Err(PacketError::UnknownMode(String::new()))
        );
        // Invalid mode string
        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]),
            Err(PacketError::UnknownMode("bad".to_string()))
        );
        // Error packet without room for a message
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x05, 0x00, 0x01]), Err(PacketError::NoMessage));
        // One byte more than a full block
        let mut oversized = vec![0x00, 0x03, 0x00, 0x01];
        oversized.resize(PACKET_BUFFER_SIZE + 1, 0x61);
        assert_eq!(Packet::parse_from_buf(&oversized), Err(PacketError::OversizedData(513)));
        oversized.pop();
        assert!(Packet::parse_from_buf(&oversized).is_ok());
    }

    #[test]
    fn test_encode_wire_layout() {
        let rrq = Packet::ReadReq { path: "boot.img".to_string(), mode: FileMode::Octet };
        assert_eq!(rrq.to_bytes(), b"\x00\x01boot.img\x00octet\x00".to_vec());

        let wrq = Packet::WriteReq { path: "notes".to_string(), mode: FileMode::NetAscii };
        assert_eq!(wrq.to_bytes(), b"\x00\x02notes\x00netascii\x00".to_vec());

        let ack = Packet::Ack { block: 0x0102 };
        assert_eq!(ack.to_bytes(), vec![0x00, 0x04, 0x01, 0x02]);

        let err = Packet::Error { code: ErrorCode::UnknownTid, message: "who?".to_string() };
        assert_eq!(err.to_bytes(), b"\x00\x05\x00\x05who?\x00".to_vec());
    }

    #[test]
    fn test_packets_survive_encode_and_decode() {
        let packets = [
            Packet::ReadReq { path: "dir/file.bin".to_string(), mode: FileMode::Octet },
            Packet::WriteReq { path: "README.TXT".to_string(), mode: FileMode::NetAscii },
            Packet::Data { block: 0, data: vec![] },
            Packet::Data { block: 65535, data: vec![0x5A; DATA_BUFFER_SIZE] },
            Packet::Ack { block: 0 },
            Packet::Ack { block: 65535 },
            Packet::Error { code: ErrorCode::FileNotFound, message: String::new() },
            Packet::Error { code: ErrorCode::DiskFull, message: "File write failed.".to_string() },
        ];

        for packet in packets {
            assert_eq!(Packet::parse_from_buf(&packet.to_bytes()), Ok(packet.clone()));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Packet::Data { block: 3, data: vec![0; 12] }.to_string(), "DATA <block=3, 12 bytes>");
        assert_eq!(
            Packet::Error { code: ErrorCode::FileNotFound, message: "nope".to_string() }.to_string(),
            "ERROR <file not found (1), 'nope'>"
        );
    }
}
