//! A TFTP client (RFC 1350).
//!
//! The crate is layered bottom-up:
//!
//! - [`tftp`] encodes and decodes the five packet types.
//! - [`netascii`] converts between local line endings and NETASCII.
//! - [`socket`] carries packets over UDP behind the [`socket::Transport`] trait.
//! - [`processor`] holds the stop-and-wait state machines, free of any I/O.
//! - [`client`] drives a state machine over a transport and exposes
//!   [`TftpClient::receive_file`] and [`TftpClient::send_file`].

pub mod client;
pub mod netascii;
pub mod processor;
pub mod socket;
pub mod tftp;

pub use client::{ClientConfig, TftpClient};
pub use processor::{TransferError, TransferState};
pub use socket::{SocketError, TftpSocket, Transport};
pub use tftp::{ErrorCode, FileMode, Packet, PacketError};
