// NETASCII is ASCII with CR LF as the canonical line ending on the wire. Sending in netascii
// mode turns every bare LF into CR LF; receiving turns every CR LF back into the local line
// separator. Both directions are byte automata whose state survives across buffer boundaries,
// so a CR LF pair split between two reads or writes is still recognized.

use std::cmp;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::tftp::DATA_BUFFER_SIZE;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const CRLF: &[u8] = b"\r\n";

/// The local line separator written in place of a received CR LF.
#[cfg(windows)]
pub const LINE_SEPARATOR: &[u8] = b"\r\n";

/// The local line separator written in place of a received CR LF.
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &[u8] = b"\n";

/// Converts local bytes to NETASCII.
#[derive(Debug, Clone)]
pub struct NetasciiEncoder {
    last_was_cr: bool,
    passthrough: bool,
}

impl NetasciiEncoder {
    pub fn new() -> NetasciiEncoder {
        NetasciiEncoder::with_line_separator(LINE_SEPARATOR)
    }

    /// An encoder for data whose lines end in `separator`. CR LF data needs no conversion.
    pub fn with_line_separator(separator: &[u8]) -> NetasciiEncoder {
        NetasciiEncoder { last_was_cr: false, passthrough: separator == CRLF }
    }

    /// Appends the NETASCII form of `input` to `out`.
    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if self.passthrough {
            out.extend_from_slice(input);
            return;
        }

        for &byte in input {
            match byte {
                LF if !self.last_was_cr => out.extend_from_slice(CRLF),
                _ => out.push(byte),
            }
            self.last_was_cr = byte == CR;
        }
    }
}

impl Default for NetasciiEncoder {
    fn default() -> Self {
        NetasciiEncoder::new()
    }
}

/// Converts NETASCII to local bytes.
///
/// A CR is held back until the next byte shows whether it starts a CR LF pair. A CR still held
/// when the data ends is only released by [`NetasciiDecoder::finish`].
#[derive(Debug, Clone)]
pub struct NetasciiDecoder {
    line_separator: &'static [u8],
    held_cr: bool,
}

impl NetasciiDecoder {
    pub fn new() -> NetasciiDecoder {
        NetasciiDecoder::with_line_separator(LINE_SEPARATOR)
    }

    pub fn with_line_separator(separator: &'static [u8]) -> NetasciiDecoder {
        NetasciiDecoder { line_separator: separator, held_cr: false }
    }

    fn passthrough(&self) -> bool {
        self.line_separator == CRLF
    }

    /// Whether a trailing CR is waiting for the next byte.
    pub fn has_held_cr(&self) -> bool {
        self.held_cr
    }

    /// Appends the local form of `input` to `out`.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        if self.passthrough() {
            out.extend_from_slice(input);
            return;
        }

        for &byte in input {
            match byte {
                CR => {
                    if self.held_cr {
                        out.push(CR);
                    }
                    self.held_cr = true;
                }
                LF if self.held_cr => {
                    out.extend_from_slice(self.line_separator);
                    self.held_cr = false;
                }
                _ => {
                    if self.held_cr {
                        out.push(CR);
                        self.held_cr = false;
                    }
                    out.push(byte);
                }
            }
        }
    }

    /// Releases a held trailing CR, if any.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if self.held_cr {
            out.push(CR);
            self.held_cr = false;
        }
    }
}

impl Default for NetasciiDecoder {
    fn default() -> Self {
        NetasciiDecoder::new()
    }
}

/// Encodes a complete buffer to NETASCII.
pub fn to_netascii(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    NetasciiEncoder::new().encode(input, &mut out);
    out
}

/// Decodes a complete NETASCII buffer, including a trailing CR.
pub fn from_netascii(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut decoder = NetasciiDecoder::new();
    decoder.decode(input, &mut out);
    decoder.finish(&mut out);
    out
}

///////////////////////////////////////////////////////////////
/// A reader yielding the NETASCII form of the bytes read from `inner`.
#[derive(Debug)]
pub struct ToNetascii<R> {
    inner: R,
    encoder: NetasciiEncoder,
    pending: Vec<u8>,
    pos: usize,
}

impl<R> ToNetascii<R> {
    pub fn new(inner: R) -> ToNetascii<R> {
        ToNetascii::with_encoder(inner, NetasciiEncoder::new())
    }

    pub fn with_encoder(inner: R, encoder: NetasciiEncoder) -> ToNetascii<R> {
        ToNetascii { inner, encoder, pending: Vec::with_capacity(2 * DATA_BUFFER_SIZE), pos: 0 }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ToNetascii<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.pos == this.pending.len() {
            this.pending.clear();
            this.pos = 0;

            let mut scratch = [0u8; DATA_BUFFER_SIZE];
            let mut read_buf = ReadBuf::new(&mut scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                // EOF
                return Poll::Ready(Ok(()));
            }
            this.encoder.encode(filled, &mut this.pending);
        }

        let n = cmp::min(buf.remaining(), this.pending.len() - this.pos);
        buf.put_slice(&this.pending[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

///////////////////////////////////////////////////////////////
/// A writer passing the local form of NETASCII written to it on to `inner`.
///
/// Flushing never releases a held trailing CR, because the LF that pairs with it may arrive in
/// the next write. Call [`FromNetascii::finish`] (or shut the writer down) once the data ends.
#[derive(Debug)]
pub struct FromNetascii<W> {
    inner: W,
    decoder: NetasciiDecoder,
    pending: Vec<u8>,
    pos: usize,
}

impl<W> FromNetascii<W> {
    pub fn new(inner: W) -> FromNetascii<W> {
        FromNetascii::with_decoder(inner, NetasciiDecoder::new())
    }

    pub fn with_decoder(inner: W, decoder: NetasciiDecoder) -> FromNetascii<W> {
        FromNetascii { inner, decoder, pending: Vec::with_capacity(2 * DATA_BUFFER_SIZE), pos: 0 }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> FromNetascii<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.pending.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Writes out a held trailing CR and flushes, leaving `inner` open.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.decoder.finish(&mut self.pending);
        self.flush().await
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FromNetascii<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        this.decoder.decode(buf, &mut this.pending);
        // The input is consumed either way; a write still in progress completes on the next call.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.decoder.finish(&mut this.pending);
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
