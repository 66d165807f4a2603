//! Line framing over the session transport.
//!
//! Commands arrive as CRLF-terminated lines with a 998-octet content limit
//! (1000 octets on the wire). DATA mode reads dot-stuffed lines until the
//! lone-dot terminator; BDAT mode reads an exact octet count. Replies are
//! one or more lines sharing a 3-digit code, `-` separated on all but the
//! last line.
//!
//! Framing is done with an explicit buffer scan rather than `read_line` so
//! the length ceiling is enforced while bytes arrive, not after.

use crate::error::{Result, SmtpError};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Maximum octets of line content, terminator excluded (RFC 5321 §4.5.3.1.6).
pub const MAX_LINE_CONTENT: usize = 998;
/// Hard ceiling on the wire including CRLF.
pub const MAX_LINE_TOTAL: usize = 1000;

/// Unified stream type for plain and TLS connections, so STARTTLS can swap
/// the transport mid-session.
pub enum SmtpStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
    /// Transient state during STARTTLS upgrade; never observable by I/O.
    Upgrading,
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => panic!("I/O on stream during STARTTLS upgrade"),
        }
    }
}

/// A wire reply: 3-digit code plus one or more text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Self { code, lines }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i + 1 == self.lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }
}

/// One line of a DATA body, after dot-unstuffing.
#[derive(Debug, PartialEq, Eq)]
pub enum DataLine {
    Line(Vec<u8>),
    EndOfData,
}

/// Buffered reader/writer over the session transport.
pub struct SmtpConnection<S> {
    stream: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(8192),
            pos: 0,
        }
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 8192 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        self.compact();
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SmtpError::UnexpectedEof);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Read one line, terminator stripped. A trailing CR before the LF is
    /// removed as well, so both CRLF and bare-LF clients parse the same.
    pub async fn read_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(nl) = self.pending().iter().position(|&b| b == b'\n') {
                let mut line = self.buf[self.pos..self.pos + nl].to_vec();
                self.pos += nl + 1;
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_LINE_CONTENT {
                    return Err(SmtpError::LineTooLong);
                }
                return Ok(line);
            }
            if self.pending().len() > MAX_LINE_TOTAL {
                return Err(SmtpError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    /// Read one dot-stuffed body line. The lone dot ends the body; a leading
    /// dot on any other line is transparency padding and is removed.
    pub async fn read_data_line(&mut self) -> Result<DataLine> {
        let line = self.read_line().await?;
        if line == b"." {
            return Ok(DataLine::EndOfData);
        }
        if line.first() == Some(&b'.') {
            Ok(DataLine::Line(line[1..].to_vec()))
        } else {
            Ok(DataLine::Line(line))
        }
    }

    /// Make some buffered chunk bytes available, reading from the transport
    /// if the buffer is drained. Returns at most `max` bytes; the caller
    /// advances with [`consume`](Self::consume).
    pub async fn fill_chunk(&mut self, max: usize) -> Result<&[u8]> {
        if self.pending().is_empty() {
            self.fill().await?;
        }
        let available = self.pending().len().min(max);
        Ok(&self.buf[self.pos..self.pos + available])
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len() - self.pos);
        self.pos += n;
    }

    pub async fn write_reply(&mut self, reply: &Reply) -> Result<()> {
        self.stream.write_all(reply.to_wire().as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl SmtpConnection<SmtpStream> {
    /// Take the transport out for the STARTTLS handshake. Buffered plaintext
    /// is discarded: a client must not pipeline past STARTTLS, and anything
    /// it did send is untrusted.
    pub fn take_stream(&mut self) -> SmtpStream {
        self.buf.clear();
        self.pos = 0;
        std::mem::replace(&mut self.stream, SmtpStream::Upgrading)
    }

    pub fn set_stream(&mut self, stream: SmtpStream) {
        self.stream = stream;
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.stream, SmtpStream::Tls(_))
    }
}
