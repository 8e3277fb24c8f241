use std::{
    fmt,
    io::{self, Read},
};

use crate::field::{Field, FieldError};

/// Wire layout of server responses: where the frame length and message tag
/// live, and how server error frames announce themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameConfig {
    pub len: Field,
    pub tag: Field,
    pub error_tag: u64,
    pub error_msg_len: Field,
    pub error_msg_off: u32,
}

#[derive(Debug)]
pub enum FrameError {
    /// Zero bytes where a frame header was expected: the peer closed cleanly
    /// between frames.
    EarlyEof,
    /// The stream ended inside the frame header.
    ShortRead { got: usize, want: usize },
    TooLong { len: u64, cap: usize },
    TooShort { len: u64, min: usize },
    /// The stream ended inside the frame body.
    Incomplete { got: usize, want: usize },
    ErrorMsgOutOfBounds { off: usize, len: usize, frame: usize },
    /// The frame carried the configured error tag; the payload message is
    /// surfaced verbatim.
    Server(String),
    Field(FieldError),
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EarlyEof => write!(f, "early EOF on connection"),
            Self::ShortRead { got, want } => {
                write!(f, "short read on frame header: {got} of {want} bytes")
            }
            Self::TooLong { len, cap } => {
                write!(f, "message too long: {len} bytes (buffer: {cap})")
            }
            Self::TooShort { len, min } => {
                write!(f, "message too short: {len} bytes (header: {min})")
            }
            Self::Incomplete { got, want } => {
                write!(f, "couldn't read complete message: {got} of {want} body bytes")
            }
            Self::ErrorMsgOutOfBounds { off, len, frame } => write!(
                f,
                "error message [{off}, {}) out of bounds for a {frame} byte frame",
                off.saturating_add(*len)
            ),
            Self::Server(msg) => write!(f, "received error: {msg}"),
            Self::Field(err) => err.fmt(f),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Field(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FieldError> for FrameError {
    fn from(err: FieldError) -> Self {
        Self::Field(err)
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
/// Interrupted reads are retried.
fn read_all<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(n)
}

impl FrameConfig {
    /// Consumes exactly one length-prefixed frame from `r` and returns its
    /// tag.
    ///
    /// The frame's self-declared total length covers the length prefix
    /// itself; it must fit `buf` and exceed the header region. A frame
    /// carrying `error_tag` is decoded as far as its embedded message and
    /// reported as [`FrameError::Server`]. Nothing else in the body is
    /// interpreted.
    pub fn receive_next<R: Read>(&self, r: &mut R, buf: &mut [u8]) -> Result<u64, FrameError> {
        let header = self.len.end();
        if header > buf.len() {
            return Err(FrameError::Field(FieldError::OutOfBounds {
                off: self.len.off,
                size: self.len.size,
                len: buf.len(),
            }));
        }
        let got = read_all(r, &mut buf[..header])?;
        if got == 0 {
            return Err(FrameError::EarlyEof);
        }
        if got < header {
            return Err(FrameError::ShortRead { got, want: header });
        }

        let total_len = self.len.read_uint(buf)?;
        if total_len > buf.len() as u64 {
            return Err(FrameError::TooLong { len: total_len, cap: buf.len() });
        }
        if total_len <= header as u64 {
            return Err(FrameError::TooShort { len: total_len, min: header });
        }
        let total_len = total_len as usize;

        let want = total_len - header;
        let got = read_all(r, &mut buf[header..total_len])?;
        if got < want {
            return Err(FrameError::Incomplete { got, want });
        }

        let frame = &buf[..total_len];
        let tag = self.tag.read_uint(frame)?;
        if tag == self.error_tag {
            let msg_len = self.error_msg_len.read_uint(frame)? as usize;
            let off = self.error_msg_off as usize;
            if off.saturating_add(msg_len) > total_len {
                return Err(FrameError::ErrorMsgOutOfBounds {
                    off,
                    len: msg_len,
                    frame: total_len,
                });
            }
            let msg = String::from_utf8_lossy(&frame[off..off + msg_len]).into_owned();
            return Err(FrameError::Server(msg));
        }
        Ok(tag)
    }
}
