use std::net::SocketAddr;

use bytes::Bytes;
use mio::Token;

use crate::Error;

/// Transport family of a stream or listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Unix,
}

/// Observable lifecycle position of a stream.
///
/// Derived from `(io, resolving|connecting, readable, writable)`; never
/// stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    ReadOnly,
    WriteOnly,
    Closed,
}

/// Text encoding for data delivery and string writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    pub(crate) fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Ascii => bytes.iter().map(|b| (b & 0x7f) as char).collect(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encodes into `out`, returning the payload length actually written.
    pub(crate) fn encode_into(self, text: &str, out: &mut Vec<u8>) -> usize {
        match self {
            Encoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            Encoding::Ascii => out.extend(text.chars().map(|c| (c as u32 & 0x7f) as u8)),
            Encoding::Latin1 => {
                out.extend(text.chars().map(|c| if (c as u32) < 256 { c as u32 as u8 } else { b'?' }))
            }
        }
        out.len()
    }

    /// Encodes into an exactly-sized slice (see `encoded_len`).
    pub(crate) fn encode_to_slice(self, text: &str, out: &mut [u8]) {
        match self {
            Encoding::Utf8 => out.copy_from_slice(text.as_bytes()),
            Encoding::Ascii => {
                for (dst, c) in out.iter_mut().zip(text.chars()) {
                    *dst = (c as u32 & 0x7f) as u8;
                }
            }
            Encoding::Latin1 => {
                for (dst, c) in out.iter_mut().zip(text.chars()) {
                    *dst = if (c as u32) < 256 { c as u32 as u8 } else { b'?' };
                }
            }
        }
    }

    pub(crate) fn encoded_len(self, text: &str) -> usize {
        match self {
            Encoding::Utf8 => text.len(),
            Encoding::Ascii | Encoding::Latin1 => text.chars().count(),
        }
    }
}

/// Inbound bytes, either a zero-copy view into the shared pool or text
/// decoded per the stream's configured encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            Payload::Text(s) => s.as_bytes(),
        }
    }
}

/// Everything the reactor reports from `poll_with`.
///
/// Per stream, ordering is total: `Connect` precedes any `Data`, which
/// precede `End`, which precedes `Close`. `Timeout` precedes the `Close`
/// its teardown produces, and an `Error` always arrives right before its
/// `Close { had_error: true }`.
#[derive(Debug)]
pub enum Event {
    /// Bind and listen succeeded.
    Listening { server: Token },
    /// A new inbound stream, already registered readable.
    Connection { server: Token, stream: Token, peer_addr: Option<SocketAddr> },
    /// Non-blocking connect completed.
    Connect { stream: Token },
    /// An inbound read returned more than zero bytes.
    Data { stream: Token, payload: Payload },
    /// Peer shut down its write side.
    End { stream: Token },
    /// Write queue drained back to empty while still writable.
    Drain { stream: Token },
    /// Idle timeout elapsed; teardown follows.
    Timeout { stream: Token },
    /// Teardown cause, delivered right before `Close`.
    Error { stream: Token, error: Error },
    /// Terminal for the stream; its token is dead after this.
    Close { stream: Token, had_error: bool },
    /// Listener fully shut down.
    ServerClose { server: Token },
}
