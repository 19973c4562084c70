//! DNS wire codec and per-transport framing
//!
//! UDP carries one message per datagram. TCP prefixes every message with a
//! 2-byte big-endian length (RFC 1035 section 4.2.2).

use std::io::ErrorKind;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::{DnsResult, DnsServiceError};
use crate::stack::TransportProtocol;

/// Largest DNS message carried in one UDP datagram
pub const MAX_UDP_MESSAGE_SIZE: usize = 65535;

/// Largest DNS message a 2-byte length prefix can describe
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// Size of the DNS header; nothing shorter is a DNS message
pub const MIN_DNS_MESSAGE_SIZE: usize = 12;

/// Length prefix size for TCP framing
const TCP_LENGTH_PREFIX: usize = 2;

/// How messages are delimited on a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One message per read/write
    Datagram,
    /// 2-byte big-endian length prefix, then the message
    LengthPrefixed,
}

impl Framing {
    pub fn for_transport(transport: TransportProtocol) -> Self {
        match transport {
            TransportProtocol::Udp => Self::Datagram,
            TransportProtocol::Tcp => Self::LengthPrefixed,
        }
    }

    /// Wrap an encoded message for the wire
    ///
    /// # Errors
    ///
    /// `SerializeError` if the message does not fit the framing.
    pub fn frame(self, message: &[u8]) -> DnsResult<Vec<u8>> {
        match self {
            Self::Datagram => {
                if message.len() > MAX_UDP_MESSAGE_SIZE {
                    return Err(DnsServiceError::serialize(format!(
                        "response too large: {} bytes (max: {MAX_UDP_MESSAGE_SIZE})",
                        message.len()
                    )));
                }
                Ok(message.to_vec())
            }
            Self::LengthPrefixed => {
                let len = u16::try_from(message.len()).map_err(|_| {
                    DnsServiceError::serialize(format!(
                        "response too large: {} bytes (max: {MAX_TCP_MESSAGE_SIZE})",
                        message.len()
                    ))
                })?;
                let mut framed = Vec::with_capacity(TCP_LENGTH_PREFIX + message.len());
                framed.extend_from_slice(&len.to_be_bytes());
                framed.extend_from_slice(message);
                Ok(framed)
            }
        }
    }
}

/// Decode a DNS message
///
/// # Errors
///
/// `ParseError` if the bytes are not a valid DNS message.
pub fn decode(bytes: &[u8]) -> DnsResult<Message> {
    Message::from_vec(bytes).map_err(|e| DnsServiceError::parse(e.to_string()))
}

/// Encode a DNS message
///
/// # Errors
///
/// `SerializeError` if hickory cannot encode the message.
pub fn encode(message: &Message) -> DnsResult<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| DnsServiceError::serialize(e.to_string()))
}

/// Reads framed messages from one flow into a reused buffer
#[derive(Debug)]
pub struct MessageReader {
    framing: Framing,
    max_tcp_message_size: usize,
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new(framing: Framing, max_tcp_message_size: usize) -> Self {
        let capacity = match framing {
            Framing::Datagram => MAX_UDP_MESSAGE_SIZE,
            Framing::LengthPrefixed => 512,
        };
        Self {
            framing,
            max_tcp_message_size: max_tcp_message_size.clamp(MIN_DNS_MESSAGE_SIZE, MAX_TCP_MESSAGE_SIZE),
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Read the next message
    ///
    /// Returns `Ok(None)` on a clean end of flow. A zero-length datagram is
    /// returned as an empty message; datagram flows signal a departed peer
    /// with `BrokenPipe` or `UnexpectedEof`. The returned slice is valid
    /// until the next call.
    ///
    /// # Errors
    ///
    /// `NetworkError` on I/O failure or a truncated frame, `ParseError` for a
    /// length prefix outside `[MIN_DNS_MESSAGE_SIZE, max]`.
    pub async fn read<R>(&mut self, reader: &mut R) -> DnsResult<Option<&[u8]>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match self.framing {
            Framing::Datagram => {
                self.buf.resize(MAX_UDP_MESSAGE_SIZE, 0);
                let n = match reader.read(&mut self.buf).await {
                    Ok(n) => n,
                    Err(e) if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof) => {
                        return Ok(None)
                    }
                    Err(e) => return Err(DnsServiceError::network_io("failed to read datagram", e)),
                };
                Ok(Some(&self.buf[..n]))
            }
            Framing::LengthPrefixed => {
                let mut len_buf = [0u8; TCP_LENGTH_PREFIX];
                match reader.read_exact(&mut len_buf).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(DnsServiceError::network_io("failed to read length prefix", e)),
                }

                let len = usize::from(u16::from_be_bytes(len_buf));
                if len < MIN_DNS_MESSAGE_SIZE {
                    return Err(DnsServiceError::parse(format!(
                        "message too small: {len} bytes (min: {MIN_DNS_MESSAGE_SIZE})"
                    )));
                }
                if len > self.max_tcp_message_size {
                    return Err(DnsServiceError::parse(format!(
                        "message too large: {len} bytes (max: {})",
                        self.max_tcp_message_size
                    )));
                }

                self.buf.resize(len, 0);
                reader
                    .read_exact(&mut self.buf)
                    .await
                    .map_err(|e| DnsServiceError::network_io("failed to read message body", e))?;
                Ok(Some(&self.buf[..]))
            }
        }
    }
}
