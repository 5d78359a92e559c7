//! Wire-format definitions for control-channel messages.
//!
//! Every message exchanged on a control channel is a [`ControlPacket`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (frame header, per-kind bodies).
//! - Serialising a [`ControlPacket`] into a byte buffer ready for transmission.
//! - Reassembling frames from an arbitrary byte stream ([`FrameDecoder`]) and
//!   deserialising them, returning errors for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |                  Body Length                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |            Body ...                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total frame header size: [`FRAME_HEADER_LEN`] = 5 bytes.
//!
//! Body fields are built from four primitives:
//! - `u16`: two bytes.
//! - string: `u16` length followed by UTF-8 bytes.
//! - bytes: `u32` length followed by raw bytes.
//! - optional `u8`: a presence byte (0 or 1) followed by the value when present.
//!
//! A flow key is `source (string) | source port (u16) | destination (string) |
//! destination port (u16)`.

use thiserror::Error;

use crate::flow::FlowKey;

/// Frame `kind` byte values.
pub mod kind {
    pub const SOCKET_OPEN: u8 = 0x01;
    pub const SOCKET_OPEN_RESPONSE: u8 = 0x02;
    pub const CONNECTION_SPAWNED: u8 = 0x03;
    pub const START_DUMP: u8 = 0x04;
    pub const WIRE: u8 = 0x05;
    pub const PROMISCUOUS_LEVEL: u8 = 0x06;
}

/// Byte length of the fixed-size frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 5;

// Byte offsets within the frame header.
const OFF_KIND: usize = 0;
const OFF_BODY_LEN: usize = 1;

// Intent tags inside a SocketOpen body.
const INTENT_CONNECT: u8 = 1;
const INTENT_LISTEN: u8 = 2;

/// Error codes carried by a [`ControlPacket::SocketOpenResponse`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0,
    /// The requested listening port is not available.
    Busy = 1,
    General = 2,
    Unknown = 255,
}

impl ErrorCode {
    /// Decode a code byte.  Values this side does not know map to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::None,
            1 => ErrorCode::Busy,
            2 => ErrorCode::General,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn is_failure(self) -> bool {
        self != ErrorCode::None
    }

    /// Human-readable text sent alongside the code.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::None => "",
            ErrorCode::Busy => "Port is not available",
            ErrorCode::General => "General error",
            ErrorCode::Unknown => "An Unknown Error",
        }
    }
}

/// What kind of virtual socket an open request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenIntent {
    /// Outbound connection to a virtual destination.
    Connect {
        destination: String,
        destination_port: u16,
    },
    /// Inbound listening socket on a virtual source port.
    Listen { source_port: u16 },
}

/// A raw virtual-network packet, as carried in dump mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub flow: FlowKey,
    pub data: Vec<u8>,
}

/// One control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    SocketOpen {
        callback_address: String,
        callback_port: u16,
        intent: OpenIntent,
    },
    SocketOpenResponse {
        port: u16,
        error_code: ErrorCode,
        error_message: String,
    },
    /// A reverse connection for `flow` was established from the device-side
    /// ephemeral `spawn_port`.
    ConnectionSpawned { spawn_port: u16, flow: FlowKey },
    StartDump,
    Wire(WirePacket),
    /// Request: optional new level in `set`.  Response: current level in `get`.
    PromiscuousLevel { set: Option<u8>, get: Option<u8> },
    /// A frame of a kind this side does not understand.
    Unknown { kind: u8, body: Vec<u8> },
}

impl ControlPacket {
    pub fn open_success(port: u16) -> Self {
        ControlPacket::SocketOpenResponse {
            port,
            error_code: ErrorCode::None,
            error_message: String::new(),
        }
    }

    pub fn open_failure(error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        ControlPacket::SocketOpenResponse {
            port: 0,
            error_code,
            error_message: error_message.into(),
        }
    }

    /// The frame `kind` byte this packet is sent with.
    pub fn kind(&self) -> u8 {
        match self {
            ControlPacket::SocketOpen { .. } => kind::SOCKET_OPEN,
            ControlPacket::SocketOpenResponse { .. } => kind::SOCKET_OPEN_RESPONSE,
            ControlPacket::ConnectionSpawned { .. } => kind::CONNECTION_SPAWNED,
            ControlPacket::StartDump => kind::START_DUMP,
            ControlPacket::Wire(_) => kind::WIRE,
            ControlPacket::PromiscuousLevel { .. } => kind::PROMISCUOUS_LEVEL,
            ControlPacket::Unknown { kind, .. } => *kind,
        }
    }

    /// Serialise this packet into a complete frame.
    ///
    /// Strings longer than `u16::MAX` bytes are cut at that length.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BodyWriter::default();
        match self {
            ControlPacket::SocketOpen {
                callback_address,
                callback_port,
                intent,
            } => {
                body.put_str(callback_address);
                body.put_u16(*callback_port);
                match intent {
                    OpenIntent::Connect {
                        destination,
                        destination_port,
                    } => {
                        body.put_u8(INTENT_CONNECT);
                        body.put_str(destination);
                        body.put_u16(*destination_port);
                    }
                    OpenIntent::Listen { source_port } => {
                        body.put_u8(INTENT_LISTEN);
                        body.put_u16(*source_port);
                    }
                }
            }
            ControlPacket::SocketOpenResponse {
                port,
                error_code,
                error_message,
            } => {
                body.put_u16(*port);
                body.put_u8(*error_code as u8);
                body.put_str(error_message);
            }
            ControlPacket::ConnectionSpawned { spawn_port, flow } => {
                body.put_u16(*spawn_port);
                body.put_flow(flow);
            }
            ControlPacket::StartDump => {}
            ControlPacket::Wire(wire) => {
                body.put_flow(&wire.flow);
                body.put_bytes(&wire.data);
            }
            ControlPacket::PromiscuousLevel { set, get } => {
                body.put_opt(*set);
                body.put_opt(*get);
            }
            ControlPacket::Unknown { body: raw, .. } => body.0.extend_from_slice(raw),
        }

        let body = body.0;
        let mut buf = vec![0u8; FRAME_HEADER_LEN];
        buf[OFF_KIND] = self.kind();
        buf[OFF_BODY_LEN..OFF_BODY_LEN + 4].copy_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        buf
    }

    /// Parse the body of one frame of the given `kind`.
    ///
    /// Unknown kinds are not an error; they come back as [`ControlPacket::Unknown`].
    pub fn decode(kind: u8, body: &[u8]) -> Result<Self, PacketError> {
        let mut r = BodyReader::new(body);
        let packet = match kind {
            kind::SOCKET_OPEN => {
                let callback_address = r.string("callback address")?;
                let callback_port = r.u16("callback port")?;
                let intent = match r.u8("intent")? {
                    INTENT_CONNECT => OpenIntent::Connect {
                        destination: r.string("destination")?,
                        destination_port: r.u16("destination port")?,
                    },
                    INTENT_LISTEN => OpenIntent::Listen {
                        source_port: r.u16("source port")?,
                    },
                    other => return Err(PacketError::UnknownIntent(other)),
                };
                ControlPacket::SocketOpen {
                    callback_address,
                    callback_port,
                    intent,
                }
            }
            kind::SOCKET_OPEN_RESPONSE => ControlPacket::SocketOpenResponse {
                port: r.u16("port")?,
                error_code: ErrorCode::from_u8(r.u8("error code")?),
                error_message: r.string("error message")?,
            },
            kind::CONNECTION_SPAWNED => ControlPacket::ConnectionSpawned {
                spawn_port: r.u16("spawn port")?,
                flow: r.flow()?,
            },
            kind::START_DUMP => ControlPacket::StartDump,
            kind::WIRE => ControlPacket::Wire(WirePacket {
                flow: r.flow()?,
                data: r.bytes("payload")?,
            }),
            kind::PROMISCUOUS_LEVEL => ControlPacket::PromiscuousLevel {
                set: r.opt("set")?,
                get: r.opt("get")?,
            },
            other => {
                return Ok(ControlPacket::Unknown {
                    kind: other,
                    body: body.to_vec(),
                })
            }
        };
        r.finish()?;
        Ok(packet)
    }
}

/// Errors that can arise when parsing control frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("body ended while reading {0}")]
    Truncated(&'static str),
    #[error("{0} unexpected bytes after the last field")]
    TrailingBytes(usize),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("unknown socket open intent {0}")]
    UnknownIntent(u8),
    #[error("invalid presence flag {flag} for {field}")]
    InvalidPresence { field: &'static str, flag: u8 },
    /// Framing is lost; the stream cannot be resynchronised.
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

impl PacketError {
    /// Whether the byte stream is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PacketError::FrameTooLarge { .. })
    }
}

/// Reassembles frames from a byte stream.
///
/// Feed raw bytes with [`update`](Self::update), then call
/// [`next_packet`](Self::next_packet) until it returns `Ok(None)`.  A frame
/// with a malformed body is consumed before its error is returned, so the
/// caller may log it and keep going.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_packet(&mut self) -> Result<Option<ControlPacket>, PacketError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let kind = self.buf[OFF_KIND];
        let len = u32::from_be_bytes([
            self.buf[OFF_BODY_LEN],
            self.buf[OFF_BODY_LEN + 1],
            self.buf[OFF_BODY_LEN + 2],
            self.buf[OFF_BODY_LEN + 3],
        ]) as usize;
        if len > self.max_frame_len {
            return Err(PacketError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..FRAME_HEADER_LEN + len).collect();
        ControlPacket::decode(kind, &frame[FRAME_HEADER_LEN..]).map(Some)
    }
}

#[derive(Default)]
struct BodyWriter(Vec<u8>);

impl BodyWriter {
    fn put_u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    /// Strings longer than the `u16` length prefix allows are cut at the last
    /// char boundary that fits.
    fn put_str(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.put_u16(end as u16);
        self.0.extend_from_slice(&s.as_bytes()[..end]);
    }

    fn put_bytes(&mut self, data: &[u8]) {
        self.0.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.0.extend_from_slice(data);
    }

    fn put_opt(&mut self, v: Option<u8>) {
        match v {
            Some(v) => {
                self.0.push(1);
                self.0.push(v);
            }
            None => self.0.push(0),
        }
    }

    fn put_flow(&mut self, flow: &FlowKey) {
        self.put_str(&flow.source);
        self.put_u16(flow.source_port);
        self.put_str(&flow.destination);
        self.put_u16(flow.destination_port);
    }
}

struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], PacketError> {
        if self.buf.len() - self.pos < n {
            return Err(PacketError::Truncated(field));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, PacketError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, PacketError> {
        let b = self.take(2, field)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn string(&mut self, field: &'static str) -> Result<String, PacketError> {
        let len = self.u16(field)? as usize;
        let raw = self.take(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| PacketError::InvalidUtf8(field))
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, PacketError> {
        let b = self.take(4, field)?;
        let len = u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize;
        Ok(self.take(len, field)?.to_vec())
    }

    fn opt(&mut self, field: &'static str) -> Result<Option<u8>, PacketError> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => Ok(Some(self.u8(field)?)),
            flag => Err(PacketError::InvalidPresence { field, flag }),
        }
    }

    fn flow(&mut self) -> Result<FlowKey, PacketError> {
        Ok(FlowKey {
            source: self.string("source")?,
            source_port: self.u16("source port")?,
            destination: self.string("destination")?,
            destination_port: self.u16("destination port")?,
        })
    }

    fn finish(self) -> Result<(), PacketError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(PacketError::TrailingBytes(extra)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    fn decode_one(bytes: &[u8]) -> Result<Option<ControlPacket>, PacketError> {
        let mut decoder = FrameDecoder::new(MAX);
        decoder.update(bytes);
        decoder.next_packet()
    }

    #[test]
    fn open_request_survives_the_wire() {
        let pkt = ControlPacket::SocketOpen {
            callback_address: "127.0.0.1".into(),
            callback_port: 9000,
            intent: OpenIntent::Connect {
                destination: "20174.0.0.2".into(),
                destination_port: 443,
            },
        };
        assert_eq!(decode_one(&pkt.encode()), Ok(Some(pkt)));
    }

    #[test]
    fn frame_header_carries_kind_and_big_endian_length() {
        let bytes = ControlPacket::open_success(0x1234).encode();
        assert_eq!(bytes[OFF_KIND], kind::SOCKET_OPEN_RESPONSE);
        // port(2) + code(1) + empty message(2)
        assert_eq!(&bytes[OFF_BODY_LEN..OFF_BODY_LEN + 4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 2], &[0x12, 0x34]);
    }

    #[test]
    fn oversized_string_is_cut_on_a_char_boundary() {
        let message = "é".repeat(40_000);
        let pkt = ControlPacket::open_failure(ErrorCode::General, message.clone());
        let mut decoder = FrameDecoder::new(1 << 20);
        decoder.update(&pkt.encode());

        match decoder.next_packet() {
            Ok(Some(ControlPacket::SocketOpenResponse { error_message, .. })) => {
                assert_eq!(error_message.len(), 65_534);
                assert!(message.starts_with(&error_message));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_dump_has_empty_body() {
        let bytes = ControlPacket::StartDump.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let bytes = ControlPacket::PromiscuousLevel {
            set: Some(5),
            get: None,
        }
        .encode();
        let mut decoder = FrameDecoder::new(MAX);
        decoder.update(&bytes[..3]);
        assert_eq!(decoder.next_packet(), Ok(None));
        decoder.update(&bytes[3..bytes.len() - 1]);
        assert_eq!(decoder.next_packet(), Ok(None));
        decoder.update(&bytes[bytes.len() - 1..]);
        assert!(matches!(
            decoder.next_packet(),
            Ok(Some(ControlPacket::PromiscuousLevel { set: Some(5), get: None }))
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn several_frames_in_one_read_come_out_in_order() {
        let mut bytes = ControlPacket::StartDump.encode();
        bytes.extend(ControlPacket::open_success(7).encode());
        let mut decoder = FrameDecoder::new(MAX);
        decoder.update(&bytes);
        assert_eq!(decoder.next_packet(), Ok(Some(ControlPacket::StartDump)));
        assert_eq!(decoder.next_packet(), Ok(Some(ControlPacket::open_success(7))));
        assert_eq!(decoder.next_packet(), Ok(None));
    }

    #[test]
    fn unknown_kind_is_preserved_not_rejected() {
        let bytes = [0x7f, 0, 0, 0, 2, 0xaa, 0xbb];
        assert_eq!(
            decode_one(&bytes),
            Ok(Some(ControlPacket::Unknown {
                kind: 0x7f,
                body: vec![0xaa, 0xbb]
            }))
        );
    }

    #[test]
    fn malformed_body_is_consumed_and_stream_continues() {
        let mut bytes = vec![kind::SOCKET_OPEN_RESPONSE, 0, 0, 0, 1, 0xff];
        bytes.extend(ControlPacket::StartDump.encode());
        let mut decoder = FrameDecoder::new(MAX);
        decoder.update(&bytes);
        assert_eq!(decoder.next_packet(), Err(PacketError::Truncated("port")));
        assert_eq!(decoder.next_packet(), Ok(Some(ControlPacket::StartDump)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = ControlPacket::StartDump.encode();
        bytes[OFF_BODY_LEN + 3] = 1;
        bytes.push(0);
        assert_eq!(decode_one(&bytes), Err(PacketError::TrailingBytes(1)));
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let bytes = [kind::WIRE, 0xff, 0xff, 0xff, 0xff];
        let err = decode_one(&bytes).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unknown_intent_tag_is_an_error() {
        let mut body = BodyWriter::default();
        body.put_str("h");
        body.put_u16(1);
        body.put_u8(9);
        assert_eq!(
            ControlPacket::decode(kind::SOCKET_OPEN, &body.0),
            Err(PacketError::UnknownIntent(9))
        );
    }

    #[test]
    fn error_codes_map_unknown_values_to_unknown() {
        assert_eq!(ErrorCode::from_u8(1), ErrorCode::Busy);
        assert_eq!(ErrorCode::from_u8(200), ErrorCode::Unknown);
        assert!(!ErrorCode::None.is_failure());
        assert!(ErrorCode::Busy.is_failure());
        assert_eq!(ErrorCode::Unknown as u8, 255);
    }
}
