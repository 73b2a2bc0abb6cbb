//! CoAP message codec (RFC 7252) with the oneM2M option registry.
//!
//! Message layout:
//!
//! ```text
//! +-----+------+-----+--------+------------+---------+-----------+------+---------+
//! | ver | type | tkl |  code  | message id |  token  |  options  | 0xFF | payload |
//! | 2b  |  2b  | 4b  | 1 byte |  2 bytes   | 0-8 B   | delta enc |      |         |
//! +-----+------+-----+--------+------------+---------+-----------+------+---------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// CoAP protocol version carried in every header.
pub const COAP_VERSION: u8 = 1;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Marker separating options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Option numbers.
pub mod option {
    pub const URI_HOST: u16 = 3;
    pub const URI_PORT: u16 = 7;
    pub const LOCATION_PATH: u16 = 8;
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const URI_QUERY: u16 = 15;
    pub const ACCEPT: u16 = 17;

    // oneM2M CoAP binding (TS-0008)
    pub const ONEM2M_FR: u16 = 256;
    pub const ONEM2M_RQI: u16 = 257;
    pub const ONEM2M_NM: u16 = 258;
    pub const ONEM2M_OT: u16 = 259;
    pub const ONEM2M_RQET: u16 = 260;
    pub const ONEM2M_RSET: u16 = 261;
    pub const ONEM2M_OET: u16 = 262;
    pub const ONEM2M_RTURI: u16 = 263;
    pub const ONEM2M_EC: u16 = 264;
    pub const ONEM2M_RSC: u16 = 265;
    pub const ONEM2M_GID: u16 = 266;
    pub const ONEM2M_TY: u16 = 267;
}

/// Message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method or response code, `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoapCode(u8);

impl CoapCode {
    pub const EMPTY: CoapCode = CoapCode::new(0, 0);
    pub const GET: CoapCode = CoapCode::new(0, 1);
    pub const POST: CoapCode = CoapCode::new(0, 2);
    pub const PUT: CoapCode = CoapCode::new(0, 3);
    pub const DELETE: CoapCode = CoapCode::new(0, 4);

    pub const CREATED: CoapCode = CoapCode::new(2, 1);
    pub const DELETED: CoapCode = CoapCode::new(2, 2);
    pub const CHANGED: CoapCode = CoapCode::new(2, 4);
    pub const CONTENT: CoapCode = CoapCode::new(2, 5);

    pub const BAD_REQUEST: CoapCode = CoapCode::new(4, 0);
    pub const FORBIDDEN: CoapCode = CoapCode::new(4, 3);
    pub const NOT_FOUND: CoapCode = CoapCode::new(4, 4);
    pub const METHOD_NOT_ALLOWED: CoapCode = CoapCode::new(4, 5);
    pub const NOT_ACCEPTABLE: CoapCode = CoapCode::new(4, 6);
    pub const UNSUPPORTED_CONTENT_FORMAT: CoapCode = CoapCode::new(4, 15);

    pub const INTERNAL_SERVER_ERROR: CoapCode = CoapCode::new(5, 0);
    pub const NOT_IMPLEMENTED: CoapCode = CoapCode::new(5, 1);
    pub const GATEWAY_TIMEOUT: CoapCode = CoapCode::new(5, 4);

    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u8 {
        self.0
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    /// Request codes are class 0, excluding the empty message.
    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.0 != 0
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for CoapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoapCode({})", self)
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

/// A parsed CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: CoapCode,
    pub message_id: u16,
    pub token: Bytes,
    /// Options kept sorted by number; repeated options keep insertion order.
    options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl CoapMessage {
    pub fn new(message_type: MessageType, code: CoapCode, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: Bytes::new(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Creates the response matching a request: piggybacked ACK for
    /// confirmable requests, NON otherwise.
    pub fn response_to(request: &CoapMessage, code: CoapCode) -> Self {
        let message_type = match request.message_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        Self::new(message_type, code, request.message_id).with_token(request.token.clone())
    }

    pub fn with_token(mut self, token: impl Into<Bytes>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Adds an option, preserving order among equal numbers.
    pub fn add_option(&mut self, number: u16, value: impl Into<Bytes>) {
        let pos = self
            .options
            .iter()
            .position(|o| o.number > number)
            .unwrap_or(self.options.len());
        self.options.insert(
            pos,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    pub fn add_string_option(&mut self, number: u16, value: &str) {
        self.add_option(number, Bytes::copy_from_slice(value.as_bytes()));
    }

    pub fn add_uint_option(&mut self, number: u16, value: u32) {
        self.add_option(number, encode_uint(value));
    }

    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// First value of an option.
    pub fn option(&self, number: u16) -> Option<&Bytes> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| &o.value)
    }

    /// All values of a repeatable option.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &Bytes> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| &o.value)
    }

    pub fn string_option(&self, number: u16) -> Result<Option<String>, ProtocolError> {
        self.option(number)
            .map(|v| utf8(v, "option value"))
            .transpose()
    }

    pub fn uint_option(&self, number: u16) -> Result<Option<u32>, ProtocolError> {
        self.option(number).map(|v| decode_uint(v)).transpose()
    }

    pub fn content_format(&self) -> Result<Option<u16>, ProtocolError> {
        match self.uint_option(option::CONTENT_FORMAT)? {
            Some(v) => u16::try_from(v)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidOption("content format out of range")),
            None => Ok(None),
        }
    }

    /// Uri-Path segments joined with `/`, always starting with `/`.
    pub fn uri_path(&self) -> Result<String, ProtocolError> {
        let mut path = String::new();
        for segment in self.option_values(option::URI_PATH) {
            path.push('/');
            path.push_str(&utf8(segment, "Uri-Path")?);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    /// Splits a path into Uri-Path options.
    pub fn set_uri_path(&mut self, path: &str) {
        self.options.retain(|o| o.number != option::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_string_option(option::URI_PATH, segment);
        }
    }

    /// Uri-Query options as `(key, value)` pairs.
    pub fn uri_queries(&self) -> Result<Vec<(String, String)>, ProtocolError> {
        self.option_values(option::URI_QUERY)
            .map(|v| {
                let query = utf8(v, "Uri-Query")?;
                Ok(match query.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (query, String::new()),
                })
            })
            .collect()
    }

    /// Encodes the message into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.token.len() > 8 {
            return Err(ProtocolError::InvalidTokenLength(self.token.len() as u8));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64 + self.payload.len());
        buf.put_u8((COAP_VERSION << 6) | (self.message_type.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code.raw());
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut previous = 0u16;
        for opt in &self.options {
            let delta = opt.number - previous;
            let (delta_nibble, delta_ext) = encode_nibble(delta as usize)?;
            let (len_nibble, len_ext) = encode_nibble(opt.value.len())?;
            buf.put_u8((delta_nibble << 4) | len_nibble);
            buf.put_slice(&delta_ext);
            buf.put_slice(&len_ext);
            buf.put_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf)
    }

    /// Decodes one datagram.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                needed: HEADER_SIZE - data.len(),
            });
        }

        let version = data[0] >> 6;
        if version != COAP_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let message_type = MessageType::from_bits(data[0] >> 4);
        let token_len = data[0] & 0x0F;
        if token_len > 8 {
            return Err(ProtocolError::InvalidTokenLength(token_len));
        }
        let code = CoapCode::from_raw(data[1]);
        let message_id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = HEADER_SIZE;
        let token = take(data, &mut pos, token_len as usize)?;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Bytes::new();
        while pos < data.len() {
            let byte = data[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    return Err(ProtocolError::MalformedPacket(
                        "payload marker without payload",
                    ));
                }
                payload = Bytes::copy_from_slice(&data[pos..]);
                break;
            }
            let delta = decode_nibble(byte >> 4, data, &mut pos)?;
            let len = decode_nibble(byte & 0x0F, data, &mut pos)?;
            number = u16::try_from(number as usize + delta)
                .map_err(|_| ProtocolError::InvalidOption("option number overflow"))?;
            let value = take(data, &mut pos, len)?;
            options.push(CoapOption { number, value });
        }

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

fn take(data: &[u8], pos: &mut usize, len: usize) -> Result<Bytes, ProtocolError> {
    let end = *pos + len;
    if end > data.len() {
        return Err(ProtocolError::Truncated {
            needed: end - data.len(),
        });
    }
    let value = Bytes::copy_from_slice(&data[*pos..end]);
    *pos = end;
    Ok(value)
}

fn encode_nibble(value: usize) -> Result<(u8, Vec<u8>), ProtocolError> {
    if value < 13 {
        Ok((value as u8, Vec::new()))
    } else if value < 269 {
        Ok((13, vec![(value - 13) as u8]))
    } else if value < 269 + 65536 {
        Ok((14, ((value - 269) as u16).to_be_bytes().to_vec()))
    } else {
        Err(ProtocolError::InvalidOption("option delta or length too large"))
    }
}

fn decode_nibble(nibble: u8, data: &[u8], pos: &mut usize) -> Result<usize, ProtocolError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let ext = take(data, pos, 1)?;
            Ok(ext[0] as usize + 13)
        }
        14 => {
            let ext = take(data, pos, 2)?;
            Ok(u16::from_be_bytes([ext[0], ext[1]]) as usize + 269)
        }
        _ => Err(ProtocolError::InvalidOption("reserved nibble 15")),
    }
}

/// Minimal big-endian unsigned integer encoding.
pub fn encode_uint(value: u32) -> Bytes {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    Bytes::copy_from_slice(&bytes[skip..])
}

pub fn decode_uint(value: &[u8]) -> Result<u32, ProtocolError> {
    if value.len() > 4 {
        return Err(ProtocolError::InvalidOption("uint option longer than 4 bytes"));
    }
    Ok(value.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

fn utf8(value: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8(what))
}
