//! MQTT 3.1.1 packet codec.
//!
//! Covers the subset the oneM2M MQTT binding needs: session setup,
//! QoS 0/1 publish, subscribe and keep-alive.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Largest remaining-length value the variable byte integer can hold.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket("invalid QoS")),
        }
    }
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive,
            clean_session: true,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Bytes) -> Self {
        self.username = Some(username.into());
        self.password = Some(password);
        self
    }
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    /// Present for QoS > 0.
    pub packet_id: Option<u16>,
    pub retain: bool,
    pub dup: bool,
    pub payload: Bytes,
}

impl Publish {
    /// QoS 0 publish.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }

    pub fn with_qos(mut self, qos: QoS, packet_id: u16) -> Self {
        self.qos = qos;
        self.packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(packet_id)
        };
        self
    }
}

/// MQTT control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish(Publish),
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    SubAck {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Encodes the packet with its fixed header.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::new();
        let header: u8 = match self {
            Packet::Connect(connect) => {
                put_string(&mut body, "MQTT")?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= 0x02;
                }
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);
                put_string(&mut body, &connect.client_id)?;
                if let Some(username) = &connect.username {
                    put_string(&mut body, username)?;
                }
                if let Some(password) = &connect.password {
                    put_binary(&mut body, password)?;
                }
                0x10
            }
            Packet::ConnAck {
                session_present,
                return_code,
            } => {
                body.put_u8(u8::from(*session_present));
                body.put_u8(*return_code);
                0x20
            }
            Packet::Publish(publish) => {
                put_string(&mut body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    let packet_id = publish
                        .packet_id
                        .ok_or(ProtocolError::MissingField("packet_id"))?;
                    body.put_u16(packet_id);
                }
                if publish.payload.len() > MAX_PAYLOAD_SIZE {
                    return Err(ProtocolError::PayloadTooLarge {
                        size: publish.payload.len(),
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                body.put_slice(&publish.payload);
                let mut header = 0x30 | ((publish.qos as u8) << 1);
                if publish.dup {
                    header |= 0x08;
                }
                if publish.retain {
                    header |= 0x01;
                }
                header
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                0x40
            }
            Packet::Subscribe { packet_id, filters } => {
                if filters.is_empty() {
                    return Err(ProtocolError::MalformedPacket("SUBSCRIBE without filters"));
                }
                body.put_u16(*packet_id);
                for (filter, qos) in filters {
                    put_string(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
                0x82
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                body.put_u16(*packet_id);
                body.put_slice(return_codes);
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(header);
        put_remaining_length(&mut buf, body.len())?;
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed; consumed bytes are removed
    /// only when a whole packet is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let (remaining, len_bytes) = match peek_remaining_length(&buf[1..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        let total = 1 + len_bytes + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let mut packet = buf.split_to(total).freeze();
        let header = packet.get_u8();
        packet.advance(len_bytes);
        let body = packet;

        let decoded = match header >> 4 {
            1 => Packet::Connect(decode_connect(body)?),
            2 => {
                let mut body = body;
                ensure(&body, 2)?;
                Packet::ConnAck {
                    session_present: body.get_u8() & 0x01 != 0,
                    return_code: body.get_u8(),
                }
            }
            3 => Packet::Publish(decode_publish(header, body)?),
            4 => {
                let mut body = body;
                ensure(&body, 2)?;
                Packet::PubAck {
                    packet_id: body.get_u16(),
                }
            }
            8 => {
                let mut body = body;
                ensure(&body, 2)?;
                let packet_id = body.get_u16();
                let mut filters = Vec::new();
                while body.has_remaining() {
                    let filter = get_string(&mut body)?;
                    ensure(&body, 1)?;
                    let qos = QoS::from_bits(body.get_u8() & 0x03)?;
                    filters.push((filter, qos));
                }
                Packet::Subscribe { packet_id, filters }
            }
            9 => {
                let mut body = body;
                ensure(&body, 2)?;
                let packet_id = body.get_u16();
                Packet::SubAck {
                    packet_id,
                    return_codes: body.to_vec(),
                }
            }
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => return Err(ProtocolError::UnknownPacketType(other)),
        };
        Ok(Some(decoded))
    }
}

fn decode_connect(mut body: Bytes) -> Result<Connect, ProtocolError> {
    let protocol = get_string(&mut body)?;
    if protocol != "MQTT" {
        return Err(ProtocolError::MalformedPacket("unexpected protocol name"));
    }
    ensure(&body, 4)?;
    let _level = body.get_u8();
    let flags = body.get_u8();
    let keep_alive = body.get_u16();
    let client_id = get_string(&mut body)?;
    let username = if flags & 0x80 != 0 {
        Some(get_string(&mut body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(get_binary(&mut body)?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        username,
        password,
    })
}

fn decode_publish(header: u8, mut body: Bytes) -> Result<Publish, ProtocolError> {
    let qos = QoS::from_bits((header >> 1) & 0x03)?;
    let topic = get_string(&mut body)?;
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        ensure(&body, 2)?;
        Some(body.get_u16())
    };
    Ok(Publish {
        topic,
        qos,
        packet_id,
        retain: header & 0x01 != 0,
        dup: header & 0x08 != 0,
        payload: body,
    })
}

fn ensure(body: &Bytes, needed: usize) -> Result<(), ProtocolError> {
    if body.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed: needed - body.remaining(),
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    put_binary(buf, value.as_bytes())
}

fn put_binary(buf: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::MalformedPacket("string longer than 65535 bytes"))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn get_binary(body: &mut Bytes) -> Result<Bytes, ProtocolError> {
    ensure(body, 2)?;
    let len = body.get_u16() as usize;
    ensure(body, len)?;
    Ok(body.split_to(len))
}

fn get_string(body: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_binary(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("MQTT string"))
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Returns `(value, bytes used)` or `None` when the length is incomplete.
fn peek_remaining_length(data: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in data.iter().enumerate() {
        if i >= 4 {
            return Err(ProtocolError::MalformedPacket("remaining length exceeds 4 bytes"));
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if data.len() >= 4 {
        return Err(ProtocolError::MalformedPacket("remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

/// Matches a topic name against a subscription filter with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Buffered decoder for a byte stream carrying MQTT packets.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        Packet::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_wire_format() {
        let encoded = Packet::Connect(Connect::new("iotdm", 60)).encode().unwrap();
        assert_eq!(encoded[0], 0x10);
        // protocol name "MQTT", level 4, clean session flag
        assert_eq!(&encoded[2..8], &[0x00, 0x04, b'M', b'Q', b'T', b'T']);
        assert_eq!(encoded[8], PROTOCOL_LEVEL);
        assert_eq!(encoded[9], 0x02);
        assert_eq!(&encoded[10..12], &60u16.to_be_bytes());
    }

    #[test]
    fn test_publish_qos1_decodes() {
        let publish = Publish::new("/oneM2M/req/Cae1/in-cse/json", &b"{}"[..])
            .with_qos(QoS::AtLeastOnce, 9);
        let mut buf = Packet::Publish(publish.clone()).encode().unwrap();
        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Packet::Publish(publish));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_packet_waits_for_more() {
        let payload = vec![b'x'; 300];
        let encoded = Packet::Publish(Publish::new("t", payload)).encode().unwrap();
        // 300 + topic needs a two byte remaining length
        assert_eq!(encoded[1] & 0x80, 0x80);

        let mut decoder = Decoder::new();
        decoder.extend(&encoded[..2]);
        assert!(decoder.decode_packet().unwrap().is_none());
        decoder.extend(&encoded[2..20]);
        assert!(decoder.decode_packet().unwrap().is_none());
        decoder.extend(&encoded[20..]);
        assert!(matches!(
            decoder.decode_packet().unwrap(),
            Some(Packet::Publish(_))
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_packets_in_buffer() {
        let mut decoder = Decoder::new();
        decoder.extend(&Packet::PingResp.encode().unwrap());
        decoder.extend(
            &Packet::SubAck {
                packet_id: 3,
                return_codes: vec![1],
            }
            .encode()
            .unwrap(),
        );
        assert_eq!(decoder.decode_packet().unwrap(), Some(Packet::PingResp));
        assert_eq!(
            decoder.decode_packet().unwrap(),
            Some(Packet::SubAck {
                packet_id: 3,
                return_codes: vec![1]
            })
        );
        assert!(decoder.decode_packet().unwrap().is_none());
    }

    #[test]
    fn test_rejects_unknown_type_and_long_length() {
        let mut buf = BytesMut::from(&[0xF0u8, 0x00][..]);
        assert!(matches!(
            Packet::decode(&mut buf),
            Err(ProtocolError::UnknownPacketType(15))
        ));

        let mut buf = BytesMut::from(&[0x30u8, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert!(Packet::decode(&mut buf).is_err());
    }

    #[test]
    fn test_subscribe_requires_filter() {
        let result = Packet::Subscribe {
            packet_id: 1,
            filters: vec![],
        }
        .encode();
        assert!(result.is_err());
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches(
            "/oneM2M/req/+/in-cse/json",
            "/oneM2M/req/Cae1/in-cse/json"
        ));
        assert!(!topic_matches(
            "/oneM2M/req/+/in-cse/json",
            "/oneM2M/req/Cae1/other/json"
        ));
        assert!(topic_matches("/oneM2M/#", "/oneM2M/resp/a/b/json"));
        assert!(!topic_matches("/oneM2M/req", "/oneM2M/req/extra"));
    }
}
