//! MQTT 3.1.1 framing: fixed header + remaining-length varint + body.
//!
//! Only the packets the edge client exchanges with a broker are supported. Both directions are
//! encoded and decoded so a test broker can speak the same codec.

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
/// Largest remaining length a 4-byte varint can carry.
pub const MAX_REMAINING_LEN: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, DecodeError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(DecodeError::UnsupportedQoS(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present exactly when `qos` is AtLeastOnce.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, topics: Vec<(String, QoS)> },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
    /// Well-formed frame of a kind this client does not handle (QoS 2 flow, unsubscribe).
    /// Decoded whole so the stream stays aligned; never encoded.
    Unsupported { kind: u8 },
}

/// Human-readable CONNACK return code.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

/// SUBACK return code for a refused subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Encode one packet into a complete frame.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let mut body = Vec::new();
    let first = match packet {
        Packet::Connect(c) => {
            put_str(&mut body, PROTOCOL_NAME)?;
            body.push(PROTOCOL_LEVEL);
            let mut flags = 0u8;
            if c.username.is_some() {
                flags |= 0x80;
            }
            if c.password.is_some() {
                flags |= 0x40;
            }
            if c.clean_session {
                flags |= 0x02;
            }
            body.push(flags);
            body.extend_from_slice(&c.keep_alive_secs.to_be_bytes());
            put_str(&mut body, &c.client_id)?;
            if let Some(user) = &c.username {
                put_str(&mut body, user)?;
            }
            if let Some(pass) = &c.password {
                put_bytes(&mut body, pass)?;
            }
            CONNECT << 4
        }
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.push(u8::from(*session_present));
            body.push(*code);
            CONNACK << 4
        }
        Packet::Publish(p) => {
            put_str(&mut body, &p.topic)?;
            match (p.qos, p.packet_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtLeastOnce, Some(id)) => body.extend_from_slice(&id.to_be_bytes()),
                _ => return Err(EncodeError::PacketIdMismatch),
            }
            body.extend_from_slice(&p.payload);
            let mut flags = (p.qos as u8) << 1;
            if p.dup {
                flags |= 0x08;
            }
            if p.retain {
                flags |= 0x01;
            }
            (PUBLISH << 4) | flags
        }
        Packet::PubAck { packet_id } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            PUBACK << 4
        }
        Packet::Subscribe { packet_id, topics } => {
            if topics.is_empty() {
                return Err(EncodeError::NoTopics);
            }
            body.extend_from_slice(&packet_id.to_be_bytes());
            for (topic, qos) in topics {
                put_str(&mut body, topic)?;
                body.push(*qos as u8);
            }
            (SUBSCRIBE << 4) | 0x02
        }
        Packet::SubAck {
            packet_id,
            return_codes,
        } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(return_codes);
            SUBACK << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
        Packet::Unsupported { kind } => return Err(EncodeError::Unsupported(*kind)),
    };
    if body.len() > MAX_REMAINING_LEN {
        return Err(EncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(1 + 4 + body.len());
    out.push(first);
    put_remaining_len(&mut out, body.len());
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("string or binary field longer than 65535 bytes ({0})")]
    FieldTooLong(usize),
    #[error("packet too large")]
    TooLarge,
    #[error("publish packet id must be set exactly for QoS 1")]
    PacketIdMismatch,
    #[error("subscribe without topics")]
    NoTopics,
    #[error("packet type {0} cannot be encoded")]
    Unsupported(u8),
}

/// Decode one packet from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// A partial frame yields `NeedMore`; call again once more bytes have arrived.
pub fn decode_packet(bytes: &[u8]) -> Result<(Packet, usize), DecodeError> {
    let Some(&first) = bytes.first() else {
        return Err(DecodeError::NeedMore);
    };
    let (len, len_bytes) = read_remaining_len(&bytes[1..])?;
    let header = 1 + len_bytes;
    if bytes.len() < header + len {
        return Err(DecodeError::NeedMore);
    }
    let mut r = Reader::new(&bytes[header..header + len]);
    let flags = first & 0x0F;
    let packet = match first >> 4 {
        CONNECT => {
            let name = r.string()?;
            if name != PROTOCOL_NAME {
                return Err(DecodeError::Malformed("protocol name"));
            }
            let level = r.u8()?;
            if level != PROTOCOL_LEVEL {
                return Err(DecodeError::UnsupportedLevel(level));
            }
            let connect_flags = r.u8()?;
            let keep_alive_secs = r.u16()?;
            let client_id = r.string()?;
            if connect_flags & 0x04 != 0 {
                // will topic + will message: read and discard
                r.string()?;
                r.bytes()?;
            }
            let username = if connect_flags & 0x80 != 0 {
                Some(r.string()?)
            } else {
                None
            };
            let password = if connect_flags & 0x40 != 0 {
                Some(r.bytes()?.to_vec())
            } else {
                None
            };
            Packet::Connect(Connect {
                client_id,
                keep_alive_secs,
                clean_session: connect_flags & 0x02 != 0,
                username,
                password,
            })
        }
        CONNACK => Packet::ConnAck {
            session_present: r.u8()? & 0x01 != 0,
            code: r.u8()?,
        },
        PUBLISH if (flags >> 1) & 0x03 == 2 => Packet::Unsupported { kind: PUBLISH },
        PUBLISH => {
            let qos = QoS::from_bits((flags >> 1) & 0x03)?;
            let topic = r.string()?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(r.u16()?),
            };
            Packet::Publish(Publish {
                topic,
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                packet_id,
                payload: r.rest().to_vec(),
            })
        }
        PUBACK => Packet::PubAck {
            packet_id: r.u16()?,
        },
        SUBSCRIBE => {
            if flags != 0x02 {
                return Err(DecodeError::Malformed("subscribe flags"));
            }
            let packet_id = r.u16()?;
            let mut topics = Vec::new();
            while !r.is_empty() {
                let topic = r.string()?;
                let qos = QoS::from_bits(r.u8()? & 0x03)?;
                topics.push((topic, qos));
            }
            if topics.is_empty() {
                return Err(DecodeError::Malformed("subscribe without topics"));
            }
            Packet::Subscribe { packet_id, topics }
        }
        SUBACK => Packet::SubAck {
            packet_id: r.u16()?,
            return_codes: r.rest().to_vec(),
        },
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        kind @ (PUBREC | PUBREL | PUBCOMP | UNSUBSCRIBE | UNSUBACK) => {
            Packet::Unsupported { kind }
        }
        other => return Err(DecodeError::UnknownType(other)),
    };
    Ok((packet, header + len))
}

/// Error decoding a packet (need more bytes, malformed framing, or unsupported content).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("remaining length exceeds 4 bytes")]
    BadRemainingLength,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("unsupported protocol level {0}")]
    UnsupportedLevel(u8),
    #[error("unsupported QoS {0}")]
    UnsupportedQoS(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("invalid UTF-8 in string field")]
    Utf8(#[from] std::string::FromUtf8Error),
}

fn put_remaining_len(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Returns (length, bytes used by the varint).
fn read_remaining_len(bytes: &[u8]) -> Result<(usize, usize), DecodeError> {
    let mut value = 0usize;
    for i in 0..4 {
        let Some(&byte) = bytes.get(i) else {
            return Err(DecodeError::NeedMore);
        };
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(DecodeError::BadRemainingLength)
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong(data.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    put_bytes(out, s.as_bytes())
}

/// Cursor over a complete packet body; running short is a malformed packet, not `NeedMore`.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(DecodeError::Malformed("truncated body"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        Ok(String::from_utf8(self.bytes()?.to_vec())?)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        rest
    }
}
