//! MQTT control packet model and wire codec, per spec §6's "MQTT control
//! packets per 3.1, 3.1.1, and 5" and DESIGN.md's QoS 0/1 scope decision:
//! CONNECT/CONNACK/PUBLISH/PUBACK/SUBSCRIBE/SUBACK/PINGREQ/PINGRESP/
//! DISCONNECT only — no persistent sessions, no QoS 2, no v5 properties.

use crate::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Subscribe,
    Suback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl PacketType {
    pub(crate) fn from_raw(b: u8) -> Option<PacketType> {
        match b {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::Connack),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::Puback),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::Suback),
            12 => Some(PacketType::Pingreq),
            13 => Some(PacketType::Pingresp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    fn raw(self) -> u8 {
        match self {
            PacketType::Connect => 1,
            PacketType::Connack => 2,
            PacketType::Publish => 3,
            PacketType::Puback => 4,
            PacketType::Subscribe => 8,
            PacketType::Suback => 9,
            PacketType::Pingreq => 12,
            PacketType::Pingresp => 13,
            PacketType::Disconnect => 14,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    fn from_raw(b: u8) -> Result<QoS, Error> {
        match b {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Err(Error::new(ErrorKind::ProtocolError, "QoS 2 is out of scope")),
            _ => Err(Error::new(ErrorKind::ProtocolError, "invalid QoS value")),
        }
    }

    fn raw(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectPacket {
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub return_code: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PublishPacket {
    pub topic: String,
    pub packet_id: Option<u16>,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PubackPacket {
    pub packet_id: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubackPacket {
    pub packet_id: u16,
    /// Per filter: the granted QoS, or `None` for a 0x80 failure code.
    pub results: Vec<Option<QoS>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PubackPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Pingreq,
    Pingresp,
    Disconnect,
}

/// A bounds-checked cursor over a packet body, the MQTT-codec analogue of
/// `resp::parser`'s line/bulk scratch buffers.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::new(ErrorKind::ProtocolError, "packet body ended early"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.pos + len > self.data.len() {
            return Err(Error::new(ErrorKind::ProtocolError, "packet body ended early"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// MQTT string: a u16 length prefix followed by that many UTF-8 bytes.
    fn string(&mut self) -> Result<String, Error> {
        let len = self.u16()? as usize;
        let bytes = self.bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| Error::new(ErrorKind::ProtocolError, "MQTT string is not valid UTF-8"))
    }

    /// Length-prefixed binary (the will-message / password wire shape).
    fn binary(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.u16()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_binary(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

/// Decodes a packet body given its fixed-header type byte and flags.
pub(crate) fn decode_body(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Packet, Error> {
    match packet_type {
        PacketType::Connect => {
            let mut r = Reader::new(body);
            let protocol_name = r.string()?;
            if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
                return Err(Error::new(ErrorKind::ProtocolError, "unrecognized MQTT protocol name"));
            }
            let protocol_level = r.u8()?;
            let connect_flags = r.u8()?;
            let keep_alive = r.u16()?;
            let client_id = r.string()?;

            let clean_session = connect_flags & 0x02 != 0;
            let will_flag = connect_flags & 0x04 != 0;
            let will_qos = QoS::from_raw((connect_flags >> 3) & 0x03)?;
            let will_retain = connect_flags & 0x20 != 0;
            let password_flag = connect_flags & 0x40 != 0;
            let username_flag = connect_flags & 0x80 != 0;

            let will = if will_flag {
                let topic = r.string()?;
                let message = r.binary()?;
                Some(Will {
                    topic,
                    message,
                    qos: will_qos,
                    retain: will_retain,
                })
            } else {
                None
            };
            let username = if username_flag { Some(r.string()?) } else { None };
            let password = if password_flag { Some(r.binary()?) } else { None };

            Ok(Packet::Connect(ConnectPacket {
                protocol_level,
                clean_session,
                keep_alive,
                client_id,
                will,
                username,
                password,
            }))
        }
        PacketType::Connack => {
            let mut r = Reader::new(body);
            let flags = r.u8()?;
            let return_code = r.u8()?;
            Ok(Packet::Connack(ConnackPacket {
                session_present: flags & 0x01 != 0,
                return_code,
            }))
        }
        PacketType::Publish => {
            let qos = QoS::from_raw((flags >> 1) & 0x03)?;
            let retain = flags & 0x01 != 0;
            let dup = flags & 0x08 != 0;
            let mut r = Reader::new(body);
            let topic = r.string()?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(r.u16()?),
            };
            let payload = r.remaining().to_vec();
            Ok(Packet::Publish(PublishPacket {
                topic,
                packet_id,
                qos,
                retain,
                dup,
                payload,
            }))
        }
        PacketType::Puback => {
            let mut r = Reader::new(body);
            Ok(Packet::Puback(PubackPacket { packet_id: r.u16()? }))
        }
        PacketType::Subscribe => {
            let mut r = Reader::new(body);
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while r.pos < r.data.len() {
                let topic = r.string()?;
                let qos = QoS::from_raw(r.u8()? & 0x03)?;
                filters.push((topic, qos));
            }
            if filters.is_empty() {
                return Err(Error::new(ErrorKind::ProtocolError, "SUBSCRIBE with no filters"));
            }
            Ok(Packet::Subscribe(SubscribePacket { packet_id, filters }))
        }
        PacketType::Suback => {
            let mut r = Reader::new(body);
            let packet_id = r.u16()?;
            let mut results = Vec::new();
            while r.pos < r.data.len() {
                let code = r.u8()?;
                results.push(if code == 0x80 { None } else { Some(QoS::from_raw(code & 0x03)?) });
            }
            Ok(Packet::Suback(SubackPacket { packet_id, results }))
        }
        PacketType::Pingreq => Ok(Packet::Pingreq),
        PacketType::Pingresp => Ok(Packet::Pingresp),
        PacketType::Disconnect => Ok(Packet::Disconnect),
    }
}

/// Encodes `packet`'s fixed header (type/flags byte + variable-length
/// remaining-length) and body together.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let (packet_type, flags, body) = match packet {
        Packet::Connect(c) => (PacketType::Connect, 0, encode_connect(c)),
        Packet::Connack(c) => (PacketType::Connack, 0, encode_connack(c)),
        Packet::Publish(p) => (PacketType::Publish, publish_flags(p), encode_publish(p)),
        Packet::Puback(p) => (PacketType::Puback, 0, p.packet_id.to_be_bytes().to_vec()),
        Packet::Subscribe(s) => (PacketType::Subscribe, 0x02, encode_subscribe(s)),
        Packet::Suback(s) => (PacketType::Suback, 0, encode_suback(s)),
        Packet::Pingreq => (PacketType::Pingreq, 0, Vec::new()),
        Packet::Pingresp => (PacketType::Pingresp, 0, Vec::new()),
        Packet::Disconnect => (PacketType::Disconnect, 0, Vec::new()),
    };

    let mut out = Vec::with_capacity(body.len() + 5);
    out.push((packet_type.raw() << 4) | (flags & 0x0F));
    out.extend(encode_remaining_length(body.len()));
    out.extend(body);
    out
}

fn publish_flags(p: &PublishPacket) -> u8 {
    let mut flags = 0u8;
    if p.retain {
        flags |= 0x01;
    }
    flags |= p.qos.raw() << 1;
    if p.dup {
        flags |= 0x08;
    }
    flags
}

fn encode_connect(c: &ConnectPacket) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, "MQTT");
    out.push(c.protocol_level);

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04;
        flags |= will.qos.raw() << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if c.password.is_some() {
        flags |= 0x40;
    }
    if c.username.is_some() {
        flags |= 0x80;
    }
    out.push(flags);
    out.extend_from_slice(&c.keep_alive.to_be_bytes());
    write_string(&mut out, &c.client_id);
    if let Some(will) = &c.will {
        write_string(&mut out, &will.topic);
        write_binary(&mut out, &will.message);
    }
    if let Some(username) = &c.username {
        write_string(&mut out, username);
    }
    if let Some(password) = &c.password {
        write_binary(&mut out, password);
    }
    out
}

fn encode_connack(c: &ConnackPacket) -> Vec<u8> {
    vec![if c.session_present { 0x01 } else { 0x00 }, c.return_code]
}

fn encode_publish(p: &PublishPacket) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, &p.topic);
    if let Some(id) = p.packet_id {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out.extend_from_slice(&p.payload);
    out
}

fn encode_subscribe(s: &SubscribePacket) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&s.packet_id.to_be_bytes());
    for (topic, qos) in &s.filters {
        write_string(&mut out, topic);
        out.push(qos.raw());
    }
    out
}

fn encode_suback(s: &SubackPacket) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&s.packet_id.to_be_bytes());
    for result in &s.results {
        out.push(match result {
            Some(qos) => qos.raw(),
            None => 0x80,
        });
    }
    out
}

/// MQTT's variable-length encoding: 7 bits of value per byte, continuation
/// bit set on every byte but the last. Capped at 4 bytes (the protocol's
/// own 256 MiB ceiling).
pub(crate) fn encode_remaining_length(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
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
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_length_round_trips_across_the_multi_byte_boundary() {
        assert_eq!(encode_remaining_length(0), vec![0x00]);
        assert_eq!(encode_remaining_length(127), vec![0x7F]);
        assert_eq!(encode_remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(encode_remaining_length(16384), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn connect_packet_round_trips_with_will_and_credentials() {
        let connect = ConnectPacket {
            protocol_level: 4,
            clean_session: true,
            keep_alive: 60,
            client_id: "dev-1".to_string(),
            will: Some(Will {
                topic: "dev-1/status".to_string(),
                message: b"offline".to_vec(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("alice".to_string()),
            password: Some(b"hunter2".to_vec()),
        };
        let wire = encode_connect(&connect);
        let decoded = decode_body(PacketType::Connect, 0, &wire).unwrap();
        assert_eq!(decoded, Packet::Connect(connect));
    }

    #[test]
    fn publish_at_least_once_carries_a_packet_id() {
        let publish = PublishPacket {
            topic: "sensors/temp".to_string(),
            packet_id: Some(42),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            payload: b"21.5".to_vec(),
        };
        let flags = publish_flags(&publish);
        let wire = encode_publish(&publish);
        let decoded = decode_body(PacketType::Publish, flags, &wire).unwrap();
        assert_eq!(decoded, Packet::Publish(publish));
    }

    #[test]
    fn publish_at_most_once_has_no_packet_id() {
        let publish = PublishPacket {
            topic: "sensors/temp".to_string(),
            packet_id: None,
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            payload: b"21.5".to_vec(),
        };
        let flags = publish_flags(&publish);
        let wire = encode_publish(&publish);
        match decode_body(PacketType::Publish, flags, &wire).unwrap() {
            Packet::Publish(p) => assert_eq!(p.packet_id, None),
            other => panic!("expected a publish packet, got {other:?}"),
        }
    }

    #[test]
    fn qos_two_is_rejected() {
        assert!(QoS::from_raw(2).is_err());
    }

    #[test]
    fn subscribe_requires_at_least_one_filter() {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_be_bytes());
        assert!(decode_body(PacketType::Subscribe, 0, &body).is_err());
    }

    #[test]
    fn suback_marks_failed_filters_with_none() {
        let suback = SubackPacket {
            packet_id: 9,
            results: vec![Some(QoS::AtMostOnce), None],
        };
        let wire = encode_suback(&suback);
        let decoded = decode_body(PacketType::Suback, 0, &wire).unwrap();
        assert_eq!(decoded, Packet::Suback(suback));
    }
}
