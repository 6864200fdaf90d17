//! Incremental framer over [`packet::decode_body`], the same re-entrant
//! byte-cursor shape as `http::parser::Parser`, `ws::frame::FrameParser`,
//! and `resp::parser::Parser`: `feed` may be called with any split of the
//! wire bytes and returns as soon as one complete packet is available.

use crate::{Error, ErrorKind};

use super::packet::{decode_body, Packet, PacketType};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    TypeByte,
    RemainingLength,
    Body,
    Failed,
}

pub struct Parser {
    state: State,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
    length_multiplier: usize,
    body: Vec<u8>,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            state: State::TypeByte,
            packet_type: PacketType::Pingreq,
            flags: 0,
            remaining_length: 0,
            length_multiplier: 1,
            body: Vec::new(),
        }
    }

    /// Feeds `data` and returns `(consumed, packet)`. `consumed` is always
    /// `data.len()` unless a complete packet was assembled mid-buffer, in
    /// which case the caller re-feeds the remainder. Once `Failed`, every
    /// further call returns an error without consuming anything.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Packet>), Error> {
        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                State::Failed => {
                    return Err(Error::new(ErrorKind::ProtocolError, "parser is in a failed state"));
                }
                State::TypeByte => {
                    let byte = data[pos];
                    pos += 1;
                    let packet_type = PacketType::from_raw(byte >> 4).ok_or_else(|| {
                        self.state = State::Failed;
                        Error::new(ErrorKind::ProtocolError, "unrecognized MQTT packet type")
                    })?;
                    self.packet_type = packet_type;
                    self.flags = byte & 0x0F;
                    self.remaining_length = 0;
                    self.length_multiplier = 1;
                    self.state = State::RemainingLength;
                }
                State::RemainingLength => {
                    let byte = data[pos];
                    pos += 1;
                    self.remaining_length += (byte & 0x7F) as usize * self.length_multiplier;
                    if byte & 0x80 != 0 {
                        self.length_multiplier *= 128;
                        if self.length_multiplier > 128 * 128 * 128 {
                            self.state = State::Failed;
                            return Err(Error::new(ErrorKind::ProtocolError, "remaining length exceeds 4 bytes"));
                        }
                    } else {
                        self.body = Vec::with_capacity(self.remaining_length);
                        self.state = State::Body;
                    }
                }
                State::Body => {
                    let want = self.remaining_length - self.body.len();
                    let take = want.min(data.len() - pos);
                    self.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if self.body.len() < self.remaining_length {
                        continue;
                    }
                    let packet = match decode_body(self.packet_type, self.flags, &self.body) {
                        Ok(p) => p,
                        Err(e) => {
                            self.state = State::Failed;
                            return Err(e);
                        }
                    };
                    self.state = State::TypeByte;
                    self.body = Vec::new();
                    return Ok((pos, Some(packet)));
                }
            }
        }
        Ok((pos, None))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::packet::{encode, ConnectPacket, PublishPacket, QoS};

    #[test]
    fn pingreq_has_a_zero_length_body() {
        let mut parser = Parser::new();
        let (consumed, packet) = parser.feed(&[0xC0, 0x00]).unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(packet, Some(Packet::Pingreq));
    }

    #[test]
    fn connect_packet_parses_when_split_byte_at_a_time() {
        let connect = ConnectPacket {
            protocol_level: 4,
            clean_session: true,
            keep_alive: 30,
            client_id: "c1".to_string(),
            will: None,
            username: None,
            password: None,
        };
        let wire = encode(&Packet::Connect(connect.clone()));

        let mut parser = Parser::new();
        let mut got = None;
        for byte in &wire {
            let (_consumed, packet) = parser.feed(std::slice::from_ref(byte)).unwrap();
            if packet.is_some() {
                got = packet;
            }
        }
        assert_eq!(got, Some(Packet::Connect(connect)));
    }

    #[test]
    fn publish_payload_split_mid_body_still_completes() {
        let publish = PublishPacket {
            topic: "a/b".to_string(),
            packet_id: Some(7),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            payload: b"hello world".to_vec(),
        };
        let wire = encode(&Packet::Publish(publish.clone()));
        let split = wire.len() - 4;

        let mut parser = Parser::new();
        let (consumed1, first) = parser.feed(&wire[..split]).unwrap();
        assert_eq!(consumed1, split);
        assert_eq!(first, None);
        let (consumed2, second) = parser.feed(&wire[split..]).unwrap();
        assert_eq!(consumed2, wire.len() - split);
        assert_eq!(second, Some(Packet::Publish(publish)));
    }

    #[test]
    fn remaining_length_above_four_bytes_is_rejected() {
        let mut parser = Parser::new();
        let result = parser.feed(&[0xC0, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(result.is_err());
    }

    #[test]
    fn unrecognized_packet_type_enters_failed_state() {
        let mut parser = Parser::new();
        assert!(parser.feed(&[0x00, 0x00]).is_err());
        assert!(parser.feed(&[0xC0, 0x00]).is_err());
    }

    #[test]
    fn pipelined_packets_are_yielded_one_call_cycle_at_a_time() {
        let mut wire = Vec::new();
        wire.extend(encode(&Packet::Pingreq));
        wire.extend(encode(&Packet::Pingresp));
        wire.extend(encode(&Packet::Disconnect));

        let mut parser = Parser::new();
        let mut packets = Vec::new();
        let mut offset = 0;
        while offset < wire.len() {
            let (consumed, packet) = parser.feed(&wire[offset..]).unwrap();
            offset += consumed;
            if let Some(p) = packet {
                packets.push(p);
            }
        }
        assert_eq!(packets, vec![Packet::Pingreq, Packet::Pingresp, Packet::Disconnect]);
    }
}
