//! MQTT control-packet model and codec, per spec §6: "MQTT control packets
//! per 3.1, 3.1.1, and 5, with a configurable accepted-versions mask in the
//! broker." Scoped to QoS 0/1 per the Open Questions note that persistent
//! sessions and QoS 2 are not fully specified upstream — CONNECT, CONNACK,
//! PUBLISH, PUBACK, SUBSCRIBE, SUBACK, PINGREQ, PINGRESP, and DISCONNECT
//! only.

mod packet;
mod parser;

pub use packet::{
    encode, ConnackPacket, ConnectPacket, Packet, PacketType, PubackPacket, PublishPacket, QoS,
    SubackPacket, SubscribePacket, Will,
};
pub use parser::Parser;
