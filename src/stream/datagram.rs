//! The "datagram endpoint" terminology used by the handle taxonomy
//! ([`crate::HandleKind::Datagram`]) and spec §4.5 names a single concrete
//! type: [`crate::stream::udp::UdpSocket`]. This module re-exports it under
//! that name for callers that think in terms of the endpoint contract
//! rather than the transport.

pub use super::udp::{AllocCallback, RecvCallback, SendCallback, UdpSocket as UdpEndpoint};
