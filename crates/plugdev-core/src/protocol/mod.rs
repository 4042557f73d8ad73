//! Remote-control protocol: framing, packets and the client.

pub mod client;
pub mod frame;
pub mod packet;

pub use client::{ClientEvent, ClientOptions, ConnectionState, ProtocolClient};
pub use frame::{encode_frame, try_read_frame, write_frame, FrameError};
pub use packet::{Packet, RequestSpec, ROOT_ACTOR, UNSOLICITED_EVENTS};
