//! Realtime service client
//!
//! Wire protocol types and the WebSocket transport that carries them.

mod connection;
pub mod protocol;

pub use connection::{
    Connection, Connector, OUTBOUND_CAPACITY, OutboundQueue, WsConnector, receive_loop, write_loop,
};
pub use protocol::{ClientEvent, ErrorDetail, ResponseInfo, ServerEvent, SessionUpdate};
