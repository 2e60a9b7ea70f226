//! Networking: wire protocol, connection lifecycle and flow control

pub mod acceptor;
pub mod chunk_stream;
pub mod connection;
pub mod framing;
pub mod keepalive;
pub mod protocol;
pub mod registry;
