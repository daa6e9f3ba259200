//! The control channel: a line based command protocol over a
//! Unix-domain socket or (authenticated) TCP, served from the signal
//! multiplexer's poll loop, plus clients for it.

pub mod client;
pub mod connection;
pub mod handshake;
pub mod listener;
pub mod protocol;
