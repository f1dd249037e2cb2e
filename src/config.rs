//! Per-role configuration, filled in from the command line.

use std::net::Ipv4Addr;

use crate::session::DEFAULT_MAX_RETRIES;

/// The TFTP well-known port.
pub const DEFAULT_PORT: u16 = 69;

/// What a client session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Download: send RRQ, receive DATA blocks.
    GetFile,
    /// Upload: send WRQ, transmit DATA blocks.
    PutFile,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address. Requests go to `port`; the server's first reply fixes
    /// the real session port (TID).
    pub remote: Ipv4Addr,
    pub port: u16,
    pub operation: Operation,
    /// Used both as the name sent in the request and as the local path.
    pub filename: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on for RRQ/WRQ packets.
    pub port: u16,
    pub max_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig { port: DEFAULT_PORT, max_retries: DEFAULT_MAX_RETRIES }
    }
}
