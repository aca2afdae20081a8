use std::io;
use std::net::IpAddr;

/// Errors produced by the multiplexer and delivered to reply handlers.
#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("failed to open raw ICMP socket: {0}. Administrator privileges may be required.")]
    Open(#[source] io::Error),

    #[error("endpoint {addr} with identifier {identifier} is already registered")]
    AlreadyExists { addr: IpAddr, identifier: u16 },

    #[error("endpoint {addr} with identifier {identifier} is not registered")]
    DoesNotExist { addr: IpAddr, identifier: u16 },

    #[error("transport is not running")]
    NotRunning,

    #[error("sequence {sequence} is still outstanding")]
    SequenceExhausted { sequence: u16 },

    #[error("sequence {sequence} not found")]
    NotFound { sequence: u16 },

    #[error("Request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnClosed,

    #[error("failed to send echo request: {0}")]
    Send(#[source] io::Error),
}

/// Why an inbound datagram could not be decoded as an echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("echo payload shorter than the 8-byte timestamp")]
    TooShort,

    #[error("unexpected ICMP type {found}, expected {expected}")]
    WrongType { expected: u8, found: u8 },

    #[error("not an ICMP echo message")]
    NotEcho,
}
