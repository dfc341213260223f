//! Transport capability for reading controller memory.
//!
//! The poll orchestrator only needs three operations: connect to a
//! target, read bytes out of a numbered data block, and release the
//! connection. They are expressed as traits so the production S7 client
//! ([`crate::s7::S7Transport`]) and test doubles are interchangeable.

use std::future::Future;

use thiserror::Error;

use crate::config::TargetConfig;

/// Errors from the transport layer.
///
/// `Connect` covers the whole session establishment (TCP plus protocol
/// handshake) and skips the target for the cycle; `Read` covers a single
/// block read and skips only that metric.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Read DB{db} at offset {offset} failed: {reason}")]
    Read {
        db: u16,
        offset: u32,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for controller connections.
pub trait Transport {
    type Connection: Connection;

    /// Establish a connection to a target using its address, rack, slot
    /// and port.
    fn connect(
        &self,
        target: &TargetConfig,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// An established controller connection.
pub trait Connection: Send {
    /// Read `len` bytes from data block `db` starting at byte `offset`.
    fn read(
        &mut self,
        db: u16,
        offset: u32,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Release the connection. Errors during teardown are not worth
    /// surfacing; the next cycle reconnects from scratch.
    fn disconnect(self) -> impl Future<Output = ()> + Send;
}
