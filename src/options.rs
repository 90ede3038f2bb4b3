use std::time::Duration;

use crate::connection::iso::S7ConnectionType;

// Default TCP port of the S7 protocol.
pub(crate) const TCP_PORT: u16 = 102;

/// Connection settings for one PLC.
///
/// ```rust
/// use s7link::{ConnectionOptions, S7ConnectionType};
///
/// let options = ConnectionOptions::new("192.168.10.72")
///     .connection_type(S7ConnectionType::Op)
///     .rack_and_slot(0, 1)
///     .max_parallel_jobs(4);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Target host, an IPv4 address or hostname.
    pub address: String,
    /// TCP port, 102 unless the PLC is behind a gateway.
    pub port: u16,
    /// Connection role encoded into the remote TSAP.
    pub connection_type: S7ConnectionType,
    /// CPU rack number.
    pub rack: u8,
    /// CPU slot number.
    pub slot: u8,
    /// Requested maximum PDU size; the peer may shrink it.
    pub pdu_size: u16,
    /// Requested `MaxAmQCalling`/`MaxAmQCalled`.
    pub max_parallel_jobs: u16,
    /// Per-call receive timeout.
    pub receive_timeout: Duration,
    /// Re-dial and re-open once when an operation finds the connection
    /// dropped.
    pub reconnect: bool,
}

impl ConnectionOptions {
    /// Options for `address` with the defaults of a direct S7 connection.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: TCP_PORT,
            connection_type: S7ConnectionType::Pg,
            rack: 0,
            slot: 2,
            pdu_size: 960,
            max_parallel_jobs: 10,
            receive_timeout: Duration::from_millis(5000),
            reconnect: false,
        }
    }

    /// Set the TCP port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connection role.
    pub fn connection_type(mut self, connection_type: S7ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Set the CPU location.
    pub fn rack_and_slot(mut self, rack: u8, slot: u8) -> Self {
        self.rack = rack;
        self.slot = slot;
        self
    }

    /// Set the requested PDU size.
    pub fn pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    /// Set the requested number of parallel jobs.
    pub fn max_parallel_jobs(mut self, max_parallel_jobs: u16) -> Self {
        self.max_parallel_jobs = max_parallel_jobs;
        self
    }

    /// Set the per-call receive timeout.
    pub fn receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Enable automatic reconnection.
    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }
}
