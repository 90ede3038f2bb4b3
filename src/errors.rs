//! Types for working with errors produced by s7link.

use thiserror::Error;

use crate::tag::TagParseState;

/// Possible errors returned by [`S7Client`](crate::S7Client) and the
/// underlying protocol engine.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was invoked while no session with the PLC is open, or
    /// the connection dropped while the operation was in flight.
    #[error("not connected to the PLC")]
    NotConnected,

    /// A request or the open handshake exceeded its deadline.
    #[error("request timed out{}", timeout_reference(.pdu_ref))]
    Timeout {
        /// Reference of the request that timed out, where known.
        pdu_ref: Option<u16>,
    },

    /// A tag string was rejected by the address parser.
    #[error("could not parse tag '{tag}': '{fragment}' rejected while reading {state}")]
    TagParse {
        /// Parser state in which the failure occurred.
        state: TagParseState,
        /// The offending part of the tag.
        fragment: String,
        /// The full tag as supplied by the caller.
        tag: String,
    },

    /// A single item of minimal size does not fit into an empty package.
    /// This indicates a misconfigured PDU size.
    #[error("could not add item to an empty package; negotiated PDU size is too small")]
    CouldNotAddPackage,

    /// The PLC answered an item with a non-OK return code.
    #[error("item {item_index} failed: {} (return code {return_code:#04x})", item_status_description(.return_code))]
    ProtocolContent {
        /// Per-item return code reported by the PLC (`0xFF` is success).
        return_code: u8,
        /// Index of the failed item within the caller's request.
        item_index: usize,
    },

    /// The PLC reported an error in the acknowledge header.
    #[error("PLC reported {} (class {class:#04x}, code {code:#04x})", error_class_description(.class))]
    ProtocolError {
        /// Error class from the acknowledge header.
        class: u8,
        /// Error code from the acknowledge header.
        code: u8,
    },

    /// A single item cannot be encoded within the negotiated PDU size and
    /// is not eligible for splitting. The caller should reduce the batch.
    #[error("too much data for one call: {attempted} bytes requested, limit is {limit}")]
    TooMuchDataPerCall {
        /// Per-item byte limit derived from the negotiated PDU size.
        limit: usize,
        /// Size of the item that was attempted.
        attempted: usize,
    },

    /// The payload supplied for a write item does not match the item's
    /// wire length.
    #[error("write payload of {provided} bytes does not match the item length of {expected}")]
    PayloadLength {
        /// Wire length the item's type and count demand.
        expected: usize,
        /// Length of the supplied payload.
        provided: usize,
    },

    /// A frame or datagram received from the peer is malformed.
    #[error("invalid PDU received: {0}")]
    InvalidPdu(&'static str),

    /// Failure in the underlying byte transport.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

fn timeout_reference(pdu_ref: &Option<u16>) -> String {
    match pdu_ref {
        Some(pdu_ref) => format!(" (pdu reference {pdu_ref})"),
        None => String::new(),
    }
}

/// Human readable meaning of a per-item return code.
fn item_status_description(code: &u8) -> &'static str {
    match code {
        0x00 => "reserved",
        0x01 => "hardware fault",
        0x03 => "accessing the object not allowed",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0a => "object does not exist",
        0xff => "success",
        _ => "unknown error",
    }
}

/// Human readable meaning of an acknowledge header error class.
fn error_class_description(class: &u8) -> &'static str {
    match class {
        0x00 => "no error",
        0x81 => "application relationship error",
        0x82 => "object definition error",
        0x83 => "no resources available error",
        0x84 => "error on service processing",
        0x85 => "error on supplies",
        0x87 => "access error",
        _ => "unknown error class",
    }
}
