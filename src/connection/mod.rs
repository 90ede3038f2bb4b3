pub(crate) mod iso;
pub(crate) mod transport;

pub use iso::S7ConnectionType;
pub use transport::{StreamTransport, Transport, TransportReader, TransportWriter};
