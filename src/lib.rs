#![warn(missing_docs)]
#![deny(
    missing_debug_implementations,
    rust_2018_idioms,
    single_use_lifetimes,
    unreachable_pub
)]

/*!
This crate provides an asynchronous client for PLC devices of the Siemens S7
family, speaking the S7 protocol over ISO-on-TCP (RFC 1006).

Unlike request-per-connection clients, one [`S7Client`] multiplexes many
in-flight requests over a single connection: responses are correlated by the
PDU reference of the S7 header, and the number of simultaneously outstanding
jobs is paced by the credits the PLC advertises during COMM-SETUP. Large
reads and writes are transparently split into PDU-sized packages and
reassembled.

# Usage

```toml
[dependencies]
s7link = "0.1"
```

# Examples

Variables are addressed with a compact textual notation, e.g. `DB1.10,w,4`
(four words starting at byte 10 of data block 1) or `M10.2,x` (flag bit 2 of
flag byte 10):

```rust,no_run
# tokio_test::block_on(async {
use s7link::{ConnectionOptions, S7Client};

let client = S7Client::connect(
    ConnectionOptions::new("192.168.10.72").max_parallel_jobs(4),
)
.await?;

// Concurrent reads share the connection.
let (values, clock) = tokio::join!(
    client.read_tags(&["DB1.0,w,4", "M10.2,x"]),
    client.read_clock(),
);
for value in values? {
    println!("{:?}", value?);
}
println!("PLC time: {}", clock?);

client.disconnect().await?;
# Ok::<(), s7link::errors::Error>(())
# });
```
*/

mod client;
mod connection;
pub mod errors;
mod handler;
mod options;
mod s7_protocol;
mod tag;

pub use client::S7Client;
pub use connection::{S7ConnectionType, StreamTransport, Transport, TransportReader, TransportWriter};
pub use handler::ConnectionState;
pub use options::ConnectionOptions;
pub use s7_protocol::types::{PlcArea, ReadItem, VarType, WriteItem};
pub use s7_protocol::user_data::{Alarm, BlockInfo, BlockType};
pub use s7_protocol::SessionContext;
pub use tag::{Tag, TagParseState};
