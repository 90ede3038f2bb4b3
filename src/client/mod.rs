use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDateTime;
use tokio::sync::mpsc;

use crate::connection::transport::{dial, Transport};
use crate::errors::Error;
use crate::handler::{lock, ConnectionState, ProtocolHandler};
use crate::options::ConnectionOptions;
use crate::s7_protocol::types::{ReadItem, WriteItem};
use crate::s7_protocol::user_data::{Alarm, BlockInfo, BlockType};
use crate::s7_protocol::SessionContext;
use crate::tag::Tag;

// Default TCP connect timeout, separate from the per-call receive timeout.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Asynchronous S7 client over one multiplexed connection.
///
/// All operations take `&self`; many calls may run concurrently and are
/// paced by the job credits negotiated with the PLC.
///
/// ```rust,no_run
/// # tokio_test::block_on(async {
/// use s7link::{ConnectionOptions, S7Client};
///
/// let client = S7Client::connect(ConnectionOptions::new("192.168.10.72")).await?;
/// let values = client.read_tags(&["DB1.0,w,4", "M10.2,x"]).await?;
/// client.disconnect().await?;
/// # Ok::<(), s7link::errors::Error>(())
/// # });
/// ```
#[derive(Debug)]
pub struct S7Client {
    options: ConnectionOptions,
    handler: ProtocolHandler,
    registered: StdMutex<HashMap<String, Tag>>,
}

impl S7Client {
    fn new(options: ConnectionOptions) -> Self {
        Self {
            handler: ProtocolHandler::new(options.clone()),
            options,
            registered: StdMutex::new(HashMap::new()),
        }
    }

    /// Connect to the PLC named in `options` and negotiate the session.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the PLC is unreachable or the negotiation
    /// fails.
    pub async fn connect(options: ConnectionOptions) -> Result<Self, Error> {
        let client = Self::new(options);
        client.open().await?;
        Ok(client)
    }

    /// Open the session over a caller supplied transport, e.g. a tunneled
    /// stream or an in-memory pipe wired to a simulator.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the negotiation over `transport` fails.
    pub async fn connect_with<T: Transport>(
        options: ConnectionOptions,
        transport: T,
    ) -> Result<Self, Error> {
        let client = Self::new(options);
        client.handler.open(transport).await?;
        Ok(client)
    }

    async fn open(&self) -> Result<(), Error> {
        let stream = dial(&self.options.address, self.options.port, CONNECTION_TIMEOUT).await?;
        self.handler.open(stream).await
    }

    /// Close the session and cancel all in-flight work.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the close handshake fails; the connection
    /// is torn down regardless.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.handler.close().await
    }

    /// Current lifecycle state of the connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.handler.state()
    }

    /// Session parameters negotiated with the PLC.
    pub fn session(&self) -> SessionContext {
        self.handler.session()
    }

    /// Cache the parsed form of `tags` so later calls skip the parser.
    /// Registration is metadata only; nothing is sent to the PLC.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TagParse`] on the first malformed tag; none of the
    /// given tags is registered in that case.
    pub fn register<S: AsRef<str>>(&self, tags: &[S]) -> Result<(), Error> {
        let parsed = tags
            .iter()
            .map(|tag| Ok((tag.as_ref().to_string(), tag.as_ref().parse()?)))
            .collect::<Result<Vec<(String, Tag)>, Error>>()?;
        lock(&self.registered).extend(parsed);
        Ok(())
    }

    /// Drop tags from the registration cache.
    pub fn unregister<S: AsRef<str>>(&self, tags: &[S]) {
        let mut registered = lock(&self.registered);
        for tag in tags {
            registered.remove(tag.as_ref());
        }
    }

    fn tag_for(&self, tag: &str) -> Result<Tag, Error> {
        if let Some(parsed) = lock(&self.registered).get(tag) {
            return Ok(*parsed);
        }
        tag.parse()
    }

    /// Read a batch of tags, returning one result per tag in input order.
    ///
    /// # Errors
    ///
    /// Fails as a whole on parse errors, connection loss, or header level
    /// protocol errors; per-item failures are returned inside the vector.
    pub async fn read_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
    ) -> Result<Vec<Result<Bytes, Error>>, Error> {
        let items = tags
            .iter()
            .map(|tag| self.tag_for(tag.as_ref()).map(Tag::to_read_item))
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_open().await?;
        self.handler.read(&items).await
    }

    /// Read a single tag.
    ///
    /// # Errors
    ///
    /// See [`read_tags`](Self::read_tags).
    pub async fn read_tag(&self, tag: &str) -> Result<Bytes, Error> {
        let mut results = self.read_tags(&[tag]).await?;
        results.pop().unwrap_or(Err(Error::NotConnected))
    }

    /// Read pre-built items, bypassing the tag grammar.
    ///
    /// # Errors
    ///
    /// See [`read_tags`](Self::read_tags).
    pub async fn read_items(&self, items: &[ReadItem]) -> Result<Vec<Result<Bytes, Error>>, Error> {
        self.ensure_open().await?;
        self.handler.read(items).await
    }

    /// Write a batch of tags with their payloads, returning one result per
    /// tag in input order.
    ///
    /// # Errors
    ///
    /// Fails as a whole on parse errors, payload length mismatches,
    /// connection loss, or header level protocol errors.
    pub async fn write_tags<S: AsRef<str>>(
        &self,
        writes: &[(S, Bytes)],
    ) -> Result<Vec<Result<(), Error>>, Error> {
        let items = writes
            .iter()
            .map(|(tag, data)| {
                let item = self.tag_for(tag.as_ref())?.to_write_item(data.clone());
                if item.byte_len() != item.data.len() {
                    return Err(Error::PayloadLength {
                        expected: item.byte_len(),
                        provided: item.data.len(),
                    });
                }
                Ok(item)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.ensure_open().await?;
        self.handler.write(&items).await
    }

    /// Write a single tag.
    ///
    /// # Errors
    ///
    /// See [`write_tags`](Self::write_tags).
    pub async fn write_tag(&self, tag: &str, data: Bytes) -> Result<(), Error> {
        let mut results = self.write_tags(&[(tag, data)]).await?;
        results.pop().unwrap_or(Err(Error::NotConnected))
    }

    /// Write pre-built items, bypassing the tag grammar.
    ///
    /// # Errors
    ///
    /// See [`write_tags`](Self::write_tags).
    pub async fn write_items(
        &self,
        items: &[WriteItem],
    ) -> Result<Vec<Result<(), Error>>, Error> {
        self.ensure_open().await?;
        self.handler.write(items).await
    }

    /// Query the metadata of one PLC block.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] on connection loss or when the PLC rejects the
    /// query.
    pub async fn read_block_info(
        &self,
        block_type: BlockType,
        block_number: u16,
    ) -> Result<BlockInfo, Error> {
        self.ensure_open().await?;
        self.handler.read_block_info(block_type, block_number).await
    }

    /// Collect the alarms currently pending on the PLC.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] on connection loss or when the PLC rejects the
    /// query.
    pub async fn read_pending_alarms(&self) -> Result<Vec<Alarm>, Error> {
        self.ensure_open().await?;
        self.handler.read_pending_alarms().await
    }

    /// Subscribe to unsolicited alarm indications. The returned channel
    /// closes on disconnect or [`unsubscribe_alarms`](Self::unsubscribe_alarms).
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the subscription cannot be established.
    pub async fn subscribe_alarms(&self) -> Result<mpsc::UnboundedReceiver<Alarm>, Error> {
        self.ensure_open().await?;
        self.handler.subscribe_alarms().await
    }

    /// Stop unsolicited alarm delivery.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] when the PLC rejects the request.
    pub async fn unsubscribe_alarms(&self) -> Result<(), Error> {
        self.ensure_open().await?;
        self.handler.unsubscribe_alarms().await
    }

    /// Read the PLC wall clock.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] on connection loss or an undecodable clock
    /// payload.
    pub async fn read_clock(&self) -> Result<NaiveDateTime, Error> {
        self.ensure_open().await?;
        self.handler.read_clock().await
    }

    async fn ensure_open(&self) -> Result<(), Error> {
        match self.handler.state() {
            ConnectionState::Opened => Ok(()),
            ConnectionState::Closed if self.options.reconnect => self.open().await,
            _ => Err(Error::NotConnected),
        }
    }
}
