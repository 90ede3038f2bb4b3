//! The protocol engine: connection lifecycle, request/response dispatch by
//! PDU reference, and the parallelism credits negotiated with the peer.

use std::convert::TryFrom;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::connection::iso::{
    self, CoTp, CotpConnection, CotpData, FrameAccumulator, PDU_TYPE_DC, PDU_TYPE_DR,
};
use crate::connection::transport::{Transport, TransportReader, TransportWriter};
use crate::errors::Error;
use crate::options::ConnectionOptions;
use crate::s7_protocol::header::{PduType, S7Header};
use crate::s7_protocol::negotiate::{self, CommSetupParams, NEGOTIATE_FUNCTION_CODE};
use crate::s7_protocol::packing::{
    merge_read_results, merge_write_results, plan_read, plan_write, ReadPackage, WritePackage,
};
use crate::s7_protocol::segments::data_item::{DataItem, ITEM_OK};
use crate::s7_protocol::segments::parameters::ReadWriteParams;
use crate::s7_protocol::types::{ReadItem, WriteItem, READ_OPERATION, WRITE_OPERATION};
use crate::s7_protocol::user_data::{
    self, Alarm, BlockInfo, BlockType, UserDataResponse, GROUP_CPU, SUB_ALARM_INDICATION,
};
use crate::s7_protocol::SessionContext;

pub(crate) mod pending;
pub(crate) mod reference;

use pending::{CallKind, PendingCalls, S7Response};
use reference::ReferenceId;

/// Lifecycle of one connection. Transitions run forward only, or back to
/// [`Closed`](ConnectionState::Closed) from anywhere. Only
/// [`Opened`](ConnectionState::Opened) admits user operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport.
    Closed,
    /// COTP connection request sent, waiting for the confirm.
    PendingOpenRfc1006,
    /// ISO transport established.
    TransportOpened,
    /// COMM-SETUP job sent, waiting for the acknowledge.
    PendingOpenPlc,
    /// Session parameters negotiated; operations may run.
    Opened,
}

// A poisoned lock only means another task panicked mid-update of plain
// state; continue with the inner value.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The protocol handler. Owns the transport, the session parameters and the
/// in-flight maps; all methods take `&self` so one handler can serve many
/// concurrent callers.
pub(crate) struct ProtocolHandler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("state", &self.state())
            .field("session", &self.session())
            .finish()
    }
}

struct Shared {
    options: ConnectionOptions,
    state: StdMutex<ConnectionState>,
    session: StdMutex<SessionContext>,
    pending: StdMutex<PendingCalls>,
    credits: StdMutex<Option<Arc<Semaphore>>>,
    writer: AsyncMutex<Option<Box<dyn TransportWriter>>>,
    reference: ReferenceId,
    receive_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ProtocolHandler {
    pub(crate) fn new(options: ConnectionOptions) -> Self {
        let session = initial_session(&options);
        Self {
            shared: Arc::new(Shared {
                options,
                state: StdMutex::new(ConnectionState::Closed),
                session: StdMutex::new(session),
                pending: StdMutex::new(PendingCalls::default()),
                credits: StdMutex::new(None),
                writer: AsyncMutex::new(None),
                reference: ReferenceId::new(),
                receive_task: StdMutex::new(None),
            }),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub(crate) fn session(&self) -> SessionContext {
        *lock(&self.shared.session)
    }

    /// Open a session over `transport`: COTP handshake, then COMM-SETUP
    /// through the dispatcher. Idempotent while already opened.
    pub(crate) async fn open<T: Transport>(&self, transport: T) -> Result<(), Error> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Closed => *state = ConnectionState::PendingOpenRfc1006,
                ConnectionState::Opened => return Ok(()),
                _ => return Err(Error::NotConnected),
            }
        }
        match self.open_inner(transport).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.shared.teardown().await;
                Err(error)
            }
        }
    }

    async fn open_inner<T: Transport>(&self, transport: T) -> Result<(), Error> {
        let shared = &self.shared;
        *lock(&shared.session) = initial_session(&shared.options);

        let (mut reader, writer) = transport.into_split();
        *shared.writer.lock().await = Some(Box::new(writer));

        // COTP handshake, driven inline before the receive loop owns the
        // reader.
        let request = iso::connect_frame(
            shared.options.pdu_size,
            iso::remote_tsap(
                shared.options.connection_type,
                shared.options.rack,
                shared.options.slot,
            ),
        );
        shared.send_raw(&request).await?;

        let mut accumulator = FrameAccumulator::new();
        let mut body = timeout(
            shared.options.receive_timeout,
            next_frame(&mut reader, &mut accumulator),
        )
        .await
        .map_err(|_| Error::Timeout { pdu_ref: None })??;
        let confirm = CotpConnection::try_from(&mut body)?;
        confirm.req_ok()?;
        *lock(&shared.state) = ConnectionState::TransportOpened;

        // The receive loop takes over the reader together with any tail the
        // handshake read already buffered.
        let handle = tokio::spawn(receive_loop(reader, accumulator, Arc::clone(shared)));
        *lock(&shared.receive_task) = Some(handle);

        // COMM-SETUP negotiation through the dispatcher.
        *lock(&shared.state) = ConnectionState::PendingOpenPlc;
        let pdu_ref = shared.reference.next();
        let (completion, response) = oneshot::channel();
        lock(&shared.pending).register_setup(pdu_ref, completion);
        let job = negotiate::build_job(
            pdu_ref,
            CommSetupParams::build(shared.options.max_parallel_jobs, shared.options.pdu_size),
        );
        shared.send_frame(job).await?;

        let setup = match timeout(shared.options.receive_timeout * 10, response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::NotConnected),
            Err(_) => {
                lock(&shared.pending).clear_setup();
                return Err(Error::Timeout {
                    pdu_ref: Some(pdu_ref),
                });
            }
        };
        match setup {
            S7Response::Setup(params) => {
                shared.adopt_session(params);
                Ok(())
            }
            _ => Err(Error::InvalidPdu("unexpected COMM-SETUP response")),
        }
    }

    /// Close the session: best-effort disable of alarm delivery and COTP
    /// disconnect, then unconditional cancellation of all in-flight work.
    pub(crate) async fn close(&self) -> Result<(), Error> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }

        if lock(&self.shared.pending).alarm_subscription.is_some()
            && self.state() == ConnectionState::Opened
        {
            let pdu_ref = self.shared.reference.next();
            let job = user_data::build_alarm_update_job(pdu_ref, false);
            if let Err(error) = self.shared.send_frame(job).await {
                debug!("could not disable alarm updates on close: {error}");
            }
        }
        if let Err(error) = self.shared.send_raw(&iso::disconnect_frame()).await {
            debug!("could not announce disconnect: {error}");
        }

        if let Some(handle) = lock(&self.shared.receive_task).take() {
            handle.abort();
        }
        self.shared.teardown().await;

        // Grace delay so a subsequent re-open starts from a settled
        // transport.
        sleep(Duration::from_millis(1)).await;
        Ok(())
    }

    /// Read a batch of logical items. Results are in input order; per-item
    /// failures are returned structurally, and any failing package fails
    /// the whole call.
    pub(crate) async fn read(
        &self,
        items: &[ReadItem],
    ) -> Result<Vec<Result<Bytes, Error>>, Error> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session();
        let mut packages = plan_read(items, &session)?;
        let mut responses = Vec::with_capacity(packages.len());
        for package in &mut packages {
            debug!(
                "read package: {} items, {} request bytes, at most {} response bytes",
                package.items.len(),
                package.request_len(),
                package.response_len()
            );
            let response = self
                .transaction(CallKind::Read, |pdu_ref| {
                    encode_read_job(pdu_ref, items, package)
                })
                .await?;
            package.handled = true;
            match response {
                S7Response::ReadItems(decoded) => responses.push(decoded),
                _ => return Err(Error::InvalidPdu("unexpected response to a read job")),
            }
        }
        merge_read_results(items, &packages, responses)
    }

    /// Write a batch of logical items, returning one result per item in
    /// input order.
    pub(crate) async fn write(
        &self,
        items: &[WriteItem],
    ) -> Result<Vec<Result<(), Error>>, Error> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session();
        let mut packages = plan_write(items, &session)?;
        let mut responses = Vec::with_capacity(packages.len());
        for package in &mut packages {
            debug!(
                "write package: {} items, {} request bytes",
                package.items.len(),
                package.request_len()
            );
            let response = self
                .transaction(CallKind::Write, |pdu_ref| {
                    encode_write_job(pdu_ref, items, package)
                })
                .await?;
            package.handled = true;
            match response {
                S7Response::WriteCodes(codes) => responses.push(codes),
                _ => return Err(Error::InvalidPdu("unexpected response to a write job")),
            }
        }
        merge_write_results(items.len(), &packages, responses)
    }

    /// Query the metadata of one PLC block.
    pub(crate) async fn read_block_info(
        &self,
        block_type: BlockType,
        block_number: u16,
    ) -> Result<BlockInfo, Error> {
        let response = self
            .transaction(CallKind::BlockInfo, |pdu_ref| {
                user_data::build_block_info_job(pdu_ref, block_type, block_number)
            })
            .await?;
        let mut data = expect_user_data(response)?;
        BlockInfo::try_from(&mut data.payload)
    }

    /// Collect the alarms currently pending on the PLC, following the
    /// peer's sequence numbers until the last fragment.
    pub(crate) async fn read_pending_alarms(&self) -> Result<Vec<Alarm>, Error> {
        let mut alarms = Vec::new();
        let mut sequence = 0u8;
        for _ in 0..=usize::from(u8::MAX) {
            let response = self
                .transaction(CallKind::Alarm, |pdu_ref| {
                    user_data::build_pending_alarm_job(pdu_ref, sequence)
                })
                .await?;
            let data = expect_user_data(response)?;
            alarms.extend(user_data::parse_alarms(&data.payload)?);
            if data.last_data_unit {
                return Ok(alarms);
            }
            sequence = data.sequence;
        }
        Err(Error::InvalidPdu("unterminated pending alarm query"))
    }

    /// Enable unsolicited alarm indications. The returned channel is the
    /// subscription; it is closed on disconnect or
    /// [`unsubscribe_alarms`](Self::unsubscribe_alarms).
    pub(crate) async fn subscribe_alarms(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Alarm>, Error> {
        // Install the slot first so indications arriving right behind the
        // acknowledge are not dropped.
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.shared.pending).alarm_subscription = Some(sender);

        let result = self
            .transaction(CallKind::Alarm, |pdu_ref| {
                user_data::build_alarm_update_job(pdu_ref, true)
            })
            .await
            .and_then(expect_user_data);
        match result {
            Ok(_) => Ok(receiver),
            Err(error) => {
                lock(&self.shared.pending).alarm_subscription = None;
                Err(error)
            }
        }
    }

    /// Disable unsolicited alarm indications and clear the subscription.
    pub(crate) async fn unsubscribe_alarms(&self) -> Result<(), Error> {
        lock(&self.shared.pending).alarm_subscription = None;
        let response = self
            .transaction(CallKind::Alarm, |pdu_ref| {
                user_data::build_alarm_update_job(pdu_ref, false)
            })
            .await?;
        expect_user_data(response)?;
        Ok(())
    }

    /// Read the PLC wall clock.
    pub(crate) async fn read_clock(&self) -> Result<NaiveDateTime, Error> {
        let response = self
            .transaction(CallKind::BlockInfo, user_data::build_clock_read_job)
            .await?;
        let data = expect_user_data(response)?;
        user_data::parse_clock(&data.payload)
    }

    /// Generic request/response: acquire one credit, allocate a reference,
    /// register the completion, send, await with the session timeout.
    async fn transaction<F>(&self, kind: CallKind, encode: F) -> Result<S7Response, Error>
    where
        F: FnOnce(u16) -> BytesMut,
    {
        if self.state() != ConnectionState::Opened {
            return Err(Error::NotConnected);
        }
        let semaphore = lock(&self.shared.credits)
            .clone()
            .ok_or(Error::NotConnected)?;
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::NotConnected)?;

        let pdu_ref = self.shared.reference.next();
        let (completion, response) = oneshot::channel();
        lock(&self.shared.pending).insert(kind, pdu_ref, completion);

        if let Err(error) = self.shared.send_frame(encode(pdu_ref)).await {
            lock(&self.shared.pending).remove(kind, pdu_ref);
            return Err(error);
        }

        match timeout(self.session().timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                lock(&self.shared.pending).remove(kind, pdu_ref);
                Err(Error::Timeout {
                    pdu_ref: Some(pdu_ref),
                })
            }
        }
    }
}

fn initial_session(options: &ConnectionOptions) -> SessionContext {
    SessionContext {
        timeout: options.receive_timeout,
        pdu_size: options.pdu_size,
        max_am_q_calling: 0,
        max_am_q_called: 0,
    }
}

impl Shared {
    /// Adopt negotiated session parameters, size the credit semaphore, and
    /// admit user operations.
    fn adopt_session(&self, params: CommSetupParams) {
        let permits;
        {
            let mut session = lock(&self.session);
            if params.pdu_length > 0 {
                session.pdu_size = session.pdu_size.min(params.pdu_length);
            }
            session.max_am_q_calling = params.max_am_q_calling.max(1);
            session.max_am_q_called = params.max_am_q_called.max(1);
            permits = usize::from(session.max_am_q_calling);
            debug!(
                "session negotiated: pdu size {}, {} parallel jobs",
                session.pdu_size, session.max_am_q_calling
            );
        }
        *lock(&self.credits) = Some(Arc::new(Semaphore::new(permits)));
        *lock(&self.state) = ConnectionState::Opened;
    }

    async fn send_raw(&self, frame: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => Ok(writer.write_frame(frame).await?),
            None => Err(Error::NotConnected),
        }
    }

    async fn send_frame(&self, payload: BytesMut) -> Result<(), Error> {
        self.send_raw(&iso::data_frame(payload)).await
    }

    /// Transition to `Closed`: dispose the credits, shut the writer, and
    /// resolve every pending completion with the disconnect sentinel.
    async fn teardown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        if let Some(semaphore) = lock(&self.credits).take() {
            semaphore.close();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                debug!("transport shutdown failed: {error}");
            }
        }
        lock(&self.pending).fail_all();
    }

    /// Route one received telegram. Undecodable or unknown PDUs are logged
    /// and ignored; no pending call resolves for them.
    async fn dispatch_frame(&self, mut frame: BytesMut) {
        let cotp = match CotpData::try_from(&mut frame) {
            Ok(cotp) => cotp,
            Err(_) => return,
        };
        if cotp.req_ok().is_err() {
            match cotp.get_pdu_type() {
                PDU_TYPE_DR | PDU_TYPE_DC => {
                    debug!("peer reset the transport connection");
                    self.teardown().await;
                }
                other => debug!("ignoring COTP PDU type {other:#04x}"),
            }
            return;
        }
        if !cotp.is_last() {
            warn!("multi fragment COTP payloads are not supported");
        }

        let header = match S7Header::try_from(&mut frame) {
            Ok(header) => header,
            Err(error) => {
                warn!("ignoring undecodable S7 PDU: {error}");
                return;
            }
        };
        match header.pdu_type {
            PduType::Job => self.dispatch_job(header, frame).await,
            PduType::Ack | PduType::AckData => self.dispatch_ack(header, frame),
            PduType::UserData => self.dispatch_user_data(header, frame),
        }
    }

    /// Jobs initiated by the peer. Only COMM-SETUP is meaningful: reply,
    /// adopt the peer's parameters, and open without waiting.
    async fn dispatch_job(&self, header: S7Header, mut frame: BytesMut) {
        match frame.first().copied() {
            Some(NEGOTIATE_FUNCTION_CODE) => {
                let params = match CommSetupParams::try_from(&mut frame) {
                    Ok(params) => params,
                    Err(error) => {
                        warn!("ignoring malformed COMM-SETUP job: {error}");
                        return;
                    }
                };
                // Adopt before acknowledging: once the ack is on the wire
                // the peer may act on the new parameters.
                self.adopt_session(params);
                let ack = negotiate::build_ack(header.pdu_ref, params);
                if let Err(error) = self.send_frame(ack).await {
                    warn!("could not acknowledge COMM-SETUP: {error}");
                }
            }
            Some(function) => debug!("ignoring job with function {function:#04x}"),
            None => debug!("ignoring job without parameters"),
        }
    }

    fn dispatch_ack(&self, header: S7Header, mut frame: BytesMut) {
        let pdu_ref = header.pdu_ref;
        if header.has_error() {
            let (class, code) = header.error.unwrap_or((0, 0));
            lock(&self.pending)
                .resolve_anywhere(pdu_ref, || Error::ProtocolError { class, code });
            return;
        }
        match frame.first().copied() {
            Some(NEGOTIATE_FUNCTION_CODE) => {
                let result = CommSetupParams::try_from(&mut frame).map(S7Response::Setup);
                lock(&self.pending).resolve_setup(pdu_ref, result);
            }
            Some(READ_OPERATION) => {
                let result = decode_read_ack(&mut frame);
                lock(&self.pending).resolve(CallKind::Read, pdu_ref, result);
            }
            Some(WRITE_OPERATION) => {
                let result = decode_write_ack(&mut frame);
                lock(&self.pending).resolve(CallKind::Write, pdu_ref, result);
            }
            Some(function) => debug!("ignoring acknowledge with function {function:#04x}"),
            None => debug!("ignoring acknowledge without parameters"),
        }
    }

    fn dispatch_user_data(&self, header: S7Header, mut frame: BytesMut) {
        let response = match user_data::parse_response(&mut frame) {
            Ok(response) => response,
            Err(error) => {
                warn!("ignoring undecodable user data PDU: {error}");
                return;
            }
        };

        // Reference zero is reserved for unsolicited indications.
        if header.pdu_ref == 0 {
            if response.sub_function == SUB_ALARM_INDICATION {
                self.fan_out_alarms(&response);
            } else {
                debug!(
                    "ignoring unsolicited user data subfunction {:#04x}",
                    response.sub_function
                );
            }
            return;
        }

        let kind = if response.group == GROUP_CPU {
            CallKind::Alarm
        } else {
            CallKind::BlockInfo
        };
        lock(&self.pending).resolve(kind, header.pdu_ref, Ok(S7Response::UserData(response)));
    }

    fn fan_out_alarms(&self, response: &UserDataResponse) {
        let alarms = match user_data::parse_alarms(&response.payload) {
            Ok(alarms) => alarms,
            Err(error) => {
                warn!("undecodable alarm indication: {error}");
                return;
            }
        };
        let mut pending = lock(&self.pending);
        match pending.alarm_subscription.take() {
            Some(subscription) => {
                let delivered = alarms
                    .into_iter()
                    .all(|alarm| subscription.send(alarm).is_ok());
                if delivered {
                    pending.alarm_subscription = Some(subscription);
                } else {
                    debug!("alarm subscriber gone; clearing the subscription slot");
                }
            }
            None => debug!("alarm indication without subscriber"),
        }
    }
}

fn decode_read_ack(frame: &mut BytesMut) -> Result<S7Response, Error> {
    let params = ReadWriteParams::try_from(&mut *frame)?;
    let items = DataItem::parse_all(frame, usize::from(params.item_count))?;
    Ok(S7Response::ReadItems(items))
}

fn decode_write_ack(frame: &mut BytesMut) -> Result<S7Response, Error> {
    let params = ReadWriteParams::try_from(&mut *frame)?;
    let count = usize::from(params.item_count);
    if frame.len() < count {
        return Err(Error::InvalidPdu("write acknowledge truncated"));
    }
    Ok(S7Response::WriteCodes(frame.split_to(count).to_vec()))
}

fn encode_read_job(pdu_ref: u16, items: &[ReadItem], package: &ReadPackage) -> BytesMut {
    let request_items = package
        .items
        .iter()
        .map(|slice| slice.read_request_item(items))
        .collect();
    let params = BytesMut::from(ReadWriteParams::build_read(request_items));
    let mut bytes = BytesMut::with_capacity(S7Header::len_request() + params.len());
    bytes.put(BytesMut::from(S7Header::build_job(
        pdu_ref,
        params.len() as u16,
        0,
    )));
    bytes.put(params);
    bytes
}

fn encode_write_job(pdu_ref: u16, items: &[WriteItem], package: &WritePackage) -> BytesMut {
    let request_items = package
        .items
        .iter()
        .map(|slice| slice.write_request_item(items))
        .collect();
    let data_items: Vec<DataItem> = package
        .items
        .iter()
        .map(|slice| slice.write_data_item(items))
        .collect();
    let params = BytesMut::from(ReadWriteParams::build_write(request_items));
    let data = DataItem::encode_all(&data_items);
    let mut bytes = BytesMut::with_capacity(S7Header::len_request() + params.len() + data.len());
    bytes.put(BytesMut::from(S7Header::build_job(
        pdu_ref,
        params.len() as u16,
        data.len() as u16,
    )));
    bytes.put(params);
    bytes.put(data);
    bytes
}

/// Unwrap a user data response, raising header and data unit errors.
fn expect_user_data(response: S7Response) -> Result<UserDataResponse, Error> {
    match response {
        S7Response::UserData(data) => {
            if data.error_code != 0 {
                return Err(Error::ProtocolError {
                    class: (data.error_code >> 8) as u8,
                    code: (data.error_code & 0xFF) as u8,
                });
            }
            if data.return_code != ITEM_OK {
                return Err(Error::ProtocolContent {
                    return_code: data.return_code,
                    item_index: 0,
                });
            }
            Ok(data)
        }
        _ => Err(Error::InvalidPdu("unexpected response to a user data job")),
    }
}

/// Read until the accumulator yields one telegram. Used for the handshake
/// before the receive loop owns the reader.
async fn next_frame<R: TransportReader>(
    reader: &mut R,
    accumulator: &mut FrameAccumulator,
) -> Result<BytesMut, Error> {
    let mut buffer = BytesMut::with_capacity(1024);
    loop {
        if let Some(frame) = accumulator.next_frame()? {
            return Ok(frame);
        }
        buffer.clear();
        let read = reader.read_some(&mut buffer).await?;
        if read == 0 {
            return Err(Error::NotConnected);
        }
        accumulator.extend(&buffer);
    }
}

/// The single receive loop of a connection. Ends on EOF, transport error,
/// or a framing error, and then performs the full teardown.
async fn receive_loop<R: TransportReader>(
    mut reader: R,
    mut accumulator: FrameAccumulator,
    shared: Arc<Shared>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    'receive: loop {
        loop {
            match accumulator.next_frame() {
                Ok(Some(frame)) => shared.dispatch_frame(frame).await,
                Ok(None) => break,
                Err(error) => {
                    warn!("closing connection after framing error: {error}");
                    break 'receive;
                }
            }
        }
        buffer.clear();
        match reader.read_some(&mut buffer).await {
            Ok(0) => {
                debug!("peer closed the transport");
                break;
            }
            Ok(_) => accumulator.extend(&buffer),
            Err(error) => {
                warn!("transport receive failed: {error}");
                break;
            }
        }
    }
    shared.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::StreamTransport;
    use crate::s7_protocol::types::{PlcArea, VarType};
    use crate::s7_protocol::user_data::encode_alarms;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn options() -> ConnectionOptions {
        ConnectionOptions::new("127.0.0.1").receive_timeout(Duration::from_millis(200))
    }

    fn byte_read(offset: u32, count: u16) -> ReadItem {
        ReadItem {
            area: PlcArea::DataBlock(1),
            offset,
            var_type: VarType::Byte,
            count,
        }
    }

    async fn peer_read_frame(stream: &mut DuplexStream) -> BytesMut {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("TPKT header");
        assert_eq!(header[0], 3);
        let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let mut body = vec![0u8; total - 4];
        stream.read_exact(&mut body).await.expect("frame body");
        BytesMut::from(&body[..])
    }

    /// Read a frame and strip the COTP data header, returning the S7 PDU.
    async fn peer_read_pdu(stream: &mut DuplexStream) -> BytesMut {
        let mut body = peer_read_frame(stream).await;
        CotpData::try_from(&mut body).expect("COTP data header");
        body
    }

    async fn peer_send_raw(stream: &mut DuplexStream, body: &[u8]) {
        let mut frame = BytesMut::from(iso::TpktHeader::build((body.len() + 4) as u16));
        frame.extend_from_slice(body);
        stream.write_all(&frame).await.expect("peer send");
    }

    async fn peer_send_pdu(stream: &mut DuplexStream, payload: BytesMut) {
        let frame = iso::data_frame(payload);
        stream.write_all(&frame).await.expect("peer send");
    }

    /// Accept the COTP handshake and the COMM-SETUP job, answering with
    /// the given session parameters.
    async fn peer_accept(stream: &mut DuplexStream, pdu_length: u16, max_jobs: u16) {
        let request = peer_read_frame(stream).await;
        assert_eq!(request[1], 0xE0, "expected a COTP connection request");
        // minimal connection confirm
        peer_send_raw(stream, &[6, 0xD0, 0x00, 0x00, 0x01, 0x00, 0x00]).await;

        let mut setup = peer_read_pdu(stream).await;
        let header = S7Header::try_from(&mut setup).expect("COMM-SETUP header");
        CommSetupParams::try_from(&mut setup).expect("COMM-SETUP params");
        let params = CommSetupParams {
            max_am_q_calling: max_jobs,
            max_am_q_called: max_jobs,
            pdu_length,
        };
        peer_send_pdu(stream, negotiate::build_ack(header.pdu_ref, params)).await;
    }

    /// Decode a read job far enough to answer it: reference plus the
    /// per-item requested byte lengths.
    fn parse_read_job(pdu: &mut BytesMut) -> (u16, Vec<usize>) {
        let header = S7Header::try_from(&mut *pdu).expect("read job header");
        let params = ReadWriteParams::try_from(&mut *pdu).expect("read job params");
        assert_eq!(params.function_code, READ_OPERATION);
        let mut lengths = Vec::new();
        for chunk in pdu.chunks_exact(12).take(usize::from(params.item_count)) {
            lengths.push(usize::from(u16::from_be_bytes([chunk[4], chunk[5]])));
        }
        (header.pdu_ref, lengths)
    }

    fn read_ack(pdu_ref: u16, payloads: &[Vec<u8>]) -> BytesMut {
        let mut data = BytesMut::new();
        for (index, payload) in payloads.iter().enumerate() {
            data.put_u8(ITEM_OK);
            data.put_u8(0x04);
            data.put_u16((payload.len() * 8) as u16);
            data.put_slice(payload);
            if index + 1 < payloads.len() && payload.len() % 2 == 1 {
                data.put_u8(0);
            }
        }
        let mut params = BytesMut::new();
        params.put_u8(READ_OPERATION);
        params.put_u8(payloads.len() as u8);

        let mut pdu = BytesMut::from(S7Header::build_ack_data(
            pdu_ref,
            params.len() as u16,
            data.len() as u16,
        ));
        pdu.put(params);
        pdu.put(data);
        pdu
    }

    fn user_data_response(
        pdu_ref: u16,
        group: u8,
        sub_function: u8,
        sequence: u8,
        last: bool,
        payload: &[u8],
    ) -> BytesMut {
        let mut pdu = BytesMut::from(S7Header::build_user_data(
            pdu_ref,
            12,
            (4 + payload.len()) as u16,
        ));
        pdu.put_slice(&[0x00, 0x01, 0x12, 0x08, 0x12]);
        pdu.put_u8((0x8 << 4) | group);
        pdu.put_u8(sub_function);
        pdu.put_u8(sequence);
        pdu.put_u8(0x00); // data unit reference
        pdu.put_u8(u8::from(!last));
        pdu.put_u16(0); // no error
        pdu.put_u8(ITEM_OK);
        pdu.put_u8(0x09);
        pdu.put_u16(payload.len() as u16);
        pdu.put_slice(payload);
        pdu
    }

    #[tokio::test]
    async fn open_negotiates_and_close_disposes() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options().max_parallel_jobs(8));
        assert_eq!(handler.state(), ConnectionState::Closed);

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 4).await;
            peer
        });
        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");
        // Keep the peer end alive so EOF does not race the assertions.
        let _peer = peer_task.await.expect("peer should not panic");

        assert_eq!(handler.state(), ConnectionState::Opened);
        let session = handler.session();
        assert_eq!(session.pdu_size, 480);
        assert_eq!(session.max_am_q_calling, 4);

        handler.close().await.expect("close should succeed");
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert!(lock(&handler.shared.credits).is_none());
        assert!(lock(&handler.shared.pending).is_empty());

        let error = handler.read(&[byte_read(0, 1)]).await;
        assert!(matches!(error, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn responses_are_correlated_by_reference() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 8).await;

            // Two read jobs, answered in reverse arrival order. The echoed
            // payload marks the requested length, so each caller can verify
            // it got its own answer.
            let mut first = peer_read_pdu(&mut peer).await;
            let mut second = peer_read_pdu(&mut peer).await;
            let (first_ref, first_lengths) = parse_read_job(&mut first);
            let (second_ref, second_lengths) = parse_read_job(&mut second);
            assert_ne!(first_ref, second_ref);

            peer_send_pdu(
                &mut peer,
                read_ack(
                    second_ref,
                    &[vec![second_lengths[0] as u8; second_lengths[0]]],
                ),
            )
            .await;
            peer_send_pdu(
                &mut peer,
                read_ack(
                    first_ref,
                    &[vec![first_lengths[0] as u8; first_lengths[0]]],
                ),
            )
            .await;
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");

        let items_a = [byte_read(0, 2)];
        let items_b = [byte_read(0, 4)];
        let read_a = handler.read(&items_a);
        let read_b = handler.read(&items_b);
        let (result_a, result_b) = tokio::join!(read_a, read_b);
        peer_task.await.expect("peer should not panic");

        let data_a = result_a.expect("read A should succeed")[0]
            .as_ref()
            .expect("item A should succeed")
            .clone();
        let data_b = result_b.expect("read B should succeed")[0]
            .as_ref()
            .expect("item B should succeed")
            .clone();
        assert_eq!(data_a.as_ref(), &[2, 2]);
        assert_eq!(data_b.as_ref(), &[4, 4, 4, 4]);
    }

    #[tokio::test]
    async fn credits_bound_the_number_of_wire_requests() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 2).await;

            let mut first = peer_read_pdu(&mut peer).await;
            let mut second = peer_read_pdu(&mut peer).await;
            // Both credits are taken: the third job must not arrive yet.
            let stalled = timeout(Duration::from_millis(50), peer_read_frame(&mut peer)).await;
            assert!(stalled.is_err(), "third request leaked past the credits");

            let (first_ref, first_lengths) = parse_read_job(&mut first);
            let (second_ref, second_lengths) = parse_read_job(&mut second);
            peer_send_pdu(
                &mut peer,
                read_ack(first_ref, &[vec![1; first_lengths[0]]]),
            )
            .await;
            peer_send_pdu(
                &mut peer,
                read_ack(second_ref, &[vec![2; second_lengths[0]]]),
            )
            .await;

            let mut third = peer_read_pdu(&mut peer).await;
            let (third_ref, third_lengths) = parse_read_job(&mut third);
            peer_send_pdu(
                &mut peer,
                read_ack(third_ref, &[vec![3; third_lengths[0]]]),
            )
            .await;
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");
        assert_eq!(handler.session().max_am_q_calling, 2);

        let items_one = [byte_read(0, 1)];
        let items_two = [byte_read(1, 1)];
        let items_three = [byte_read(2, 1)];
        let (one, two, three) = tokio::join!(
            handler.read(&items_one),
            handler.read(&items_two),
            handler.read(&items_three),
        );
        peer_task.await.expect("peer should not panic");
        assert!(one.is_ok() && two.is_ok() && three.is_ok());
    }

    #[tokio::test]
    async fn timeouts_clean_up_the_pending_call() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 4).await;
            // swallow the read job without answering
            let _ = peer_read_pdu(&mut peer).await;
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");

        let result = handler.read(&[byte_read(0, 1)]).await;
        assert!(matches!(
            result,
            Err(Error::Timeout { pdu_ref: Some(_) })
        ));
        assert!(lock(&handler.shared.pending).is_empty());

        peer_task.await.expect("peer should not panic");
    }

    #[tokio::test]
    async fn peer_reset_fails_in_flight_calls() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 4).await;
            let _ = peer_read_pdu(&mut peer).await;
            drop(peer); // EOF towards the client
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");

        let result = handler.read(&[byte_read(0, 1)]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(handler.state(), ConnectionState::Closed);
        assert!(lock(&handler.shared.pending).is_empty());

        peer_task.await.expect("peer should not panic");
    }

    #[tokio::test]
    async fn peer_initiated_setup_is_acknowledged_and_adopted() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 960, 8).await;

            // Peer renegotiates the session.
            let params = CommSetupParams {
                max_am_q_calling: 2,
                max_am_q_called: 2,
                pdu_length: 240,
            };
            peer_send_pdu(&mut peer, negotiate::build_job(0x77, params)).await;

            let mut ack = peer_read_pdu(&mut peer).await;
            let header = S7Header::try_from(&mut ack).expect("setup ack header");
            assert_eq!(header.pdu_type, PduType::AckData);
            assert_eq!(header.pdu_ref, 0x77);
            let echoed = CommSetupParams::try_from(&mut ack).expect("setup ack params");
            assert_eq!(echoed.pdu_length, 240);
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");
        // Keep the peer end alive so EOF does not race the assertions.
        let _peer = peer_task.await.expect("peer should not panic");

        let session = handler.session();
        assert_eq!(session.pdu_size, 240);
        assert_eq!(session.max_am_q_calling, 2);
        assert_eq!(handler.state(), ConnectionState::Opened);
    }

    #[tokio::test]
    async fn pending_alarms_follow_the_fragment_sequence() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let first_alarm = Alarm {
            event_id: 0x0001_0001,
            is_coming: true,
            is_acked: false,
        };
        let second_alarm = Alarm {
            event_id: 0x0001_0002,
            is_coming: false,
            is_acked: true,
        };

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 4).await;

            let mut query = peer_read_pdu(&mut peer).await;
            let header = S7Header::try_from(&mut query).expect("alarm query header");
            peer_send_pdu(
                &mut peer,
                user_data_response(
                    header.pdu_ref,
                    GROUP_CPU,
                    user_data::SUB_ALARM_QUERY,
                    3,
                    false,
                    &encode_alarms(&[first_alarm]),
                ),
            )
            .await;

            let mut follow_up = peer_read_pdu(&mut peer).await;
            let header = S7Header::try_from(&mut follow_up).expect("follow up header");
            peer_send_pdu(
                &mut peer,
                user_data_response(
                    header.pdu_ref,
                    GROUP_CPU,
                    user_data::SUB_ALARM_QUERY,
                    3,
                    true,
                    &encode_alarms(&[second_alarm]),
                ),
            )
            .await;
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");
        let alarms = handler
            .read_pending_alarms()
            .await
            .expect("alarm query should succeed");
        peer_task.await.expect("peer should not panic");

        assert_eq!(alarms, vec![first_alarm, second_alarm]);
    }

    #[tokio::test]
    async fn alarm_indications_fan_out_to_the_subscription() {
        let (client_end, mut peer) = tokio::io::duplex(4096);
        let handler = ProtocolHandler::new(options());

        let indication = Alarm {
            event_id: 0xCAFE,
            is_coming: true,
            is_acked: false,
        };

        let peer_task = tokio::spawn(async move {
            peer_accept(&mut peer, 480, 4).await;

            let mut subscribe = peer_read_pdu(&mut peer).await;
            let header = S7Header::try_from(&mut subscribe).expect("subscribe header");
            peer_send_pdu(
                &mut peer,
                user_data_response(
                    header.pdu_ref,
                    GROUP_CPU,
                    user_data::SUB_MESSAGE_SERVICE,
                    0,
                    true,
                    &[],
                ),
            )
            .await;

            // Unsolicited indication with reference zero.
            peer_send_pdu(
                &mut peer,
                user_data_response(
                    0,
                    GROUP_CPU,
                    SUB_ALARM_INDICATION,
                    0,
                    true,
                    &encode_alarms(&[indication]),
                ),
            )
            .await;
            peer
        });

        handler
            .open(StreamTransport(client_end))
            .await
            .expect("open should succeed");
        let mut subscription = handler
            .subscribe_alarms()
            .await
            .expect("subscribe should succeed");
        let received = subscription.recv().await.expect("indication expected");
        peer_task.await.expect("peer should not panic");

        assert_eq!(received, indication);

        handler.close().await.expect("close should succeed");
        // The subscription channel closes with the connection.
        assert!(subscription.recv().await.is_none());
    }
}
