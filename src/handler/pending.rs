use std::collections::HashMap;

use log::warn;
use tokio::sync::{mpsc, oneshot};

use crate::errors::Error;
use crate::s7_protocol::negotiate::CommSetupParams;
use crate::s7_protocol::segments::data_item::DataItem;
use crate::s7_protocol::user_data::{Alarm, UserDataResponse};

/// Decoded payload delivered through a pending call's completion. Success
/// and failure share the one-shot channel, so a caller resumes exactly once.
#[derive(Debug)]
pub(crate) enum S7Response {
    /// Items of a read acknowledge, in request order.
    ReadItems(Vec<DataItem>),
    /// Per-item return codes of a write acknowledge.
    WriteCodes(Vec<u8>),
    /// COMM-SETUP acknowledge parameters.
    Setup(CommSetupParams),
    /// One user data response fragment.
    UserData(UserDataResponse),
}

pub(crate) type Completion = oneshot::Sender<Result<S7Response, Error>>;

/// Which in-flight map a call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Read,
    Write,
    BlockInfo,
    Alarm,
}

/// In-flight bookkeeping of the dispatcher: one map per call kind, the
/// distinguished COMM-SETUP completion, and the alarm subscription slot.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    read: HashMap<u16, Completion>,
    write: HashMap<u16, Completion>,
    block_info: HashMap<u16, Completion>,
    alarm: HashMap<u16, Completion>,
    setup: Option<(u16, Completion)>,
    pub(crate) alarm_subscription: Option<mpsc::UnboundedSender<Alarm>>,
}

impl PendingCalls {
    fn map_mut(&mut self, kind: CallKind) -> &mut HashMap<u16, Completion> {
        match kind {
            CallKind::Read => &mut self.read,
            CallKind::Write => &mut self.write,
            CallKind::BlockInfo => &mut self.block_info,
            CallKind::Alarm => &mut self.alarm,
        }
    }

    /// Register a call before its job is sent.
    pub(crate) fn insert(&mut self, kind: CallKind, pdu_ref: u16, completion: Completion) {
        self.map_mut(kind).insert(pdu_ref, completion);
    }

    /// Drop a call, e.g. on timeout or send failure. A response arriving
    /// later for this reference is discarded with a warning.
    pub(crate) fn remove(&mut self, kind: CallKind, pdu_ref: u16) -> Option<Completion> {
        self.map_mut(kind).remove(&pdu_ref)
    }

    /// Hand a decoded response to the matching caller. Returns false when
    /// no call is registered under the reference.
    pub(crate) fn resolve(
        &mut self,
        kind: CallKind,
        pdu_ref: u16,
        result: Result<S7Response, Error>,
    ) -> bool {
        match self.map_mut(kind).remove(&pdu_ref) {
            Some(completion) => completion.send(result).is_ok(),
            None => {
                warn!("dropping late response for reference {pdu_ref}");
                false
            }
        }
    }

    pub(crate) fn register_setup(&mut self, pdu_ref: u16, completion: Completion) {
        self.setup = Some((pdu_ref, completion));
    }

    /// Resolve the COMM-SETUP completion if the reference matches.
    pub(crate) fn resolve_setup(
        &mut self,
        pdu_ref: u16,
        result: Result<S7Response, Error>,
    ) -> bool {
        match self.setup.take() {
            Some((expected, completion)) if expected == pdu_ref => {
                completion.send(result).is_ok()
            }
            Some(other) => {
                self.setup = Some(other);
                false
            }
            None => false,
        }
    }

    pub(crate) fn clear_setup(&mut self) {
        self.setup = None;
    }

    /// Resolve whichever call holds the reference, used for header level
    /// errors where the function code is unavailable.
    pub(crate) fn resolve_anywhere(&mut self, pdu_ref: u16, error: impl Fn() -> Error) -> bool {
        if self.resolve_setup(pdu_ref, Err(error())) {
            return true;
        }
        for kind in [
            CallKind::Read,
            CallKind::Write,
            CallKind::BlockInfo,
            CallKind::Alarm,
        ] {
            if let Some(completion) = self.map_mut(kind).remove(&pdu_ref) {
                return completion.send(Err(error())).is_ok();
            }
        }
        warn!("dropping late response for reference {pdu_ref}");
        false
    }

    /// Resolve every in-flight call with the disconnect sentinel and clear
    /// the alarm subscription. Used on close and on receive loop exit.
    pub(crate) fn fail_all(&mut self) {
        if let Some((_, completion)) = self.setup.take() {
            let _ = completion.send(Err(Error::NotConnected));
        }
        for kind in [
            CallKind::Read,
            CallKind::Write,
            CallKind::BlockInfo,
            CallKind::Alarm,
        ] {
            for (_, completion) in self.map_mut(kind).drain() {
                let _ = completion.send(Err(Error::NotConnected));
            }
        }
        self.alarm_subscription = None;
    }

    /// Whether any completion is still registered.
    pub(crate) fn is_empty(&self) -> bool {
        self.setup.is_none()
            && self.read.is_empty()
            && self.write.is_empty()
            && self.block_info.is_empty()
            && self.alarm.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_all_resolves_every_pending_completion() {
        let mut pending = PendingCalls::default();
        let (setup_tx, mut setup_rx) = oneshot::channel();
        let (read_tx, mut read_rx) = oneshot::channel();
        pending.register_setup(1, setup_tx);
        pending.insert(CallKind::Read, 2, read_tx);

        pending.fail_all();
        assert!(pending.is_empty());
        assert!(matches!(setup_rx.try_recv(), Ok(Err(Error::NotConnected))));
        assert!(matches!(read_rx.try_recv(), Ok(Err(Error::NotConnected))));
    }

    #[test]
    fn resolve_is_keyed_by_kind_and_reference() {
        let mut pending = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(CallKind::Write, 7, tx);

        assert!(!pending.resolve(CallKind::Read, 7, Ok(S7Response::WriteCodes(vec![]))));
        assert!(pending.resolve(CallKind::Write, 7, Ok(S7Response::WriteCodes(vec![0xFF]))));
        assert!(matches!(
            rx.try_recv(),
            Ok(Ok(S7Response::WriteCodes(codes))) if codes == vec![0xFF]
        ));
    }

    #[test]
    fn setup_resolution_checks_the_reference() {
        let mut pending = PendingCalls::default();
        let (tx, mut rx) = oneshot::channel();
        pending.register_setup(5, tx);

        assert!(!pending.resolve_setup(6, Err(Error::NotConnected)));
        assert!(!pending.is_empty());
        assert!(pending.resolve_setup(
            5,
            Ok(S7Response::Setup(CommSetupParams::build(4, 480)))
        ));
        assert!(matches!(rx.try_recv(), Ok(Ok(S7Response::Setup(_)))));
    }
}
