use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};

use super::header::S7Header;
use crate::errors::Error;

pub(crate) const NEGOTIATE_FUNCTION_CODE: u8 = 0xF0;

/// COMM-SETUP parameter block, used identically in the job and its
/// acknowledge.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommSetupParams {
    pub(crate) max_am_q_calling: u16,
    pub(crate) max_am_q_called: u16,
    pub(crate) pdu_length: u16,
}

impl CommSetupParams {
    pub(crate) fn len() -> usize {
        8
    }

    pub(crate) fn build(max_parallel_jobs: u16, pdu_length: u16) -> Self {
        Self {
            max_am_q_calling: max_parallel_jobs,
            max_am_q_called: max_parallel_jobs,
            pdu_length,
        }
    }
}

impl From<CommSetupParams> for BytesMut {
    fn from(params: CommSetupParams) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(CommSetupParams::len());
        bytes.put_u8(NEGOTIATE_FUNCTION_CODE);
        bytes.put_u8(0); // reserved
        bytes.put_u16(params.max_am_q_calling);
        bytes.put_u16(params.max_am_q_called);
        bytes.put_u16(params.pdu_length);

        bytes
    }
}

impl TryFrom<&mut BytesMut> for CommSetupParams {
    type Error = Error;

    fn try_from(bytes: &mut BytesMut) -> Result<Self, Self::Error> {
        if bytes.len() < Self::len() {
            return Err(Error::InvalidPdu("short COMM-SETUP parameters"));
        }
        let function_code = bytes.get_u8();
        if function_code != NEGOTIATE_FUNCTION_CODE {
            return Err(Error::InvalidPdu("wrong COMM-SETUP function code"));
        }
        let _reserved = bytes.get_u8();
        Ok(Self {
            max_am_q_calling: bytes.get_u16(),
            max_am_q_called: bytes.get_u16(),
            pdu_length: bytes.get_u16(),
        })
    }
}

/// COMM-SETUP job requesting the session parameters.
pub(crate) fn build_job(pdu_ref: u16, params: CommSetupParams) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(S7Header::len_request() + CommSetupParams::len());
    bytes.put(BytesMut::from(S7Header::build_job(
        pdu_ref,
        CommSetupParams::len() as u16,
        0,
    )));
    bytes.put(BytesMut::from(params));
    bytes
}

/// COMM-SETUP acknowledge sent when the peer initiates the negotiation.
pub(crate) fn build_ack(pdu_ref: u16, params: CommSetupParams) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(S7Header::len_response() + CommSetupParams::len());
    bytes.put(BytesMut::from(S7Header::build_ack_data(
        pdu_ref,
        CommSetupParams::len() as u16,
        0,
    )));
    bytes.put(BytesMut::from(params));
    bytes
}
