use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::Error;

pub(crate) const PROTOCOL_ID: u8 = 0x32;

/// Role of an S7 PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PduType {
    /// Request initiated by one side.
    Job = 0x01,
    /// Acknowledge without payload.
    Ack = 0x02,
    /// Acknowledge carrying response data.
    AckData = 0x03,
    /// User data exchange (block info, alarms, clock).
    UserData = 0x07,
}

impl TryFrom<u8> for PduType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Job),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::AckData),
            0x07 => Ok(Self::UserData),
            _ => Err(Error::InvalidPdu("unknown S7 PDU type")),
        }
    }
}

/// Header preceding every S7 datagram. Job and user data headers are 10
/// bytes; both acknowledge variants append an error class and code.
#[derive(Debug, Clone)]
pub(crate) struct S7Header {
    pub(crate) pdu_type: PduType,
    pub(crate) pdu_ref: u16,
    pub(crate) param_length: u16,
    pub(crate) data_length: u16,
    /// Error class and code, present on `Ack` and `AckData` only.
    pub(crate) error: Option<(u8, u8)>,
}

impl S7Header {
    pub(crate) fn len_request() -> usize {
        10
    }

    pub(crate) fn len_response() -> usize {
        12
    }

    pub(crate) fn build_job(pdu_ref: u16, param_length: u16, data_length: u16) -> Self {
        Self {
            pdu_type: PduType::Job,
            pdu_ref,
            param_length,
            data_length,
            error: None,
        }
    }

    pub(crate) fn build_ack_data(pdu_ref: u16, param_length: u16, data_length: u16) -> Self {
        Self {
            pdu_type: PduType::AckData,
            pdu_ref,
            param_length,
            data_length,
            error: Some((0, 0)),
        }
    }

    pub(crate) fn build_user_data(pdu_ref: u16, param_length: u16, data_length: u16) -> Self {
        Self {
            pdu_type: PduType::UserData,
            pdu_ref,
            param_length,
            data_length,
            error: None,
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        matches!(self.error, Some((class, code)) if class != 0 || code != 0)
    }

    /// Raise the header level error, if any.
    pub(crate) fn check_errors(&self) -> Result<(), Error> {
        match self.error {
            Some((class, code)) if class != 0 || code != 0 => {
                Err(Error::ProtocolError { class, code })
            }
            _ => Ok(()),
        }
    }
}

impl TryFrom<&mut BytesMut> for S7Header {
    type Error = Error;

    fn try_from(bytes: &mut BytesMut) -> Result<Self, Self::Error> {
        if bytes.len() < Self::len_request() {
            return Err(Error::InvalidPdu("short S7 header"));
        }
        if bytes.get_u8() != PROTOCOL_ID {
            return Err(Error::InvalidPdu("wrong S7 protocol id"));
        }
        let pdu_type = PduType::try_from(bytes.get_u8())?;
        let _redundancy_id = bytes.get_u16();
        let pdu_ref = bytes.get_u16();
        let param_length = bytes.get_u16();
        let data_length = bytes.get_u16();
        let error = match pdu_type {
            PduType::Ack | PduType::AckData => {
                if bytes.len() < 2 {
                    return Err(Error::InvalidPdu("short S7 acknowledge header"));
                }
                Some((bytes.get_u8(), bytes.get_u8()))
            }
            _ => None,
        };

        Ok(Self {
            pdu_type,
            pdu_ref,
            param_length,
            data_length,
            error,
        })
    }
}

impl From<S7Header> for BytesMut {
    fn from(header: S7Header) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(S7Header::len_response());
        bytes.put_u8(PROTOCOL_ID);
        bytes.put_u8(header.pdu_type as u8);
        bytes.put_u16(0); // redundancy identification
        bytes.put_u16(header.pdu_ref);
        bytes.put_u16(header.param_length);
        bytes.put_u16(header.data_length);
        if let Some((class, code)) = header.error {
            bytes.put_u8(class);
            bytes.put_u8(code);
        }

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_header_roundtrip() {
        let mut encoded = BytesMut::from(S7Header::build_job(0x1234, 14, 0));
        assert_eq!(encoded.len(), S7Header::len_request());

        let decoded = S7Header::try_from(&mut encoded).expect("header should parse");
        assert_eq!(decoded.pdu_type, PduType::Job);
        assert_eq!(decoded.pdu_ref, 0x1234);
        assert_eq!(decoded.param_length, 14);
        assert_eq!(decoded.error, None);
    }

    #[test]
    fn ack_data_header_carries_error_bytes() {
        let mut encoded = BytesMut::from(S7Header::build_ack_data(7, 2, 5));
        assert_eq!(encoded.len(), S7Header::len_response());

        let decoded = S7Header::try_from(&mut encoded).expect("header should parse");
        assert_eq!(decoded.error, Some((0, 0)));
        assert!(!decoded.has_error());
        decoded.check_errors().expect("no error set");
    }

    #[test]
    fn header_level_errors_are_raised() {
        let mut header = S7Header::build_ack_data(7, 0, 0);
        header.error = Some((0x84, 0x05));
        assert!(header.has_error());
        assert!(matches!(
            header.check_errors(),
            Err(Error::ProtocolError {
                class: 0x84,
                code: 0x05
            })
        ));
    }

    #[test]
    fn rejects_foreign_datagrams() {
        let mut bytes = BytesMut::from(&[0x33, 0x01, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            S7Header::try_from(&mut bytes),
            Err(Error::InvalidPdu("wrong S7 protocol id"))
        ));

        let mut bytes = BytesMut::from(&[0x32, 0x09, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        assert!(matches!(
            S7Header::try_from(&mut bytes),
            Err(Error::InvalidPdu("unknown S7 PDU type"))
        ));
    }
}
