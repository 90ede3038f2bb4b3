use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};

use crate::errors::Error;

// PDU Type constants (Code + Credit)
const PDU_TYPE_CR: u8 = 0xE0; // Connection request
pub(crate) const PDU_TYPE_CC: u8 = 0xD0; // Connection confirm
pub(crate) const PDU_TYPE_DR: u8 = 0x80; // Disconnect request
pub(crate) const PDU_TYPE_DC: u8 = 0xC0; // Disconnect confirm
pub(crate) const PDU_TYPE_DT: u8 = 0xF0; // Data transfer

const PDU_EOT: u8 = 0x80; // End of Transmission (this packet is complete)

const SRC_REF: u16 = 0x0100; // RFC0983 states that SrcRef and DstRef should be 0
                             // and, in any case, they are ignored.
                             // S7 instead requires a number != 0.
const DST_REF: u16 = 0x0000;
const SRC_TSAP: u16 = 0x0100;

pub(crate) const ISO_TCP_VERSION: u8 = 3; // RFC 1006

// COTP parameter codes understood in CR/CC telegrams. Anything else is
// skipped over by its announced length.
const PARAM_TPDU_SIZE: u8 = 0xC0;
const PARAM_SRC_TSAP: u8 = 0xC1;
const PARAM_DST_TSAP: u8 = 0xC2;

/// Role announced to the PLC in the remote TSAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S7ConnectionType {
    /// Connect like a programming console (Programmiergeräte).
    Pg = 1,
    /// Connect like a Siemens HMI panel.
    Op = 2,
    /// Basic connection for generic data transfer.
    Basic = 3,
}

/// The remote TSAP encodes the connection role in the high byte and the CPU
/// location (`rack * 0x20 + slot`) in the low byte.
pub(crate) fn remote_tsap(connection_type: S7ConnectionType, rack: u8, slot: u8) -> u16 {
    (u16::from(connection_type as u8) << 8) | (u16::from(rack) * 0x20 + u16::from(slot))
}

/// TPKT Header - ISO on TCP - RFC 1006 (4 bytes)
#[derive(Debug, Copy, Clone)]
pub(crate) struct TpktHeader {
    version: u8,            // Always 3 for RFC 1006
    reserved: u8,           // 0
    pub(crate) length: u16, // Packet length : min 7 max 65535
}

impl TpktHeader {
    pub(crate) fn build(length: u16) -> Self {
        Self {
            version: ISO_TCP_VERSION,
            reserved: 0,
            length,
        }
    }

    pub(crate) fn len() -> usize {
        4
    }
}

impl From<TpktHeader> for BytesMut {
    fn from(header: TpktHeader) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(TpktHeader::len());
        bytes.put_u8(header.version);
        bytes.put_u8(header.reserved);
        bytes.put_u16(header.length);

        bytes
    }
}

pub(crate) trait CoTp {
    fn validate_expected_pdu_type(&self, expected_type: u8) -> bool {
        expected_type == self.get_pdu_type()
    }

    fn req_ok(&self) -> Result<(), Error>;
    fn get_pdu_type(&self) -> u8;
}

// COTP Header for CONNECTION REQUEST/CONFIRM
#[derive(Debug)]
pub(crate) struct CotpConnection {
    pdu_type: u8,
    dst_ref: u16,
    src_ref: u16,
    co_r: u8, // Class (high 4 bits) + Option (low 4 bits); both ignored on input
    pdu_size_code: u8,
    remote_tsap: u16,
}

impl CotpConnection {
    pub(crate) fn build_request(pdu_size: u16, remote_tsap: u16) -> Self {
        Self {
            pdu_type: PDU_TYPE_CR,
            dst_ref: DST_REF,
            src_ref: SRC_REF,
            co_r: 0x00, // RFC0983 states 0x40 but S7 equipment wants 0
            pdu_size_code: match pdu_size {
                128 => 0x07,
                256 => 0x08,
                512 => 0x09,
                1024 => 0x0A,
                4096 => 0x0C,
                8192 => 0x0D,
                _ => 0x0B, // 2048, our default
            },
            remote_tsap,
        }
    }
}

impl CoTp for CotpConnection {
    fn get_pdu_type(&self) -> u8 {
        self.pdu_type
    }

    fn req_ok(&self) -> Result<(), Error> {
        if self.validate_expected_pdu_type(PDU_TYPE_CC) {
            Ok(())
        } else {
            Err(Error::InvalidPdu("expected COTP connection confirm"))
        }
    }
}

impl TryFrom<&mut BytesMut> for CotpConnection {
    type Error = Error;

    fn try_from(bytes: &mut BytesMut) -> Result<Self, Self::Error> {
        if bytes.len() < 7 {
            return Err(Error::InvalidPdu("short COTP connection header"));
        }
        let _header_length = bytes.get_u8();
        let pdu_type = bytes.get_u8();
        let dst_ref = bytes.get_u16();
        let src_ref = bytes.get_u16();
        let co_r = bytes.get_u8();

        // Parameters are TLV encoded; unknown codes are skipped.
        let mut pdu_size_code = 0;
        let mut remote_tsap = 0;
        while bytes.remaining() >= 2 {
            let code = bytes.get_u8();
            let length = usize::from(bytes.get_u8());
            if bytes.remaining() < length {
                return Err(Error::InvalidPdu("truncated COTP parameter"));
            }
            let mut value = bytes.split_to(length);
            match code {
                PARAM_TPDU_SIZE if length == 1 => pdu_size_code = value.get_u8(),
                PARAM_DST_TSAP if length == 2 => remote_tsap = value.get_u16(),
                _ => {}
            }
        }

        Ok(Self {
            pdu_type,
            dst_ref,
            src_ref,
            co_r,
            pdu_size_code,
            remote_tsap,
        })
    }
}

impl From<CotpConnection> for BytesMut {
    fn from(cotp: CotpConnection) -> BytesMut {
        // 2 Src TSAP (code + field len) + 2 Src TSAP value +
        // 2 Dst TSAP (code + field len) + 2 Dst TSAP value +
        // 3 PDU size (code + field len + value) = 11 parameter bytes
        let header_length: u8 = 6 + 11;
        let mut bytes = BytesMut::with_capacity(usize::from(header_length) + 1);
        bytes.put_u8(header_length);
        bytes.put_u8(cotp.pdu_type);
        bytes.put_u16(cotp.dst_ref);
        bytes.put_u16(cotp.src_ref);
        bytes.put_u8(cotp.co_r);
        bytes.put_u8(PARAM_TPDU_SIZE);
        bytes.put_u8(1);
        bytes.put_u8(cotp.pdu_size_code);
        bytes.put_u8(PARAM_SRC_TSAP);
        bytes.put_u8(2);
        bytes.put_u16(SRC_TSAP);
        bytes.put_u8(PARAM_DST_TSAP);
        bytes.put_u8(2);
        bytes.put_u16(cotp.remote_tsap);

        bytes
    }
}

#[derive(Debug)]
pub(crate) struct CotpDisconnect {
    pdu_type: u8,
    dst_ref: u16,
    src_ref: u16,
    reason: u8, // 128 + 0 = normal disconnect initiated by the session entity
}

impl CotpDisconnect {
    pub(crate) fn build() -> Self {
        Self {
            pdu_type: PDU_TYPE_DR,
            dst_ref: DST_REF,
            src_ref: SRC_REF,
            reason: 128,
        }
    }

    pub(crate) fn len() -> usize {
        7
    }
}

impl CoTp for CotpDisconnect {
    fn get_pdu_type(&self) -> u8 {
        self.pdu_type
    }

    fn req_ok(&self) -> Result<(), Error> {
        if self.validate_expected_pdu_type(PDU_TYPE_DC) {
            Ok(())
        } else {
            Err(Error::InvalidPdu("expected COTP disconnect confirm"))
        }
    }
}

impl From<CotpDisconnect> for BytesMut {
    fn from(cotp: CotpDisconnect) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(CotpDisconnect::len());
        bytes.put_u8((CotpDisconnect::len() - 1) as u8);
        bytes.put_u8(cotp.pdu_type);
        bytes.put_u16(cotp.dst_ref);
        bytes.put_u16(cotp.src_ref);
        bytes.put_u8(cotp.reason);

        bytes
    }
}

// COTP Header for DATA EXCHANGE
#[derive(Debug)]
pub(crate) struct CotpData {
    header_length: u8, // 3 for this header - 1
    pdu_type: u8,      // 0xF0 for this header
    eot_num: u8,       // EOT (bit 7) + PDU number (bits 0..6)
}

impl CotpData {
    pub(crate) fn len() -> usize {
        3
    }

    pub(crate) fn build() -> Self {
        Self {
            header_length: (Self::len() - 1) as u8,
            pdu_type: PDU_TYPE_DT,
            eot_num: PDU_EOT,
        }
    }

    pub(crate) fn is_last(&self) -> bool {
        self.eot_num & PDU_EOT == PDU_EOT
    }
}

impl CoTp for CotpData {
    fn get_pdu_type(&self) -> u8 {
        self.pdu_type
    }

    fn req_ok(&self) -> Result<(), Error> {
        if self.validate_expected_pdu_type(PDU_TYPE_DT) {
            Ok(())
        } else {
            Err(Error::InvalidPdu("expected COTP data transfer"))
        }
    }
}

impl TryFrom<&mut BytesMut> for CotpData {
    type Error = Error;

    fn try_from(bytes: &mut BytesMut) -> Result<Self, Self::Error> {
        if bytes.len() < Self::len() {
            return Err(Error::InvalidPdu("short COTP data header"));
        }
        Ok(Self {
            header_length: bytes.get_u8(),
            pdu_type: bytes.get_u8(),
            eot_num: bytes.get_u8(),
        })
    }
}

impl From<CotpData> for BytesMut {
    fn from(cotp: CotpData) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(CotpData::len());
        bytes.put_u8(cotp.header_length);
        bytes.put_u8(cotp.pdu_type);
        bytes.put_u8(cotp.eot_num);

        bytes
    }
}

/// Wrap an S7 payload into a TPKT + COTP data telegram.
pub(crate) fn data_frame(payload: BytesMut) -> BytesMut {
    let total = TpktHeader::len() + CotpData::len() + payload.len();
    let mut bytes = BytesMut::with_capacity(total);
    bytes.put(BytesMut::from(TpktHeader::build(total as u16)));
    bytes.put(BytesMut::from(CotpData::build()));
    bytes.put(payload);
    bytes
}

/// Full COTP connection request telegram for the given negotiation wishes.
pub(crate) fn connect_frame(pdu_size: u16, remote_tsap: u16) -> BytesMut {
    let cotp = BytesMut::from(CotpConnection::build_request(pdu_size, remote_tsap));
    let total = TpktHeader::len() + cotp.len();
    let mut bytes = BytesMut::with_capacity(total);
    bytes.put(BytesMut::from(TpktHeader::build(total as u16)));
    bytes.put(cotp);
    bytes
}

/// Full COTP disconnect request telegram.
pub(crate) fn disconnect_frame() -> BytesMut {
    let cotp = BytesMut::from(CotpDisconnect::build());
    let total = TpktHeader::len() + cotp.len();
    let mut bytes = BytesMut::with_capacity(total);
    bytes.put(BytesMut::from(TpktHeader::build(total as u16)));
    bytes.put(cotp);
    bytes
}

/// Incremental TPKT deframer.
///
/// Bytes arrive from the transport in arbitrary chunks; the accumulator
/// retains the tail of a partial frame and yields one COTP telegram (TPKT
/// header stripped) at a time.
#[derive(Debug, Default)]
pub(crate) struct FrameAccumulator {
    buffer: BytesMut,
}

impl FrameAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete telegram, or `None` until more bytes arrive.
    pub(crate) fn next_frame(&mut self) -> Result<Option<BytesMut>, Error> {
        if self.buffer.len() < TpktHeader::len() {
            return Ok(None);
        }
        if self.buffer[0] != ISO_TCP_VERSION {
            return Err(Error::InvalidPdu("wrong TPKT version"));
        }
        let total = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
        if total < 7 {
            return Err(Error::InvalidPdu("TPKT length below minimum"));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(TpktHeader::len());
        Ok(Some(frame))
    }
}
