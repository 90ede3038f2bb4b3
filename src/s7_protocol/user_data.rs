use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use super::header::S7Header;
use crate::errors::Error;

// User data parameter head, identical in requests and responses.
const PARAM_HEAD: [u8; 3] = [0x00, 0x01, 0x12];

const METHOD_REQUEST: u8 = 0x11;
const METHOD_RESPONSE: u8 = 0x12;

// Function groups in the low nibble of the type/group byte. The high nibble
// is 4 for requests and 8 for responses.
pub(crate) const GROUP_BLOCK: u8 = 0x3;
pub(crate) const GROUP_CPU: u8 = 0x4;
pub(crate) const GROUP_TIME: u8 = 0x7;

pub(crate) const SUB_BLOCK_INFO: u8 = 0x03;
pub(crate) const SUB_MESSAGE_SERVICE: u8 = 0x02;
pub(crate) const SUB_ALARM_INDICATION: u8 = 0x11;
pub(crate) const SUB_ALARM_QUERY: u8 = 0x13;
pub(crate) const SUB_CLOCK_READ: u8 = 0x01;

// Data unit return codes.
const DATA_OK: u8 = 0xFF;
const DATA_EMPTY: u8 = 0x0A;
const TS_OCTET_STRING: u8 = 0x09;

// Block timestamps count days since the Siemens epoch.
const SIEMENS_EPOCH: (i32, u32, u32) = (1984, 1, 1);

/// Decoded user data response: routing fields plus the raw data unit.
#[derive(Debug)]
pub(crate) struct UserDataResponse {
    pub(crate) group: u8,
    pub(crate) sub_function: u8,
    pub(crate) sequence: u8,
    /// Set when no further fragments follow for this query.
    pub(crate) last_data_unit: bool,
    pub(crate) error_code: u16,
    pub(crate) return_code: u8,
    pub(crate) payload: BytesMut,
}

/// Assemble a user data request PDU around one data unit.
pub(crate) fn build_request(
    pdu_ref: u16,
    group: u8,
    sub_function: u8,
    sequence: u8,
    payload: &[u8],
) -> BytesMut {
    let param_length = 8u16;
    let data_length = (4 + payload.len()) as u16;

    let mut bytes = BytesMut::with_capacity(
        S7Header::len_request() + usize::from(param_length) + usize::from(data_length),
    );
    bytes.put(BytesMut::from(S7Header::build_user_data(
        pdu_ref,
        param_length,
        data_length,
    )));
    bytes.put_slice(&PARAM_HEAD);
    bytes.put_u8(0x04); // parameter length after this byte
    bytes.put_u8(METHOD_REQUEST);
    bytes.put_u8((0x4 << 4) | group);
    bytes.put_u8(sub_function);
    bytes.put_u8(sequence);
    if payload.is_empty() {
        // Follow-up fragments and parameterless queries carry an empty unit.
        bytes.put_u8(DATA_EMPTY);
        bytes.put_u8(0x00);
        bytes.put_u16(0);
    } else {
        bytes.put_u8(DATA_OK);
        bytes.put_u8(TS_OCTET_STRING);
        bytes.put_u16(payload.len() as u16);
        bytes.put_slice(payload);
    }
    bytes
}

/// Parse the body of a received user data PDU, header already consumed.
pub(crate) fn parse_response(bytes: &mut BytesMut) -> Result<UserDataResponse, Error> {
    if bytes.len() < 8 {
        return Err(Error::InvalidPdu("short user data parameters"));
    }
    let head = [bytes.get_u8(), bytes.get_u8(), bytes.get_u8()];
    if head != PARAM_HEAD {
        return Err(Error::InvalidPdu("wrong user data parameter head"));
    }
    let param_length = bytes.get_u8();
    let method = bytes.get_u8();
    if method != METHOD_RESPONSE && method != METHOD_REQUEST {
        return Err(Error::InvalidPdu("unknown user data method"));
    }
    let type_and_group = bytes.get_u8();
    let sub_function = bytes.get_u8();
    let sequence = bytes.get_u8();

    let (last_data_unit, error_code) = if param_length == 0x08 {
        if bytes.len() < 4 {
            return Err(Error::InvalidPdu("short user data parameters"));
        }
        let _data_unit_ref = bytes.get_u8();
        let more = bytes.get_u8();
        let error_code = bytes.get_u16();
        (more == 0x00, error_code)
    } else {
        (true, 0)
    };

    if bytes.len() < 4 {
        return Err(Error::InvalidPdu("short user data unit"));
    }
    let return_code = bytes.get_u8();
    let _transport_size = bytes.get_u8();
    let length = usize::from(bytes.get_u16());
    if bytes.len() < length {
        return Err(Error::InvalidPdu("user data unit truncated"));
    }
    let payload = bytes.split_to(length);

    Ok(UserDataResponse {
        group: type_and_group & 0x0F,
        sub_function,
        sequence,
        last_data_unit,
        error_code,
        return_code,
        payload,
    })
}

/// PLC block families addressable through block info queries. The value is
/// the ASCII letter used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// Organisation block.
    Ob = 0x38,
    /// Data block.
    Db = 0x41,
    /// System data block.
    Sdb = 0x42,
    /// Function.
    Fc = 0x43,
    /// System function.
    Sfc = 0x44,
    /// Function block.
    Fb = 0x45,
    /// System function block.
    Sfb = 0x46,
}

/// Build the block info query for one block. The block number travels as
/// five ASCII digits.
pub(crate) fn build_block_info_job(
    pdu_ref: u16,
    block_type: BlockType,
    block_number: u16,
) -> BytesMut {
    let mut number = u32::from(block_number);
    let mut digits = [0u8; 5];
    for digit in digits.iter_mut().rev() {
        *digit = (number % 10) as u8 + b'0';
        number /= 10;
    }

    let mut payload = [0u8; 8];
    payload[0] = b'0';
    payload[1] = block_type as u8;
    payload[2..7].copy_from_slice(&digits);
    payload[7] = b'A';

    build_request(pdu_ref, GROUP_BLOCK, SUB_BLOCK_INFO, 0, &payload)
}

/// Metadata of one PLC block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Sub block type code.
    pub block_type: u8,
    /// Number of the block.
    pub block_number: u16,
    /// Language the block was written in.
    pub block_lang: u8,
    /// Block flags (bitmapped).
    pub block_flags: u8,
    /// The real size in bytes.
    pub mc7_size: u16,
    /// Load memory size.
    pub load_size: i32,
    /// Local data size.
    pub local_data: u16,
    /// SBB length.
    pub sbb_length: u16,
    /// Version (BCD).
    pub version: u8,
    /// Compile timestamp of the code part.
    pub code_date: NaiveDateTime,
    /// Compile timestamp of the interface part.
    pub interface_date: NaiveDateTime,
    /// Author field, trimmed.
    pub author: String,
    /// Family field, trimmed.
    pub family: String,
    /// Header name field, trimmed.
    pub header: String,
}

impl TryFrom<&mut BytesMut> for BlockInfo {
    type Error = Error;

    fn try_from(payload: &mut BytesMut) -> Result<Self, Self::Error> {
        if payload.len() < 67 {
            return Err(Error::InvalidPdu("short block info payload"));
        }
        Ok(Self {
            block_flags: payload[9],
            block_lang: payload[10],
            block_type: payload[11],
            block_number: u16::from_be_bytes([payload[12], payload[13]]),
            load_size: i32::from_be_bytes([
                payload[14],
                payload[15],
                payload[16],
                payload[17],
            ]),
            code_date: siemens_timestamp(u16::from_be_bytes([payload[26], payload[27]]))?,
            interface_date: siemens_timestamp(u16::from_be_bytes([payload[32], payload[33]]))?,
            sbb_length: u16::from_be_bytes([payload[34], payload[35]]),
            local_data: u16::from_be_bytes([payload[38], payload[39]]),
            mc7_size: u16::from_be_bytes([payload[40], payload[41]]),
            author: ascii_field(&payload[42..50]),
            family: ascii_field(&payload[50..58]),
            header: ascii_field(&payload[58..66]),
            version: payload[66],
        })
    }
}

/// Days since 1984-01-01, the timestamp format of block metadata.
fn siemens_timestamp(days: u16) -> Result<NaiveDateTime, Error> {
    let (year, month, day) = SIEMENS_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(Error::InvalidPdu("invalid Siemens epoch"))?;
    let date = epoch + Duration::days(i64::from(days));
    Ok(NaiveDateTime::new(
        date,
        NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default(),
    ))
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

/// One alarm record, used both for pending alarm queries and unsolicited
/// indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alarm {
    /// Event id of the alarm.
    pub event_id: u32,
    /// Whether the alarm is currently coming (raised) or going.
    pub is_coming: bool,
    /// Whether the alarm has been acknowledged.
    pub is_acked: bool,
}

const ALARM_ENTRY_LEN: usize = 8;

/// Query the alarms still pending on the PLC. Fragments beyond the first
/// are requested with the peer returned sequence number and an empty unit.
pub(crate) fn build_pending_alarm_job(pdu_ref: u16, sequence: u8) -> BytesMut {
    if sequence == 0 {
        build_request(pdu_ref, GROUP_CPU, SUB_ALARM_QUERY, 0, &[0x00, 0x00])
    } else {
        build_request(pdu_ref, GROUP_CPU, SUB_ALARM_QUERY, sequence, &[])
    }
}

/// Enable or disable unsolicited alarm indications for this session.
pub(crate) fn build_alarm_update_job(pdu_ref: u16, enable: bool) -> BytesMut {
    let flag = if enable { 0x01 } else { 0x00 };
    build_request(
        pdu_ref,
        GROUP_CPU,
        SUB_MESSAGE_SERVICE,
        0,
        &[flag, 0x00],
    )
}

/// Parse alarm records out of a data unit payload.
pub(crate) fn parse_alarms(payload: &[u8]) -> Result<Vec<Alarm>, Error> {
    if payload.len() % ALARM_ENTRY_LEN != 0 {
        return Err(Error::InvalidPdu("ragged alarm payload"));
    }
    Ok(payload
        .chunks_exact(ALARM_ENTRY_LEN)
        .map(|entry| Alarm {
            event_id: u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]),
            is_coming: entry[4] & 0x01 != 0,
            is_acked: entry[5] & 0x01 != 0,
        })
        .collect())
}

/// Encode alarm records into a data unit payload.
#[cfg(test)]
pub(crate) fn encode_alarms(alarms: &[Alarm]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(alarms.len() * ALARM_ENTRY_LEN);
    for alarm in alarms {
        payload.extend_from_slice(&alarm.event_id.to_be_bytes());
        payload.push(u8::from(alarm.is_coming));
        payload.push(u8::from(alarm.is_acked));
        payload.extend_from_slice(&[0, 0]);
    }
    payload
}

/// Read the PLC wall clock.
pub(crate) fn build_clock_read_job(pdu_ref: u16) -> BytesMut {
    build_request(pdu_ref, GROUP_TIME, SUB_CLOCK_READ, 0, &[])
}

/// Decode the ten byte clock payload: a reserved byte, the BCD century,
/// then the BCD date and time down to milliseconds.
pub(crate) fn parse_clock(payload: &[u8]) -> Result<NaiveDateTime, Error> {
    if payload.len() < 10 {
        return Err(Error::InvalidPdu("short clock payload"));
    }
    let year = u32::from(from_bcd(payload[1])?) * 100 + u32::from(from_bcd(payload[2])?);
    let month = u32::from(from_bcd(payload[3])?);
    let day = u32::from(from_bcd(payload[4])?);
    let hour = u32::from(from_bcd(payload[5])?);
    let minute = u32::from(from_bcd(payload[6])?);
    let second = u32::from(from_bcd(payload[7])?);
    // The last two bytes carry three millisecond digits plus the weekday.
    let milli = u32::from(from_bcd(payload[8])?) * 10 + u32::from(payload[9] >> 4);

    let date = NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or(Error::InvalidPdu("clock date out of range"))?;
    let time = NaiveTime::from_hms_milli_opt(hour, minute, second, milli)
        .ok_or(Error::InvalidPdu("clock time out of range"))?;
    Ok(NaiveDateTime::new(date, time))
}

fn from_bcd(byte: u8) -> Result<u8, Error> {
    let high = byte >> 4;
    let low = byte & 0x0F;
    if high > 9 || low > 9 {
        return Err(Error::InvalidPdu("invalid BCD digit"));
    }
    Ok(high * 10 + low)
}
