use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};

use super::request_item::RequestItem;
use crate::errors::Error;
use crate::s7_protocol::types::{READ_OPERATION, WRITE_OPERATION};

/// Parameter block of read and write jobs and their acknowledges: the
/// function code, the item count, and (in jobs only) the address items.
#[derive(Debug)]
pub(crate) struct ReadWriteParams {
    pub(crate) function_code: u8,
    pub(crate) item_count: u8,
    pub(crate) request_items: Option<Vec<RequestItem>>,
}

impl ReadWriteParams {
    pub(crate) fn len() -> usize {
        2
    }

    pub(crate) fn build_read(items: Vec<RequestItem>) -> Self {
        Self {
            function_code: READ_OPERATION,
            item_count: items.len() as u8,
            request_items: Some(items),
        }
    }

    pub(crate) fn build_write(items: Vec<RequestItem>) -> Self {
        Self {
            function_code: WRITE_OPERATION,
            item_count: items.len() as u8,
            request_items: Some(items),
        }
    }
}

impl TryFrom<&mut BytesMut> for ReadWriteParams {
    type Error = Error;

    fn try_from(bytes: &mut BytesMut) -> Result<Self, Self::Error> {
        if bytes.len() < Self::len() {
            return Err(Error::InvalidPdu("short read/write parameters"));
        }
        Ok(Self {
            function_code: bytes.get_u8(),
            item_count: bytes.get_u8(),
            request_items: None,
        })
    }
}

impl From<ReadWriteParams> for BytesMut {
    fn from(params: ReadWriteParams) -> BytesMut {
        let mut bytes = BytesMut::new();
        bytes.put_u8(params.function_code);
        bytes.put_u8(params.item_count);
        if let Some(items) = params.request_items {
            for item in items {
                bytes.put(BytesMut::from(item));
            }
        }

        bytes
    }
}
