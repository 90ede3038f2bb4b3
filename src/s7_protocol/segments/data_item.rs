use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::Error;
use crate::s7_protocol::types::VarType;

// Transport size codes used in data items. These differ from the address
// item codes; lengths are given in bits for the numeric families.
const TS_BIT: u8 = 0x03;
const TS_BYTE: u8 = 0x04;
const TS_INTEGER: u8 = 0x05;
const TS_REAL: u8 = 0x07;
const TS_OCTET_STRING: u8 = 0x09;

pub(crate) const ITEM_OK: u8 = 0xFF;

/// Payload of one item in a write job or a read acknowledge.
#[derive(Debug, Clone)]
pub(crate) struct DataItem {
    pub(crate) return_code: u8, // 0xFF signals success; 0 in requests.
    pub(crate) transport_size: u8,
    pub(crate) data: Bytes,
}

impl DataItem {
    pub(crate) fn header_len() -> usize {
        4
    }

    pub(crate) fn build_write(var_type: VarType, data: Bytes) -> Self {
        let transport_size = match var_type {
            VarType::Bit => TS_BIT,
            _ => TS_BYTE,
        };
        Self {
            return_code: 0,
            transport_size,
            data,
        }
    }

    /// Wire length field: bits for the numeric transport sizes, bytes for
    /// bit and octet string payloads.
    fn length_field(&self) -> u16 {
        match self.transport_size {
            TS_BIT | TS_OCTET_STRING => self.data.len() as u16,
            _ => (self.data.len() * 8) as u16,
        }
    }

    fn byte_len(transport_size: u8, length: u16) -> usize {
        match transport_size {
            TS_BIT | TS_OCTET_STRING => usize::from(length),
            TS_BYTE | TS_INTEGER | TS_REAL => usize::from(length) / 8,
            _ => 0,
        }
    }

    /// Parse `count` consecutive data items, honouring the fill byte that
    /// follows every odd-length payload except the last one.
    pub(crate) fn parse_all(bytes: &mut BytesMut, count: usize) -> Result<Vec<Self>, Error> {
        let mut items = Vec::with_capacity(count);
        for index in 0..count {
            if bytes.len() < Self::header_len() {
                return Err(Error::InvalidPdu("short data item header"));
            }
            let return_code = bytes.get_u8();
            let transport_size = bytes.get_u8();
            let length = bytes.get_u16();
            let byte_len = Self::byte_len(transport_size, length);
            if bytes.len() < byte_len {
                return Err(Error::InvalidPdu("data item payload truncated"));
            }
            let data = bytes.split_to(byte_len).freeze();
            if index + 1 < count && byte_len % 2 == 1 && !bytes.is_empty() {
                bytes.advance(1); // fill byte
            }
            items.push(Self {
                return_code,
                transport_size,
                data,
            });
        }
        Ok(items)
    }

    /// Encode consecutive write payloads, inserting a fill byte after every
    /// odd-length payload except the last one.
    pub(crate) fn encode_all(items: &[Self]) -> BytesMut {
        let mut bytes = BytesMut::new();
        for (index, item) in items.iter().enumerate() {
            bytes.put_u8(item.return_code);
            bytes.put_u8(item.transport_size);
            bytes.put_u16(item.length_field());
            bytes.put(item.data.as_ref());
            if index + 1 < items.len() && item.data.len() % 2 == 1 {
                bytes.put_u8(0);
            }
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_items_with_fill_bytes() {
        let mut bytes = BytesMut::new();
        // first item: 3 bytes of byte access (length in bits), padded
        bytes.put_u8(ITEM_OK);
        bytes.put_u8(TS_BYTE);
        bytes.put_u16(24);
        bytes.put(&[1u8, 2, 3][..]);
        bytes.put_u8(0); // fill
        // second item: a single bit
        bytes.put_u8(ITEM_OK);
        bytes.put_u8(TS_BIT);
        bytes.put_u16(1);
        bytes.put_u8(1);

        let items = DataItem::parse_all(&mut bytes, 2).expect("items should parse");
        assert_eq!(items[0].data.as_ref(), &[1, 2, 3]);
        assert_eq!(items[1].data.as_ref(), &[1]);
        assert!(bytes.is_empty());
    }

    #[test]
    fn keeps_per_item_return_codes() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(0x0A); // object does not exist
        bytes.put_u8(0x00);
        bytes.put_u16(0);
        bytes.put_u8(ITEM_OK);
        bytes.put_u8(TS_BYTE);
        bytes.put_u16(8);
        bytes.put_u8(0x42);

        let items = DataItem::parse_all(&mut bytes, 2).expect("items should parse");
        assert_eq!(items[0].return_code, 0x0A);
        assert!(items[0].data.is_empty());
        assert_eq!(items[1].return_code, ITEM_OK);
        assert_eq!(items[1].data.as_ref(), &[0x42]);
    }

    #[test]
    fn encode_pads_between_items_only() {
        let items = vec![
            DataItem::build_write(VarType::Byte, Bytes::from_static(&[1, 2, 3])),
            DataItem::build_write(VarType::Byte, Bytes::from_static(&[4])),
        ];
        let encoded = DataItem::encode_all(&items);
        // 4 + 3 + 1 (fill) + 4 + 1, no trailing fill
        assert_eq!(encoded.len(), 13);
        assert_eq!(encoded[7], 0); // fill byte after first payload

        let mut decode = encoded;
        let decoded = DataItem::parse_all(&mut decode, 2).expect("items should parse");
        assert_eq!(decoded[0].data.as_ref(), &[1, 2, 3]);
        assert_eq!(decoded[1].data.as_ref(), &[4]);
    }

    #[test]
    fn bit_write_uses_bit_transport() {
        let item = DataItem::build_write(VarType::Bit, Bytes::from_static(&[1]));
        let encoded = DataItem::encode_all(&[item]);
        assert_eq!(&encoded[..], &[0x00, TS_BIT, 0x00, 0x01, 0x01]);
    }
}
