use bytes::{BufMut, BytesMut};

use crate::s7_protocol::types::{PlcArea, VarType, SPEC_TYPE_READ_WRITE, SYNTAX_ID_ANY_TYPE};

/// Address item of a read or write job (12 bytes on the wire).
#[derive(Debug, Copy, Clone)]
pub(crate) struct RequestItem {
    specification_type: u8, // Always 0x12, variable specification.
    item_length: u8,        // Length of the rest of this item, always 10.
    syntax_id: u8,          // 0x10 for any-type addressing.
    transport_size: u8,     // S7 type code; the area code for timers/counters.
    length: u16,            // Element count; byte count for sliced reads.
    db_number: u16,         // Only meaningful for the data block area.
    area: u8,
    address: u32, // Bit granular offset, encoded on 3 bytes big endian.
                  // As an example DBX40.3 would be 0x000143 which is 40 * 8 + 3.
}

impl RequestItem {
    pub(crate) fn len() -> usize {
        12
    }

    pub(crate) fn build(area: PlcArea, var_type: VarType, address_bits: u32, length: u16) -> Self {
        Self {
            specification_type: SPEC_TYPE_READ_WRITE,
            item_length: (Self::len() - 2) as u8,
            syntax_id: SYNTAX_ID_ANY_TYPE,
            transport_size: var_type.transport_size(area),
            length,
            db_number: area.db_number(),
            area: area.wire_code(),
            address: address_bits,
        }
    }
}

impl From<RequestItem> for BytesMut {
    fn from(item: RequestItem) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(RequestItem::len());
        bytes.put_u8(item.specification_type);
        bytes.put_u8(item.item_length);
        bytes.put_u8(item.syntax_id);
        bytes.put_u8(item.transport_size);
        bytes.put_u16(item.length);
        bytes.put_u16(item.db_number);
        bytes.put_u8(item.area);
        // address is only 3 bytes long on the wire
        bytes.put_u8((item.address >> 16) as u8);
        bytes.put_u8((item.address >> 8) as u8);
        bytes.put_u8(item.address as u8);

        bytes
    }
}
