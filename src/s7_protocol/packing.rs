//! Packing planner: slices logical read and write items into packages that
//! each encode into one PDU, and maps response fragments back onto the
//! logical items.

use bytes::{Bytes, BytesMut};

use super::header::S7Header;
use super::segments::data_item::{DataItem, ITEM_OK};
use super::segments::parameters::ReadWriteParams;
use super::segments::request_item::RequestItem;
use super::SessionContext;
use crate::errors::Error;
use crate::s7_protocol::types::{ReadItem, VarType, WriteItem};

// A read job carries the 10 byte header plus function and item count; its
// acknowledge uses the 12 byte header. Write jobs carry address and data
// blocks in the request, their acknowledge one return code per item.
fn read_request_overhead() -> usize {
    S7Header::len_request() + ReadWriteParams::len()
}

fn read_response_overhead() -> usize {
    S7Header::len_response() + ReadWriteParams::len()
}

fn write_request_overhead() -> usize {
    S7Header::len_request() + ReadWriteParams::len()
}

fn padded(length: usize) -> usize {
    length + length % 2
}

/// A possibly partial slice of a logical item, placed into one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlannedSlice {
    /// Index of the logical item in the caller's list.
    pub(crate) item_index: usize,
    /// Byte offset of this slice within the logical item.
    pub(crate) offset: u32,
    /// Number of payload bytes this slice covers.
    pub(crate) length: usize,
    /// Whether the slice is a fragment of a split item.
    pub(crate) is_part: bool,
}

impl PlannedSlice {
    /// Address item for this slice. Fragments are re-addressed as plain
    /// byte accesses at their absolute byte offset.
    pub(crate) fn read_request_item(&self, items: &[ReadItem]) -> RequestItem {
        let item = &items[self.item_index];
        if self.is_part {
            RequestItem::build(
                item.area,
                VarType::Byte,
                (item.offset + self.offset) * 8,
                self.length as u16,
            )
        } else {
            RequestItem::build(
                item.area,
                item.var_type,
                item.bit_address(),
                request_count(item.var_type, item.count),
            )
        }
    }

    pub(crate) fn write_request_item(&self, items: &[WriteItem]) -> RequestItem {
        let item = &items[self.item_index];
        if self.is_part {
            RequestItem::build(
                item.area,
                VarType::Byte,
                (item.offset + self.offset) * 8,
                self.length as u16,
            )
        } else {
            RequestItem::build(
                item.area,
                item.var_type,
                item.bit_address(),
                request_count(item.var_type, item.count),
            )
        }
    }

    /// Payload of this slice for a write job.
    pub(crate) fn write_data_item(&self, items: &[WriteItem]) -> DataItem {
        let item = &items[self.item_index];
        let start = self.offset as usize;
        let var_type = if self.is_part {
            VarType::Byte
        } else {
            item.var_type
        };
        DataItem::build_write(var_type, item.data.slice(start..start + self.length))
    }
}

/// The address item length field counts elements, except for strings where
/// it covers the two byte header as well.
fn request_count(var_type: VarType, count: u16) -> u16 {
    match var_type {
        VarType::String => count + 2,
        _ => count,
    }
}

/// A bundle of slices sharing one read PDU.
#[derive(Debug)]
pub(crate) struct ReadPackage {
    pdu_budget: usize,
    pub(crate) items: Vec<PlannedSlice>,
    used_param_bytes: usize,
    used_data_bytes: usize,
    /// Set once the package has been sent.
    pub(crate) handled: bool,
    full: bool,
}

impl ReadPackage {
    fn new(pdu_budget: usize) -> Self {
        Self {
            pdu_budget,
            items: Vec::new(),
            used_param_bytes: 0,
            used_data_bytes: 0,
            handled: false,
            full: false,
        }
    }

    fn can_fit(&self, length: usize) -> bool {
        let request = read_request_overhead() + self.used_param_bytes + RequestItem::len();
        let response = read_response_overhead()
            + self.used_data_bytes
            + DataItem::header_len()
            + padded(length);
        request <= self.pdu_budget && response <= self.pdu_budget
    }

    fn try_add(&mut self, slice: PlannedSlice) -> bool {
        if self.handled || self.full || !self.can_fit(slice.length) {
            return false;
        }
        self.used_param_bytes += RequestItem::len();
        self.used_data_bytes += DataItem::header_len() + padded(slice.length);
        self.items.push(slice);
        if !self.can_fit(1) {
            self.full = true;
        }
        true
    }

    /// Size of the encoded job request.
    pub(crate) fn request_len(&self) -> usize {
        read_request_overhead() + self.used_param_bytes
    }

    /// Upper bound for the acknowledge this package provokes.
    pub(crate) fn response_len(&self) -> usize {
        read_response_overhead() + self.used_data_bytes
    }
}

/// A bundle of slices sharing one write PDU.
#[derive(Debug)]
pub(crate) struct WritePackage {
    pdu_budget: usize,
    pub(crate) items: Vec<PlannedSlice>,
    used_param_bytes: usize,
    used_data_bytes: usize,
    pub(crate) handled: bool,
    full: bool,
}

impl WritePackage {
    fn new(pdu_budget: usize) -> Self {
        Self {
            pdu_budget,
            items: Vec::new(),
            used_param_bytes: 0,
            used_data_bytes: 0,
            handled: false,
            full: false,
        }
    }

    fn can_fit(&self, length: usize) -> bool {
        let request = write_request_overhead()
            + self.used_param_bytes
            + self.used_data_bytes
            + RequestItem::len()
            + DataItem::header_len()
            + padded(length);
        request <= self.pdu_budget
    }

    fn try_add(&mut self, slice: PlannedSlice) -> bool {
        if self.handled || self.full || !self.can_fit(slice.length) {
            return false;
        }
        self.used_param_bytes += RequestItem::len();
        self.used_data_bytes += DataItem::header_len() + padded(slice.length);
        self.items.push(slice);
        if !self.can_fit(1) {
            self.full = true;
        }
        true
    }

    pub(crate) fn request_len(&self) -> usize {
        write_request_overhead() + self.used_param_bytes + self.used_data_bytes
    }
}

/// Plan read items into packages, splitting items that exceed the per-item
/// limit into byte addressed fragments.
pub(crate) fn plan_read(
    items: &[ReadItem],
    session: &SessionContext,
) -> Result<Vec<ReadPackage>, Error> {
    let budget = usize::from(session.pdu_size);
    let max_item = session.read_item_max_length();

    // Largest first improves first-fit packing.
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| items[*b].byte_len().cmp(&items[*a].byte_len()));

    let mut packages: Vec<ReadPackage> = Vec::new();
    for index in order {
        let item = &items[index];
        let total = item.byte_len();
        if total <= max_item {
            place_read(
                &mut packages,
                budget,
                PlannedSlice {
                    item_index: index,
                    offset: 0,
                    length: total,
                    is_part: false,
                },
            )?;
            continue;
        }

        if !item.var_type.is_splittable(item.area) {
            return Err(Error::TooMuchDataPerCall {
                limit: max_item,
                attempted: total,
            });
        }
        // Children of exactly the per-item limit, plus the remainder.
        let mut offset = 0;
        while offset < total {
            let length = max_item.min(total - offset);
            place_read(
                &mut packages,
                budget,
                PlannedSlice {
                    item_index: index,
                    offset: offset as u32,
                    length,
                    is_part: true,
                },
            )?;
            offset += length;
        }
    }

    Ok(packages)
}

fn place_read(
    packages: &mut Vec<ReadPackage>,
    budget: usize,
    slice: PlannedSlice,
) -> Result<(), Error> {
    if packages.iter_mut().any(|package| package.try_add(slice)) {
        return Ok(());
    }
    let mut package = ReadPackage::new(budget);
    if !package.try_add(slice) {
        return Err(Error::CouldNotAddPackage);
    }
    packages.push(package);
    Ok(())
}

/// Plan write items into packages, mirroring [`plan_read`] with the data
/// block accounted on the request side.
pub(crate) fn plan_write(
    items: &[WriteItem],
    session: &SessionContext,
) -> Result<Vec<WritePackage>, Error> {
    let budget = usize::from(session.pdu_size);
    let max_item = session.write_item_max_length();

    for item in items {
        if item.data.len() != item.byte_len() {
            return Err(Error::PayloadLength {
                expected: item.byte_len(),
                provided: item.data.len(),
            });
        }
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| items[*b].byte_len().cmp(&items[*a].byte_len()));

    let mut packages: Vec<WritePackage> = Vec::new();
    for index in order {
        let item = &items[index];
        let total = item.byte_len();
        if total <= max_item {
            place_write(
                &mut packages,
                budget,
                PlannedSlice {
                    item_index: index,
                    offset: 0,
                    length: total,
                    is_part: false,
                },
            )?;
            continue;
        }

        if !item.var_type.is_splittable(item.area) {
            return Err(Error::TooMuchDataPerCall {
                limit: max_item,
                attempted: total,
            });
        }
        let mut offset = 0;
        while offset < total {
            let length = max_item.min(total - offset);
            place_write(
                &mut packages,
                budget,
                PlannedSlice {
                    item_index: index,
                    offset: offset as u32,
                    length,
                    is_part: true,
                },
            )?;
            offset += length;
        }
    }

    Ok(packages)
}

fn place_write(
    packages: &mut Vec<WritePackage>,
    budget: usize,
    slice: PlannedSlice,
) -> Result<(), Error> {
    if packages.iter_mut().any(|package| package.try_add(slice)) {
        return Ok(());
    }
    let mut package = WritePackage::new(budget);
    if !package.try_add(slice) {
        return Err(Error::CouldNotAddPackage);
    }
    packages.push(package);
    Ok(())
}

/// Reassemble decoded read acknowledges onto the logical items, in the
/// planner's emission order. The first non-OK return code observed for an
/// item wins; fragments fill their parent's buffer exactly once.
pub(crate) fn merge_read_results(
    items: &[ReadItem],
    packages: &[ReadPackage],
    responses: Vec<Vec<DataItem>>,
) -> Result<Vec<Result<Bytes, Error>>, Error> {
    let mut buffers: Vec<Option<BytesMut>> = vec![None; items.len()];
    let mut codes: Vec<u8> = vec![ITEM_OK; items.len()];

    for (package, response) in packages.iter().zip(responses) {
        if response.len() != package.items.len() {
            return Err(Error::InvalidPdu("item count mismatch in read acknowledge"));
        }
        for (slice, data_item) in package.items.iter().zip(response) {
            let index = slice.item_index;
            if data_item.return_code != ITEM_OK {
                if codes[index] == ITEM_OK {
                    codes[index] = data_item.return_code;
                }
                continue;
            }
            if slice.is_part {
                if data_item.data.len() != slice.length {
                    return Err(Error::InvalidPdu("fragment length mismatch"));
                }
                let buffer = buffers[index]
                    .get_or_insert_with(|| BytesMut::zeroed(items[index].byte_len()));
                let start = slice.offset as usize;
                buffer[start..start + slice.length].copy_from_slice(&data_item.data);
            } else {
                buffers[index] = Some(BytesMut::from(data_item.data.as_ref()));
            }
        }
    }

    Ok((0..items.len())
        .map(|index| {
            if codes[index] != ITEM_OK {
                Err(Error::ProtocolContent {
                    return_code: codes[index],
                    item_index: index,
                })
            } else {
                Ok(buffers[index]
                    .take()
                    .map(BytesMut::freeze)
                    .unwrap_or_default())
            }
        })
        .collect())
}

/// Map per-slice write return codes back onto the logical items.
pub(crate) fn merge_write_results(
    item_count: usize,
    packages: &[WritePackage],
    responses: Vec<Vec<u8>>,
) -> Result<Vec<Result<(), Error>>, Error> {
    let mut codes: Vec<u8> = vec![ITEM_OK; item_count];

    for (package, response) in packages.iter().zip(responses) {
        if response.len() != package.items.len() {
            return Err(Error::InvalidPdu(
                "item count mismatch in write acknowledge",
            ));
        }
        for (slice, code) in package.items.iter().zip(response) {
            if code != ITEM_OK && codes[slice.item_index] == ITEM_OK {
                codes[slice.item_index] = code;
            }
        }
    }

    Ok(codes
        .into_iter()
        .enumerate()
        .map(|(index, code)| {
            if code == ITEM_OK {
                Ok(())
            } else {
                Err(Error::ProtocolContent {
                    return_code: code,
                    item_index: index,
                })
            }
        })
        .collect())
}
