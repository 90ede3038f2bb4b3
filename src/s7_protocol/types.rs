use bytes::Bytes;

pub(crate) const READ_OPERATION: u8 = 0x04;
pub(crate) const WRITE_OPERATION: u8 = 0x05;
// Block upload function codes, recognised but not driven by this client.
#[allow(dead_code)]
pub(crate) const UPLOAD_START_OPERATION: u8 = 0x1D;
#[allow(dead_code)]
pub(crate) const UPLOAD_OPERATION: u8 = 0x1E;
#[allow(dead_code)]
pub(crate) const UPLOAD_END_OPERATION: u8 = 0x1F;

pub(crate) const SPEC_TYPE_READ_WRITE: u8 = 0x12;
pub(crate) const SYNTAX_ID_ANY_TYPE: u8 = 0x10;

/// Memory area of an addressed variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlcArea {
    /// Process input image (I/E).
    InputByte,
    /// Flag bytes / Merker (M). Address registers within the CPU.
    FlagByte,
    /// Process output image (Q/A).
    OutputByte,
    /// Timer area (T).
    Timer,
    /// Counter area (C/Z).
    Counter,
    /// Data block storage with its block number (DBn).
    DataBlock(u16),
}

impl PlcArea {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            Self::InputByte => 0x81,
            Self::OutputByte => 0x82,
            Self::FlagByte => 0x83,
            Self::DataBlock(_) => 0x84,
            Self::Counter => 0x1C,
            Self::Timer => 0x1D,
        }
    }

    pub(crate) fn db_number(self) -> u16 {
        match self {
            Self::DataBlock(number) => number,
            _ => 0,
        }
    }
}

/// Element type of an addressed variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarType {
    /// Single bit; the item offset is given in bits.
    Bit,
    /// Unsigned byte (8 bit).
    Byte,
    /// Character (8 bit).
    Char,
    /// Word (16 bit).
    Word,
    /// Double word (32 bit).
    DWord,
    /// Signed integer (16 bit).
    Int16,
    /// Signed double integer (32 bit).
    Int32,
    /// IEEE 754 float (32 bit).
    Float32,
    /// S7 string; the wire carries a two byte header before the characters.
    String,
}

impl VarType {
    /// Size in bytes of one element of this type.
    pub(crate) fn element_size(self) -> usize {
        match self {
            Self::Bit | Self::Byte | Self::Char | Self::String => 1,
            Self::Word | Self::Int16 => 2,
            Self::DWord | Self::Int32 | Self::Float32 => 4,
        }
    }

    /// Transport size code used in address items. Timer and counter areas
    /// override this with their area code.
    pub(crate) fn transport_size(self, area: PlcArea) -> u8 {
        match area {
            PlcArea::Timer | PlcArea::Counter => area.wire_code(),
            _ => match self {
                Self::Bit => 0x01,
                Self::Byte => 0x02,
                Self::Char | Self::String => 0x03,
                Self::Word => 0x04,
                Self::Int16 => 0x05,
                Self::DWord => 0x06,
                Self::Int32 => 0x07,
                Self::Float32 => 0x08,
            },
        }
    }

    /// Whether slices of an oversized item may be re-addressed as plain
    /// byte reads. Bits and strings have positional semantics that do not
    /// survive slicing; timers and counters are not byte addressed.
    pub(crate) fn is_splittable(self, area: PlcArea) -> bool {
        !matches!(area, PlcArea::Timer | PlcArea::Counter)
            && !matches!(self, Self::Bit | Self::String)
    }
}

/// One logical read request item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadItem {
    /// Memory area to read from.
    pub area: PlcArea,
    /// Offset in bytes, or in bits when `var_type` is [`VarType::Bit`].
    pub offset: u32,
    /// Element type.
    pub var_type: VarType,
    /// Number of consecutive elements, at least 1.
    pub count: u16,
}

impl ReadItem {
    /// Length in bytes of the data this item produces on the wire.
    pub(crate) fn byte_len(&self) -> usize {
        wire_len(self.area, self.var_type, self.count)
    }

    /// Start address in bit granularity as encoded into address items.
    pub(crate) fn bit_address(&self) -> u32 {
        bit_address(self.area, self.var_type, self.offset)
    }
}

/// One logical write request item carrying its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    /// Memory area to write to.
    pub area: PlcArea,
    /// Offset in bytes, or in bits when `var_type` is [`VarType::Bit`].
    pub offset: u32,
    /// Element type.
    pub var_type: VarType,
    /// Number of consecutive elements, at least 1.
    pub count: u16,
    /// Payload; its length must equal the item's wire length.
    pub data: Bytes,
}

impl WriteItem {
    pub(crate) fn byte_len(&self) -> usize {
        wire_len(self.area, self.var_type, self.count)
    }

    pub(crate) fn bit_address(&self) -> u32 {
        bit_address(self.area, self.var_type, self.offset)
    }
}

fn wire_len(area: PlcArea, var_type: VarType, count: u16) -> usize {
    match area {
        // Timers and counters are 16 bit words regardless of the tag type.
        PlcArea::Timer | PlcArea::Counter => usize::from(count) * 2,
        _ => match var_type {
            VarType::String => usize::from(count) + 2,
            VarType::Bit => 1,
            other => usize::from(count) * other.element_size(),
        },
    }
}

fn bit_address(area: PlcArea, var_type: VarType, offset: u32) -> u32 {
    match (area, var_type) {
        // Timer/counter addresses count elements, not bits.
        (PlcArea::Timer | PlcArea::Counter, _) => offset,
        (_, VarType::Bit) => offset,
        _ => offset * 8,
    }
}
