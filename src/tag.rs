//! Parser for the compact textual tag notation.
//!
//! A tag names a PLC variable as `AREA.OFFSET[,TYPE[,COUNT]]`, for example
//! `DB1.10,w,4` (four words starting at byte 10 of data block 1) or `M10.2,x`
//! (flag bit 2 of flag byte 10). Areas and types are case insensitive.

use std::fmt;
use std::str::FromStr;

use crate::errors::Error;
use crate::s7_protocol::types::{PlcArea, ReadItem, VarType, WriteItem};

/// Parser stage, reported in [`Error::TagParse`] on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagParseState {
    /// Reading the area token (`I`, `M`, `Q`, `T`, `C`, `DBn`, ...).
    Area,
    /// Reading the offset token after the dot.
    Offset,
    /// Reading the type token.
    Type,
    /// Reading the element count token.
    NumberOfItems,
    /// Cross checking the parsed pieces.
    TypeValidation,
    /// Parsing finished.
    Success,
}

impl fmt::Display for TagParseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Area => "the area",
            Self::Offset => "the offset",
            Self::Type => "the type",
            Self::NumberOfItems => "the number of items",
            Self::TypeValidation => "type validation",
            Self::Success => "the finished tag",
        };
        write!(f, "{name}")
    }
}

/// A parsed tag address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Addressed memory area.
    pub area: PlcArea,
    /// Offset in bytes, or in bits for [`VarType::Bit`].
    pub offset: u32,
    /// Element type.
    pub var_type: VarType,
    /// Number of consecutive elements.
    pub count: u16,
}

impl Tag {
    /// Turn the tag into a read request item.
    pub fn to_read_item(self) -> ReadItem {
        ReadItem {
            area: self.area,
            offset: self.offset,
            var_type: self.var_type,
            count: self.count,
        }
    }

    /// Turn the tag into a write request item carrying `data`.
    pub fn to_write_item(self, data: bytes::Bytes) -> WriteItem {
        WriteItem {
            area: self.area,
            offset: self.offset,
            var_type: self.var_type,
            count: self.count,
            data,
        }
    }
}

impl FromStr for Tag {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_tag(input)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.area {
            PlcArea::InputByte => write!(f, "I")?,
            PlcArea::FlagByte => write!(f, "M")?,
            PlcArea::OutputByte => write!(f, "Q")?,
            PlcArea::Timer => write!(f, "T")?,
            PlcArea::Counter => write!(f, "C")?,
            PlcArea::DataBlock(number) => write!(f, "DB{number}")?,
        }
        let type_token = match self.var_type {
            VarType::Bit => {
                // Bit offsets are stored in bits; re-emit as byte plus suffix.
                return write!(
                    f,
                    ".{},x{},{}",
                    self.offset / 8,
                    self.offset % 8,
                    self.count
                );
            }
            VarType::Byte => "b",
            VarType::Char => "c",
            VarType::Word => "w",
            VarType::DWord => "dw",
            VarType::Int16 => "i",
            VarType::Int32 => "di",
            VarType::Float32 => "r",
            VarType::String => "s",
        };
        write!(f, ".{},{},{}", self.offset, type_token, self.count)
    }
}

fn fail(state: TagParseState, fragment: &str, tag: &str) -> Error {
    Error::TagParse {
        state,
        fragment: fragment.to_string(),
        tag: tag.to_string(),
    }
}

/// Parse a tag string.
///
/// The parser is a token walk through the states `Area → Offset → Type →
/// NumberOfItems → TypeValidation`. Two offset spellings exist: the offset
/// may follow the area after a dot (`M.10`, `DB1.10`), or for the byte
/// areas it may be glued to the area letter with the dot position naming a
/// bit (`M10.2`). In both cases a bit address is `byte_offset * 8 +
/// bit_index`, with an `x` type suffix adding its digits on top.
pub(crate) fn parse_tag(input: &str) -> Result<Tag, Error> {
    let mut tokens = input.split(['.', ',']).peekable();

    // Area: letters followed by optional digits.
    let area_token = tokens.next().unwrap_or("");
    let split_at = area_token
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(area_token.len());
    let (letters, inline_digits) = area_token.split_at(split_at);
    let area = match letters.to_ascii_uppercase().as_str() {
        "I" | "E" => PlcArea::InputByte,
        "M" => PlcArea::FlagByte,
        "Q" | "A" => PlcArea::OutputByte,
        "T" => PlcArea::Timer,
        "C" | "Z" => PlcArea::Counter,
        "DB" => {
            let number = inline_digits
                .parse::<u16>()
                .map_err(|_| fail(TagParseState::Area, area_token, input))?;
            PlcArea::DataBlock(number)
        }
        _ => return Err(fail(TagParseState::Area, area_token, input)),
    };

    // Offset: for `M10` style areas the glued digits are the byte offset and
    // the dot position carries a bit index; otherwise the dot position is
    // the byte offset itself.
    let inline_offset = match (&area, inline_digits) {
        (PlcArea::DataBlock(_), _) | (_, "") => None,
        (_, digits) => Some(
            digits
                .parse::<u32>()
                .map_err(|_| fail(TagParseState::Area, area_token, input))?,
        ),
    };

    let (byte_offset, bit_index) = match inline_offset {
        Some(byte_offset) => {
            let bit_token_follows = matches!(
                tokens.peek(),
                Some(token) if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
            );
            let bit_index = if bit_token_follows {
                let token = tokens.next().unwrap_or_default();
                token
                    .parse::<u32>()
                    .map_err(|_| fail(TagParseState::Offset, token, input))?
            } else {
                0
            };
            (byte_offset, bit_index)
        }
        None => {
            let token = tokens
                .next()
                .ok_or_else(|| fail(TagParseState::Offset, "", input))?;
            let byte_offset = token
                .parse::<u32>()
                .map_err(|_| fail(TagParseState::Offset, token, input))?;
            (byte_offset, 0)
        }
    };

    // Type: optional, defaults to byte access.
    let (var_type, suffix_bits) = match tokens.next() {
        None => (VarType::Byte, 0),
        Some(token) => {
            let lowered = token.to_ascii_lowercase();
            match lowered.as_str() {
                "b" => (VarType::Byte, 0),
                "c" => (VarType::Char, 0),
                "w" => (VarType::Word, 0),
                "dw" => (VarType::DWord, 0),
                "i" => (VarType::Int16, 0),
                "di" => (VarType::Int32, 0),
                "r" => (VarType::Float32, 0),
                "s" => (VarType::String, 0),
                other if other.starts_with('x') => {
                    // A bare `x` selects bit zero.
                    let digits = &other[1..];
                    let bit = if digits.is_empty() {
                        0
                    } else {
                        digits
                            .parse::<u32>()
                            .map_err(|_| fail(TagParseState::Type, token, input))?
                    };
                    (VarType::Bit, bit)
                }
                _ => return Err(fail(TagParseState::Type, token, input)),
            }
        }
    };

    // Count: optional, defaults to one element.
    let count = match tokens.next() {
        None => 1,
        Some(token) => token
            .parse::<u16>()
            .map_err(|_| fail(TagParseState::NumberOfItems, token, input))?,
    };

    // Validation of the assembled address.
    if let Some(extra) = tokens.next() {
        return Err(fail(TagParseState::TypeValidation, extra, input));
    }
    if count == 0 {
        return Err(fail(TagParseState::NumberOfItems, "0", input));
    }
    if bit_index > 7 {
        return Err(fail(
            TagParseState::TypeValidation,
            &bit_index.to_string(),
            input,
        ));
    }
    // `M10.2,w` addresses the whole byte; the bit position only counts for
    // bit access.
    let offset = match var_type {
        VarType::Bit => byte_offset * 8 + bit_index + suffix_bits,
        _ => byte_offset,
    };

    Ok(Tag {
        area,
        offset,
        var_type,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Tag {
        input.parse().expect("tag should parse")
    }

    #[test]
    fn data_block_bit_with_bare_suffix() {
        let tag = parse("DB1.80000,x,1");
        assert_eq!(tag.area, PlcArea::DataBlock(1));
        assert_eq!(tag.offset, 640_000);
        assert_eq!(tag.var_type, VarType::Bit);
        assert_eq!(tag.count, 1);
    }

    #[test]
    fn flag_word_keeps_byte_offset() {
        let tag = parse("M10.2,w,4");
        assert_eq!(tag.area, PlcArea::FlagByte);
        assert_eq!(tag.offset, 10);
        assert_eq!(tag.var_type, VarType::Word);
        assert_eq!(tag.count, 4);
    }

    #[test]
    fn flag_bit_combines_byte_and_bit() {
        let tag = parse("M10.2,x");
        assert_eq!(tag.area, PlcArea::FlagByte);
        assert_eq!(tag.offset, 82);
        assert_eq!(tag.var_type, VarType::Bit);
        assert_eq!(tag.count, 1);
    }

    #[test]
    fn bit_suffix_digits_add_to_offset() {
        let tag = parse("DB7.10,x3");
        assert_eq!(tag.area, PlcArea::DataBlock(7));
        assert_eq!(tag.offset, 83);
        assert_eq!(tag.var_type, VarType::Bit);
    }

    #[test]
    fn bare_offset_defaults_to_byte_type() {
        let tag = parse("M.20");
        assert_eq!(tag.area, PlcArea::FlagByte);
        assert_eq!(tag.offset, 20);
        assert_eq!(tag.var_type, VarType::Byte);
        assert_eq!(tag.count, 1);
    }

    #[test]
    fn area_aliases() {
        assert_eq!(parse("E.0").area, PlcArea::InputByte);
        assert_eq!(parse("A.0").area, PlcArea::OutputByte);
        assert_eq!(parse("Z.0").area, PlcArea::Counter);
        assert_eq!(parse("t.3,w").area, PlcArea::Timer);
    }

    #[test]
    fn string_type() {
        let tag = parse("DB5.0,s,20");
        assert_eq!(tag.var_type, VarType::String);
        assert_eq!(tag.count, 20);
    }

    #[test]
    fn rejects_malformed_tags() {
        for (input, state) in [
            ("X.0", TagParseState::Area),
            ("DB.0", TagParseState::Area),
            ("M.", TagParseState::Offset),
            ("M.abc", TagParseState::Offset),
            ("M.0,q", TagParseState::Type),
            ("M.0,w,zz", TagParseState::NumberOfItems),
            ("M.0,w,0", TagParseState::NumberOfItems),
            ("M10.9,x", TagParseState::TypeValidation),
            ("M.0,w,1,9", TagParseState::TypeValidation),
        ] {
            match input.parse::<Tag>() {
                Err(Error::TagParse {
                    state: reported,
                    tag,
                    ..
                }) => {
                    assert_eq!(reported, state, "tag {input}");
                    assert_eq!(tag, input);
                }
                other => panic!("expected parse failure for {input}, got {other:?}"),
            }
        }
    }

    #[test]
    fn roundtrip_is_semantically_stable() {
        for input in [
            "DB1.80000,x,1",
            "M10.2,w,4",
            "M10.2,x",
            "DB7.10,x3",
            "I.4,dw,2",
            "Q.0,b,8",
            "T.3,w,2",
            "C.0,w,1",
            "DB5.0,s,20",
            "M.20,i,3",
            "DB2.16,r,4",
            "DB2.16,di,1",
            "M.1,c,2",
        ] {
            let tag = parse(input);
            let reparsed = parse(&tag.to_string());
            assert_eq!(tag, reparsed, "roundtrip of {input}");
        }
    }
}
