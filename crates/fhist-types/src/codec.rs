//! Persisted form of an index entry's offset list.
//!
//! Offsets are written as delimiter-terminated integers, e.g. `1f4,2a0,` in
//! hex or `500,672,` in decimal. The trailing delimiter is mandatory: it
//! lets writers append by concatenation and makes a truncated value
//! detectable on decode.

use std::fmt::Write as _;

use fhist_error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Separator written after every offset.
pub const OFFSET_DELIMITER: u8 = b',';

/// Ordered offset list of one index entry. Most keys hold a single offset.
pub type Offsets = SmallVec<[u64; 2]>;

/// Numeric base of encoded offsets; store-wide and fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetBase {
    #[default]
    Hex,
    Decimal,
}

impl OffsetBase {
    #[must_use]
    pub const fn radix(self) -> u32 {
        match self {
            Self::Hex => 16,
            Self::Decimal => 10,
        }
    }

    /// Stable one-byte code persisted in the store header.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Hex => 16,
            Self::Decimal => 10,
        }
    }

    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            16 => Some(Self::Hex),
            10 => Some(Self::Decimal),
            _ => None,
        }
    }
}

/// Append one encoded offset (with its delimiter) to `out`.
pub fn append_offset(out: &mut Vec<u8>, offset: u64, base: OffsetBase) {
    let mut digits = String::with_capacity(20);
    // Writing into a String cannot fail.
    let _ = match base {
        OffsetBase::Hex => write!(digits, "{offset:x}"),
        OffsetBase::Decimal => write!(digits, "{offset}"),
    };
    out.extend_from_slice(digits.as_bytes());
    out.push(OFFSET_DELIMITER);
}

/// Encode an offset list.
#[must_use]
pub fn encode_offsets(offsets: &[u64], base: OffsetBase) -> Vec<u8> {
    let mut out = Vec::with_capacity(offsets.len() * 9);
    for &offset in offsets {
        append_offset(&mut out, offset, base);
    }
    out
}

/// Decode an offset list, rejecting empty, unterminated or non-numeric input.
pub fn decode_offsets(bytes: &[u8], base: OffsetBase) -> Result<Offsets> {
    let Some((&last, body)) = bytes.split_last() else {
        return Err(HistoryError::offsets_corrupt("empty encoded offset list"));
    };
    if last != OFFSET_DELIMITER {
        return Err(HistoryError::offsets_corrupt(format!(
            "missing trailing delimiter in {:?}",
            String::from_utf8_lossy(bytes)
        )));
    }

    let mut offsets = Offsets::new();
    for item in body.split(|&b| b == OFFSET_DELIMITER) {
        let text = std::str::from_utf8(item)
            .map_err(|_| HistoryError::offsets_corrupt("offset is not utf-8"))?;
        if text.is_empty() {
            return Err(HistoryError::offsets_corrupt(format!(
                "empty offset field in {:?}",
                String::from_utf8_lossy(bytes)
            )));
        }
        // Digits only: `from_str_radix` accepts a leading `+`.
        if !text.chars().all(|c| c.is_digit(base.radix())) {
            return Err(HistoryError::offsets_corrupt(format!(
                "offset {text:?} is not a base-{} number",
                base.radix()
            )));
        }
        let offset = u64::from_str_radix(text, base.radix()).map_err(|err| {
            HistoryError::offsets_corrupt(format!("bad offset {text:?}: {err}"))
        })?;
        offsets.push(offset);
    }
    Ok(offsets)
}
