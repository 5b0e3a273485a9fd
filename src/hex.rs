// Intel HEX (I8HEX) firmware loader.
//
// Record format: `:BBAAAATT[DD...]CC`
//   BB    payload length
//   AAAA  16-bit load offset
//   TT    00 = data, 01 = end of file
//   CC    two's complement of the sum of all preceding bytes
//
// A bad line aborts loading. Lines before it stay written, the bad line
// writes nothing.

use std::path::Path;

use anyhow::Context;
use thiserror::Error;

pub const RECORD_DATA: u8 = 0x00;
pub const RECORD_EOF: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("line {line}: record does not start with ':'")]
    MissingStartCode { line: usize },

    #[error("line {line}: invalid hex digits")]
    InvalidDigits { line: usize },

    #[error("line {line}: record too short")]
    TooShort { line: usize },

    #[error("line {line}: byte count {declared} does not match payload length {actual}")]
    LengthMismatch {
        line: usize,
        declared: usize,
        actual: usize,
    },

    #[error("line {line}: checksum mismatch (expected {expected:02X}, found {found:02X})")]
    ChecksumMismatch { line: usize, expected: u8, found: u8 },

    #[error("line {line}: unsupported record type {record_type:02X}")]
    UnsupportedRecord { line: usize, record_type: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: u16,
    pub record_type: u8,
    pub data: Vec<u8>,
}

fn decode_bytes(digits: &str, line: usize) -> Result<Vec<u8>, HexError> {
    if digits.len() % 2 != 0 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HexError::InvalidDigits { line });
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).map_err(|_| HexError::InvalidDigits { line }))
        .collect()
}

/// Parses one record. `line` is only used for error reporting.
pub fn parse_record(text: &str, line: usize) -> Result<Record, HexError> {
    let digits = text
        .strip_prefix(':')
        .ok_or(HexError::MissingStartCode { line })?;
    let bytes = decode_bytes(digits, line)?;
    if bytes.len() < 5 {
        return Err(HexError::TooShort { line });
    }

    let declared = bytes[0] as usize;
    let actual = bytes.len() - 5;
    if declared != actual {
        return Err(HexError::LengthMismatch {
            line,
            declared,
            actual,
        });
    }

    let (fields, checksum) = bytes.split_at(bytes.len() - 1);
    let sum = fields.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    let expected = sum.wrapping_neg();
    if expected != checksum[0] {
        return Err(HexError::ChecksumMismatch {
            line,
            expected,
            found: checksum[0],
        });
    }

    Ok(Record {
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type: bytes[3],
        data: fields[4..].to_vec(),
    })
}

/// Feeds every data byte of `text` to `write` as `(address, value)`.
///
/// Returns the number of bytes written.
pub fn load(text: &str, mut write: impl FnMut(u16, u8)) -> Result<usize, HexError> {
    let mut written = 0;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let record = parse_record(raw, line)?;
        match record.record_type {
            RECORD_DATA => {
                for (i, byte) in record.data.iter().enumerate() {
                    write(record.offset.wrapping_add(i as u16), *byte);
                }
                written += record.data.len();
            }
            RECORD_EOF => {
                tracing::debug!("[HEX] End of file record at line {}", line);
                break;
            }
            record_type => return Err(HexError::UnsupportedRecord { line, record_type }),
        }
    }

    tracing::debug!("[HEX] Loaded {} byte(s)", written);
    Ok(written)
}

pub fn load_file(path: impl AsRef<Path>, write: impl FnMut(u16, u8)) -> anyhow::Result<usize> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading firmware image {}", path.display()))?;
    let written = load(&text, write).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!("[HEX] Loaded {} byte(s) from {}", written, path.display());
    Ok(written)
}

/// Renders `data` as I8HEX data records followed by an EOF record.
pub fn encode(offset: u16, data: &[u8]) -> String {
    let mut out = String::new();
    let mut address = offset;
    for chunk in data.chunks(16) {
        let mut bytes = vec![chunk.len() as u8, (address >> 8) as u8, address as u8, RECORD_DATA];
        bytes.extend_from_slice(chunk);
        let checksum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg();

        out.push(':');
        for byte in bytes {
            out.push_str(&format!("{:02X}", byte));
        }
        out.push_str(&format!("{:02X}\n", checksum));
        address = address.wrapping_add(chunk.len() as u16);
    }
    out.push_str(":00000001FF\n");
    out
}
