//! Header-only GGUF inspection.
//!
//! Reads the fixed GGUF preamble and walks the first metadata entries to pick
//! out the architecture and the `general.file_type` quantization code. Tensor
//! data is never touched and the walk is bounded, so a multi-gigabyte file
//! costs a few kilobytes of reads.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// `GGUF` in little-endian byte order.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Metadata entries examined before giving up.
const MAX_METADATA_ENTRIES: u64 = 64;

/// Longest key or string value we are willing to read.
const MAX_STRING_LEN: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum GgufError {
    #[error("not a GGUF file")]
    BadMagic,

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed GGUF header: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata pulled from the GGUF header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
    /// `general.architecture` (e.g. "llama", "qwen2").
    pub architecture: Option<String>,
    /// `general.name`.
    pub name: Option<String>,
    /// `general.file_type` quantization code.
    pub file_type: Option<u32>,
}

impl GgufHeader {
    /// Human-readable quantization label, if the file type is known.
    pub fn quantization(&self) -> Option<&'static str> {
        self.file_type.and_then(file_type_label)
    }
}

/// Check only the four magic bytes.
pub fn has_magic(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GGUF_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the GGUF header of the file at `path`.
pub fn read_header(path: &Path) -> Result<GgufHeader, GgufError> {
    let file = File::open(path)?;
    parse_header(BufReader::new(file))
}

/// Parse a GGUF header from any seekable reader.
pub fn parse_header<R: Read + Seek>(mut reader: R) -> Result<GgufHeader, GgufError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(eof_as_bad_magic)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic);
    }

    let version = read_u32(&mut reader)?;
    // Version 1 used 32-bit counts and is long obsolete.
    if !(2..=3).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let tensor_count = read_u64(&mut reader)?;
    let metadata_count = read_u64(&mut reader)?;

    let mut header = GgufHeader {
        version,
        tensor_count,
        metadata_count,
        ..Default::default()
    };

    for _ in 0..metadata_count.min(MAX_METADATA_ENTRIES) {
        let key = read_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;

        match (key.as_str(), value_type) {
            ("general.architecture", TYPE_STRING) => {
                header.architecture = Some(read_string(&mut reader)?);
            }
            ("general.name", TYPE_STRING) => {
                header.name = Some(read_string(&mut reader)?);
            }
            ("general.file_type", TYPE_U32) => {
                header.file_type = Some(read_u32(&mut reader)?);
            }
            _ => {
                if !skip_value(&mut reader, value_type)? {
                    debug!(key, "Stopping GGUF walk at unbounded value");
                    break;
                }
            }
        }

        if header.architecture.is_some() && header.file_type.is_some() {
            break;
        }
    }

    Ok(header)
}

const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

fn scalar_size(value_type: u32) -> Option<u64> {
    match value_type {
        TYPE_U8 | TYPE_I8 | TYPE_BOOL => Some(1),
        TYPE_U16 | TYPE_I16 => Some(2),
        TYPE_U32 | TYPE_I32 | TYPE_F32 => Some(4),
        TYPE_U64 | TYPE_I64 | TYPE_F64 => Some(8),
        _ => None,
    }
}

/// Skip one value. Returns `false` when the value is a string array, which
/// can only be skipped by reading every element (tokenizer vocabularies).
fn skip_value<R: Read + Seek>(reader: &mut R, value_type: u32) -> Result<bool, GgufError> {
    if let Some(size) = scalar_size(value_type) {
        seek_forward(reader, size)?;
        return Ok(true);
    }

    match value_type {
        TYPE_STRING => {
            let len = read_u64(reader)?;
            seek_forward(reader, len)?;
            Ok(true)
        }
        TYPE_ARRAY => {
            let elem_type = read_u32(reader)?;
            let count = read_u64(reader)?;
            match scalar_size(elem_type) {
                Some(size) => {
                    let bytes = count.checked_mul(size).ok_or_else(|| {
                        GgufError::Malformed(format!("array of {count} elements overflows"))
                    })?;
                    seek_forward(reader, bytes)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        other => Err(GgufError::Malformed(format!("unknown value type {other}"))),
    }
}

fn seek_forward<R: Seek>(reader: &mut R, bytes: u64) -> Result<(), GgufError> {
    let offset = i64::try_from(bytes)
        .map_err(|_| GgufError::Malformed(format!("skip of {bytes} bytes too large")))?;
    reader.seek(SeekFrom::Current(offset))?;
    Ok(())
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, GgufError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, GgufError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, GgufError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(GgufError::Malformed(format!("string of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|e| GgufError::Malformed(e.to_string()))
}

fn truncated(err: std::io::Error) -> GgufError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GgufError::Malformed("truncated header".to_string())
    } else {
        GgufError::Io(err)
    }
}

fn eof_as_bad_magic(err: std::io::Error) -> GgufError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GgufError::BadMagic
    } else {
        GgufError::Io(err)
    }
}

/// Map a `general.file_type` code to its conventional label.
pub fn file_type_label(code: u32) -> Option<&'static str> {
    let label = match code {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        21 => "Q2_K_S",
        22 => "IQ3_XS",
        23 => "IQ3_XXS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        26 => "IQ3_S",
        27 => "IQ3_M",
        28 => "IQ2_S",
        29 => "IQ2_M",
        30 => "IQ4_XS",
        31 => "IQ1_M",
        32 => "BF16",
        _ => return None,
    };
    Some(label)
}

/// Quantization tag embedded in a file name such as `mistral-7b.Q4_K_M`.
pub fn quantization_from_name(stem: &str) -> Option<&'static str> {
    let upper = stem.to_ascii_uppercase();
    let mut best: Option<&'static str> = None;
    for code in 0..=32 {
        if let Some(label) = file_type_label(code) {
            let longer = best.map_or(true, |b| label.len() > b.len());
            if longer && contains_token(&upper, label) {
                best = Some(label);
            }
        }
    }
    best
}

/// `needle` appears in `haystack` delimited by non-alphanumerics.
fn contains_token(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_ascii_alphanumeric());
        boundary(before) && boundary(after)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;

    /// Build a minimal v3 GGUF header with the given metadata.
    pub(crate) fn synthetic_header(arch: &str, file_type: u32, with_vocab_first: bool) -> Vec<u8> {
        fn put_str(buf: &mut Vec<u8>, s: &str) {
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&291u64.to_le_bytes());
        buf.extend_from_slice(&(if with_vocab_first { 4u64 } else { 3u64 }).to_le_bytes());

        if with_vocab_first {
            put_str(&mut buf, "tokenizer.ggml.tokens");
            buf.extend_from_slice(&TYPE_ARRAY.to_le_bytes());
            buf.extend_from_slice(&TYPE_STRING.to_le_bytes());
            buf.extend_from_slice(&2u64.to_le_bytes());
            put_str(&mut buf, "<s>");
            put_str(&mut buf, "</s>");
        }

        put_str(&mut buf, "general.alignment");
        buf.extend_from_slice(&TYPE_U32.to_le_bytes());
        buf.extend_from_slice(&32u32.to_le_bytes());

        put_str(&mut buf, "general.architecture");
        buf.extend_from_slice(&TYPE_STRING.to_le_bytes());
        put_str(&mut buf, arch);

        put_str(&mut buf, "general.file_type");
        buf.extend_from_slice(&TYPE_U32.to_le_bytes());
        buf.extend_from_slice(&file_type.to_le_bytes());

        buf
    }

    #[test]
    fn test_parse_synthetic_header() {
        let header = parse_header(Cursor::new(synthetic_header("llama", 15, false))).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.architecture.as_deref(), Some("llama"));
        assert_eq!(header.quantization(), Some("Q4_K_M"));
    }

    #[test]
    fn test_walk_stops_at_string_array() {
        let header = parse_header(Cursor::new(synthetic_header("qwen2", 7, true))).unwrap();
        assert!(header.architecture.is_none());
        assert!(header.file_type.is_none());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = parse_header(Cursor::new(b"not a model".to_vec())).unwrap_err();
        assert!(matches!(err, GgufError::BadMagic));

        let err = parse_header(Cursor::new(Vec::new())).unwrap_err();
        assert!(matches!(err, GgufError::BadMagic));
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let mut bytes = synthetic_header("llama", 15, false);
        bytes.truncate(30);
        let err = parse_header(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, GgufError::Malformed(_)));
    }

    #[test]
    fn test_quantization_from_name() {
        assert_eq!(quantization_from_name("mistral-7b-instruct.Q4_K_M"), Some("Q4_K_M"));
        assert_eq!(quantization_from_name("phi-3-mini-q8_0"), Some("Q8_0"));
        assert_eq!(quantization_from_name("tinyllama-f16"), Some("F16"));
        assert_eq!(quantization_from_name("modelA"), None);
    }
}
