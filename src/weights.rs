//! Reader and writer for 2-D `float32` arrays stored in NumPy `.npy` files.
//!
//! Only the subset produced by `np.save` on a C-ordered `float32` matrix is
//! accepted: descriptor `'<f4'`, `fortran_order: False`, and a shape tuple
//! with exactly two entries.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::errors::{FormatError, FormatResult};

const MAGIC: &[u8] = b"\x93NUMPY";
const PREAMBLE_V1: usize = MAGIC.len() + 2 + 2;
const PREAMBLE_V2: usize = MAGIC.len() + 2 + 4;
const HEADER_ALIGNMENT: usize = 64;
const F32_DESCR: &str = "<f4";

/// A decoded row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

pub fn read_npy(path: impl AsRef<Path>) -> FormatResult<NpyMatrix> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| FormatError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_npy(&bytes)
}

pub fn write_npy(path: impl AsRef<Path>, rows: usize, cols: usize, data: &[f32]) -> FormatResult<()> {
    let path = path.as_ref();
    let bytes = encode_npy(rows, cols, data)?;
    fs::write(path, bytes).map_err(|source| FormatError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Decodes an in-memory `.npy` image.
pub fn parse_npy(bytes: &[u8]) -> FormatResult<NpyMatrix> {
    if bytes.len() < PREAMBLE_V1 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let major = bytes[MAGIC.len()];
    let minor = bytes[MAGIC.len() + 1];

    let (header_start, header_len) = match major {
        1 => {
            let len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            (PREAMBLE_V1, len)
        }
        2 | 3 => {
            if bytes.len() < PREAMBLE_V2 {
                return Err(malformed("truncated preamble"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (PREAMBLE_V2, len)
        }
        _ => return Err(FormatError::UnsupportedVersion { major, minor }),
    };

    let header_end = header_start
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| malformed("header extends past end of file"))?;
    let text = std::str::from_utf8(&bytes[header_start..header_end])
        .map_err(|_| malformed("header is not valid text"))?;
    let header = parse_header(text)?;

    let descr = header_field(&header, "descr")?
        .as_str()
        .ok_or_else(|| malformed("'descr' is not a string"))?;
    if descr != F32_DESCR {
        return Err(FormatError::UnsupportedDtype {
            descr: descr.to_string(),
        });
    }
    let fortran_order = header_field(&header, "fortran_order")?
        .as_bool()
        .ok_or_else(|| malformed("'fortran_order' is not a boolean"))?;
    if fortran_order {
        return Err(FormatError::FortranOrder);
    }
    let shape = header_field(&header, "shape")?
        .as_dims()
        .ok_or_else(|| malformed("'shape' is not a tuple"))?;
    let &[rows, cols] = shape else {
        return Err(FormatError::UnsupportedRank { rank: shape.len() });
    };

    let payload = &bytes[header_end..];
    let expected = rows
        .checked_mul(cols)
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| malformed("shape overflows"))?;
    if payload.len() != expected {
        return Err(FormatError::PayloadSizeMismatch {
            rows,
            cols,
            expected,
            actual: payload.len(),
        });
    }

    let data = payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(NpyMatrix { rows, cols, data })
}

/// Encodes a row-major matrix as a version 1.0 `.npy` image.
pub fn encode_npy(rows: usize, cols: usize, data: &[f32]) -> FormatResult<Vec<u8>> {
    if rows.checked_mul(cols) != Some(data.len()) {
        return Err(FormatError::PayloadSizeMismatch {
            rows,
            cols,
            expected: rows.saturating_mul(cols).saturating_mul(4),
            actual: data.len() * 4,
        });
    }

    let mut header =
        format!("{{'descr': '{F32_DESCR}', 'fortran_order': False, 'shape': ({rows}, {cols}), }}");
    let unpadded = PREAMBLE_V1 + header.len() + 1;
    let padding = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let header_len =
        u16::try_from(header.len()).map_err(|_| malformed("header longer than 65535 bytes"))?;

    let mut bytes = Vec::with_capacity(PREAMBLE_V1 + header.len() + data.len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&[1, 0]);
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(header.as_bytes());
    for value in data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Ok(bytes)
}

fn malformed(reason: &str) -> FormatError {
    FormatError::MalformedHeader {
        reason: reason.to_string(),
    }
}

/// A value in the header dictionary.
#[derive(Debug, Clone, PartialEq)]
enum HeaderValue {
    Str(String),
    Bool(bool),
    Tuple(Vec<usize>),
}

impl HeaderValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(text) => Some(text.as_str()),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    fn as_dims(&self) -> Option<&[usize]> {
        match self {
            HeaderValue::Tuple(dims) => Some(dims.as_slice()),
            _ => None,
        }
    }
}

/// Cursor over the Python dict literal that forms the `.npy` header.
struct HeaderParser<'a> {
    rest: &'a str,
}

impl<'a> HeaderParser<'a> {
    fn eat(&mut self, c: char) -> bool {
        self.rest = self.rest.trim_start();
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn expect(&mut self, c: char) -> FormatResult<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(malformed(&format!("expected '{c}' in header")))
        }
    }

    fn string(&mut self) -> FormatResult<String> {
        self.rest = self.rest.trim_start();
        let quote = self
            .rest
            .chars()
            .next()
            .filter(|c| *c == '\'' || *c == '"')
            .ok_or_else(|| malformed("expected a quoted string in header"))?;
        let body = &self.rest[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| malformed("unterminated string in header"))?;
        self.rest = &body[end + 1..];
        Ok(body[..end].to_string())
    }

    fn word(&mut self) -> &'a str {
        self.rest = self.rest.trim_start();
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        word
    }

    fn tuple(&mut self) -> FormatResult<Vec<usize>> {
        self.expect('(')?;
        let mut dims = Vec::new();
        while !self.eat(')') {
            let word = self.word();
            let dim = word
                .trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| malformed(&format!("invalid dimension '{word}'")))?;
            dims.push(dim);
            if !self.eat(',') {
                self.expect(')')?;
                break;
            }
        }
        Ok(dims)
    }

    fn value(&mut self) -> FormatResult<HeaderValue> {
        self.rest = self.rest.trim_start();
        match self.rest.chars().next() {
            Some('\'' | '"') => Ok(HeaderValue::Str(self.string()?)),
            Some('(') => Ok(HeaderValue::Tuple(self.tuple()?)),
            _ => match self.word() {
                "True" => Ok(HeaderValue::Bool(true)),
                "False" => Ok(HeaderValue::Bool(false)),
                other => Err(malformed(&format!("unexpected header value '{other}'"))),
            },
        }
    }
}

/// Parses `{'key': value, ...}` into its entries. Duplicate keys are rejected.
fn parse_header(text: &str) -> FormatResult<HashMap<String, HeaderValue>> {
    let mut parser = HeaderParser { rest: text };
    parser.expect('{')?;
    let mut entries = HashMap::new();
    while !parser.eat('}') {
        let key = parser.string()?;
        parser.expect(':')?;
        let value = parser.value()?;
        if entries.insert(key.clone(), value).is_some() {
            return Err(malformed(&format!("duplicate key '{key}'")));
        }
        if !parser.eat(',') {
            parser.expect('}')?;
            break;
        }
    }
    if !parser.rest.trim().is_empty() {
        return Err(malformed("unexpected text after header dictionary"));
    }
    Ok(entries)
}

fn header_field<'h>(
    header: &'h HashMap<String, HeaderValue>,
    key: &str,
) -> FormatResult<&'h HeaderValue> {
    header
        .get(key)
        .ok_or_else(|| malformed(&format!("missing key '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_header(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&[1, 0]);
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_encoded_header_is_64_byte_aligned() {
        let bytes = encode_npy(2, 3, &[0.0; 6]).expect("encode");
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((PREAMBLE_V1 + header_len) % HEADER_ALIGNMENT, 0);
        assert_eq!(bytes[PREAMBLE_V1 + header_len - 1], b'\n');
    }

    #[test]
    fn test_parse_numpy_written_header() {
        // Header exactly as emitted by numpy for np.zeros((2, 1), np.float32) + 1.5.
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (2, 1), }          \n";
        let payload: Vec<u8> = [1.5f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let matrix = parse_npy(&image_with_header(header, &payload)).expect("parse");
        assert_eq!(matrix.rows, 2);
        assert_eq!(matrix.cols, 1);
        assert_eq!(matrix.data, vec![1.5, -2.0]);
    }

    #[test]
    fn test_parse_header_in_any_key_order() {
        let header = "{\"shape\": (3L, 2L), \"fortran_order\": False, \"descr\": \"<f4\"}\n";
        let payload = vec![0u8; 24];
        let matrix = parse_npy(&image_with_header(header, &payload)).expect("parse");
        assert_eq!((matrix.rows, matrix.cols), (3, 2));
    }

    #[test]
    fn test_header_keys_are_matched_as_keys() {
        // A descr whose text mentions another key must not be read as that key.
        let header = "{'descr': 'shape: (1, 1)', 'fortran_order': False, 'shape': (1, 1), }\n";
        match parse_npy(&image_with_header(header, &[0u8; 4])) {
            Err(FormatError::UnsupportedDtype { descr }) => assert_eq!(descr, "shape: (1, 1)"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_headers() {
        for header in [
            "{'descr': '<f4', 'fortran_order': False, 'shape': (1, 1), 'shape': (1, 1)}\n",
            "{'descr': '<f4', 'fortran_order': 0, 'shape': (1, 1)}\n",
            "{'descr': '<f4', 'fortran_order': False, 'shape': (1, x)}\n",
            "{'descr': '<f4', 'fortran_order': False}\n",
            "{'descr': '<f4', 'fortran_order': False, 'shape': (1, 1)\n",
        ] {
            assert!(
                matches!(
                    parse_npy(&image_with_header(header, &[0u8; 4])),
                    Err(FormatError::MalformedHeader { .. })
                ),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_bad_magic() {
        assert!(matches!(
            parse_npy(b"PK\x03\x04 not numpy"),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn test_rejects_rank_one() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (10,), }\n";
        let payload = vec![0u8; 40];
        assert!(matches!(
            parse_npy(&image_with_header(header, &payload)),
            Err(FormatError::UnsupportedRank { rank: 1 })
        ));
    }

    #[test]
    fn test_rejects_rank_three() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (1, 2, 2), }\n";
        let payload = vec![0u8; 16];
        assert!(matches!(
            parse_npy(&image_with_header(header, &payload)),
            Err(FormatError::UnsupportedRank { rank: 3 })
        ));
    }

    #[test]
    fn test_rejects_non_float_dtype() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (1, 1), }\n";
        let payload = vec![0u8; 8];
        match parse_npy(&image_with_header(header, &payload)) {
            Err(FormatError::UnsupportedDtype { descr }) => assert_eq!(descr, "<f8"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_fortran_order() {
        let header = "{'descr': '<f4', 'fortran_order': True, 'shape': (1, 1), }\n";
        assert!(matches!(
            parse_npy(&image_with_header(header, &[0u8; 4])),
            Err(FormatError::FortranOrder)
        ));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (2, 2), }\n";
        assert!(matches!(
            parse_npy(&image_with_header(header, &[0u8; 12])),
            Err(FormatError::PayloadSizeMismatch {
                expected: 16,
                actual: 12,
                ..
            })
        ));
    }

    #[test]
    fn test_encode_rejects_wrong_length() {
        assert!(encode_npy(2, 2, &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.npy");
        let data = [0.1f32, -0.2, 3.5e-8, f32::MAX, 0.0, -0.0];
        write_npy(&path, 3, 2, &data).expect("write");
        let matrix = read_npy(&path).expect("read");
        assert_eq!((matrix.rows, matrix.cols), (3, 2));
        let bits: Vec<u32> = matrix.data.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = data.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            read_npy("/nonexistent/definitely/missing.npy"),
            Err(FormatError::Io { .. })
        ));
    }
}
