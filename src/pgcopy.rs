//! Parser for the result of `COPY ... TO STDOUT WITH BINARY`.
//!
//! File format: an 11-byte signature, a 4-byte flags field, a 4-byte
//! extension length plus that many bytes (skipped), then one tuple per row:
//! big-endian i16 column count (`-1` terminates the stream) followed by,
//! per column, a big-endian i32 byte length (`-1` marks NULL) and the raw
//! cell bytes. See
//! <https://www.postgresql.org/docs/current/sql-copy.html#id-1.9.3.55.9.4.5>
//!
//! The parser is push-based: [`Parser::feed`] accepts chunks exactly as the
//! copy-out frames arrive off the wire, buffers partial rows internally and
//! yields every row that completed.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Signature bytes every binary copy stream starts with.
const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";

/// One decoded row; `None` cells are SQL NULL.
pub type Row = Vec<Option<Bytes>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    #[error(r"invalid file signature: expected PGCOPY\n\377\r\n\0")]
    InvalidSignature,
    #[error("copy stream ended mid-row")]
    Truncated,
    #[error("row data after end-of-stream marker")]
    TrailingData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Rows,
    Done,
}

/// Incremental binary-copy parser.
pub struct Parser {
    buf: BytesMut,
    state: State,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            state: State::Header,
        }
    }

    /// Whether the end-of-stream marker has been consumed.
    pub fn finished(&self) -> bool {
        self.state == State::Done
    }

    /// Consumes a chunk and returns every row completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Row>, CopyError> {
        if self.state == State::Done {
            if chunk.is_empty() {
                return Ok(Vec::new());
            }
            return Err(CopyError::TrailingData);
        }
        self.buf.extend_from_slice(chunk);

        let mut rows = Vec::new();
        loop {
            match self.state {
                State::Header => {
                    if !self.try_header()? {
                        return Ok(rows);
                    }
                }
                State::Rows => match self.try_row()? {
                    Some(row) => rows.push(row),
                    None => return Ok(rows),
                },
                State::Done => {
                    if !self.buf.is_empty() {
                        return Err(CopyError::TrailingData);
                    }
                    return Ok(rows);
                }
            }
        }
    }

    /// Validates that the stream terminated cleanly.
    pub fn finish(&self) -> Result<(), CopyError> {
        if self.state == State::Done {
            Ok(())
        } else {
            Err(CopyError::Truncated)
        }
    }

    fn try_header(&mut self) -> Result<bool, CopyError> {
        const FIXED: usize = 11 + 4 + 4;
        if self.buf.len() < FIXED {
            // an undersized prefix that already mismatches is a hard error
            let n = self.buf.len().min(SIGNATURE.len());
            if self.buf[..n] != SIGNATURE[..n] {
                return Err(CopyError::InvalidSignature);
            }
            return Ok(false);
        }
        if &self.buf[..11] != SIGNATURE {
            return Err(CopyError::InvalidSignature);
        }
        let ext = u32::from_be_bytes(self.buf[15..19].try_into().unwrap()) as usize;
        if self.buf.len() < FIXED + ext {
            return Ok(false);
        }
        self.buf.advance(FIXED + ext); // flags and extension are discarded
        self.state = State::Rows;
        Ok(true)
    }

    fn try_row(&mut self) -> Result<Option<Row>, CopyError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let ncols = i16::from_be_bytes(self.buf[..2].try_into().unwrap());
        if ncols == -1 {
            self.buf.advance(2);
            self.state = State::Done;
            if !self.buf.is_empty() {
                return Err(CopyError::TrailingData);
            }
            return Ok(None);
        }

        // First pass: make sure the whole row is buffered.
        let mut at = 2usize;
        for _ in 0..ncols {
            if self.buf.len() < at + 4 {
                return Ok(None);
            }
            let len = i32::from_be_bytes(self.buf[at..at + 4].try_into().unwrap());
            at += 4;
            if len > 0 {
                at += len as usize;
                if self.buf.len() < at {
                    return Ok(None);
                }
            }
        }

        // Second pass: consume it.
        self.buf.advance(2);
        let mut row = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            let len = i32::from_be_bytes(self.buf[..4].try_into().unwrap());
            self.buf.advance(4);
            if len == -1 {
                row.push(None);
            } else {
                row.push(Some(self.buf.split_to(len as usize).freeze()));
            }
        }
        Ok(Some(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes rows into the binary copy format, for round-trip tests.
    fn encode(rows: &[Vec<Option<&[u8]>>], extension: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&0u32.to_be_bytes()); // flags
        out.extend_from_slice(&(extension.len() as u32).to_be_bytes());
        out.extend_from_slice(extension);
        for row in rows {
            out.extend_from_slice(&(row.len() as i16).to_be_bytes());
            for cell in row {
                match cell {
                    None => out.extend_from_slice(&(-1i32).to_be_bytes()),
                    Some(data) => {
                        out.extend_from_slice(&(data.len() as i32).to_be_bytes());
                        out.extend_from_slice(data);
                    }
                }
            }
        }
        out.extend_from_slice(&(-1i16).to_be_bytes());
        out
    }

    fn sample_rows() -> Vec<Vec<Option<&'static [u8]>>> {
        vec![
            vec![Some(b"\x00\x00\x00\x2a".as_slice()), Some(b"foo".as_slice())],
            vec![None, Some(b"".as_slice())],
            vec![Some(b"\x01".as_slice()), None],
        ]
    }

    #[test]
    fn test_roundtrip_single_chunk() {
        let encoded = encode(&sample_rows(), b"");
        let mut parser = Parser::new();
        let rows = parser.feed(&encoded).unwrap();
        parser.finish().unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0].as_deref(), Some(b"\x00\x00\x00\x2a".as_slice()));
        assert_eq!(rows[0][1].as_deref(), Some(b"foo".as_slice()));
        assert_eq!(rows[1][0], None);
        assert_eq!(rows[1][1].as_deref(), Some(b"".as_slice()));
        assert_eq!(rows[2][1], None);
    }

    #[test]
    fn test_roundtrip_byte_by_byte() {
        let encoded = encode(&sample_rows(), b"ext-bytes");
        let mut parser = Parser::new();
        let mut rows = Vec::new();
        for b in &encoded {
            rows.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }
        parser.finish().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1].as_deref(), Some(b"foo".as_slice()));
    }

    #[test]
    fn test_roundtrip_odd_chunks() {
        let encoded = encode(&sample_rows(), b"");
        for chunk_size in [2usize, 3, 5, 7, 16] {
            let mut parser = Parser::new();
            let mut rows = Vec::new();
            for chunk in encoded.chunks(chunk_size) {
                rows.extend(parser.feed(chunk).unwrap());
            }
            parser.finish().unwrap();
            assert_eq!(rows.len(), 3, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_invalid_signature() {
        let mut parser = Parser::new();
        let err = parser.feed(b"PGCOPY\n\xff\r\n\x01rest").unwrap_err();
        assert_eq!(err, CopyError::InvalidSignature);

        // detected early, even before 11 bytes arrive
        let mut parser = Parser::new();
        assert_eq!(parser.feed(b"NOPE"), Err(CopyError::InvalidSignature));
    }

    #[test]
    fn test_truncated_stream() {
        let encoded = encode(&sample_rows(), b"");
        let mut parser = Parser::new();
        parser.feed(&encoded[..encoded.len() - 3]).unwrap();
        assert_eq!(parser.finish(), Err(CopyError::Truncated));
    }

    #[test]
    fn test_trailing_data_rejected() {
        let mut encoded = encode(&sample_rows(), b"");
        encoded.extend_from_slice(b"junk");
        let mut parser = Parser::new();
        assert_eq!(parser.feed(&encoded), Err(CopyError::TrailingData));
    }

    #[test]
    fn test_empty_table() {
        let encoded = encode(&[], b"");
        let mut parser = Parser::new();
        assert_eq!(parser.feed(&encoded).unwrap(), Vec::<Row>::new());
        assert!(parser.finished());
    }
}
