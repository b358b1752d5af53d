//! Line-at-a-time view over a received message body
//!
//! Sync messages are card lines interleaved with length-prefixed raw
//! payloads. The reader hands out lines as UTF-8 and payloads as raw
//! bytes, tracking one position through the buffer.

use thiserror::Error;

/// Reader errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("line {0} is not valid UTF-8")]
    BadLine(usize),
    #[error("truncated payload: wanted {wanted} bytes, {remaining} left")]
    TruncatedPayload { wanted: usize, remaining: usize },
    #[error("missing payload terminator")]
    MissingTerminator,
}

/// Sequential reader over one message body.
pub struct LineReader<'a> {
    buf: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> LineReader<'a> {
    /// Create a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, line: 0 }
    }

    /// Next card line without its newline; `None` at end of body.
    ///
    /// A final line without a trailing newline is still returned.
    pub fn next_line(&mut self) -> Result<Option<&'a str>, ReadError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        self.line += 1;
        let rest = &self.buf[self.pos..];
        let (raw, advance) = match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => (&rest[..nl], nl + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        std::str::from_utf8(raw)
            .map(Some)
            .map_err(|_| ReadError::BadLine(self.line))
    }

    /// Read an exact-length raw payload followed by its `\n` terminator.
    pub fn read_payload(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < len {
            return Err(ReadError::TruncatedPayload {
                wanted: len,
                remaining,
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        if self.buf.get(self.pos) != Some(&b'\n') {
            return Err(ReadError::MissingTerminator);
        }
        self.pos += 1;
        Ok(out)
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_and_payload() {
        let body = b"file abcd 5\nhel\no\nigot ffff\n";
        let mut r = LineReader::new(body);
        assert_eq!(r.next_line().unwrap(), Some("file abcd 5"));
        assert_eq!(r.read_payload(5).unwrap(), b"hel\no");
        assert_eq!(r.next_line().unwrap(), Some("igot ffff"));
        assert_eq!(r.next_line().unwrap(), None);
    }

    #[test]
    fn test_truncated_payload() {
        let mut r = LineReader::new(b"file abcd 10\nshort\n");
        r.next_line().unwrap();
        assert!(matches!(
            r.read_payload(10),
            Err(ReadError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_payload_needs_terminator() {
        let mut r = LineReader::new(b"xyzzy");
        assert_eq!(r.read_payload(5), Err(ReadError::MissingTerminator));
    }

    #[test]
    fn test_final_line_without_newline() {
        let mut r = LineReader::new(b"# timestamp 123");
        assert_eq!(r.next_line().unwrap(), Some("# timestamp 123"));
        assert_eq!(r.next_line().unwrap(), None);
    }

    #[test]
    fn test_non_utf8_line() {
        let mut r = LineReader::new(&[0xff, 0xfe, b'\n']);
        assert_eq!(r.next_line(), Err(ReadError::BadLine(1)));
    }
}
