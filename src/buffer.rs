//! Growable read buffer for the frame reader

use crate::{
    constants::{BUF_CHUNK, MAX_BUFFER_SIZE},
    error::{EslError, EslResult},
};

/// Byte buffer with a read cursor.
///
/// Consumed bytes stay in place until [`compact`](Self::compact) moves the
/// unread tail to the front.
#[derive(Debug)]
pub(crate) struct EslBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl EslBuffer {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::with_capacity(BUF_CHUNK),
            pos: 0,
        }
    }

    /// Unread bytes.
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.data.capacity() - self.data.len() < bytes.len() {
            self.data
                .reserve(bytes.len().max(BUF_CHUNK));
        }
        self.data
            .extend_from_slice(bytes);
    }

    pub(crate) fn check_size_limits(&self) -> EslResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            return Err(EslError::protocol_error(format!(
                "Read buffer holds {} bytes, limit {}",
                self.len(),
                MAX_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Take everything up to the first blank line and consume the terminator.
    ///
    /// Accepts both `\n\n` and `\r\n\r\n`; the returned block excludes the
    /// terminator.
    pub(crate) fn extract_header_block(&mut self) -> Option<Vec<u8>> {
        let unread = self.remaining();
        let mut i = 0;
        while i < unread.len() {
            if unread[i] == b'\n' {
                let rest = &unread[i + 1..];
                let end = if rest.first() == Some(&b'\n') {
                    Some(i + 2)
                } else if rest.starts_with(b"\r\n") {
                    Some(i + 3)
                } else {
                    None
                };
                if let Some(end) = end {
                    let block = unread[..i].to_vec();
                    self.pos += end;
                    return Some(block);
                }
            }
            i += 1;
        }
        None
    }

    /// Take exactly `n` bytes, or nothing if fewer are buffered.
    pub(crate) fn extract_bytes(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.len() < n {
            return None;
        }
        let bytes = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Some(bytes)
    }

    /// Drop consumed bytes.
    pub(crate) fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        self.data
            .drain(..self.pos);
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_block_lf() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"A: 1\nB: 2\n\nrest");
        assert_eq!(
            buf.extract_header_block()
                .unwrap(),
            b"A: 1\nB: 2".to_vec()
        );
        assert_eq!(buf.remaining(), b"rest");
    }

    #[test]
    fn test_header_block_crlf() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"A: 1\r\nB: 2\r\n\r\nrest");
        assert_eq!(
            buf.extract_header_block()
                .unwrap(),
            b"A: 1\r\nB: 2\r".to_vec()
        );
        assert_eq!(buf.remaining(), b"rest");
    }

    #[test]
    fn test_incomplete_header_block() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"A: 1\n");
        assert!(buf
            .extract_header_block()
            .is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_extract_bytes_and_compact() {
        let mut buf = EslBuffer::new();
        buf.extend_from_slice(b"hello world");
        assert!(buf
            .extract_bytes(20)
            .is_none());
        assert_eq!(
            buf.extract_bytes(5)
                .unwrap(),
            b"hello".to_vec()
        );
        buf.compact();
        assert_eq!(buf.remaining(), b" world");
    }
}
