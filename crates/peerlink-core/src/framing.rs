//! Incremental newline framing
//!
//! The relay's fallback stream appends newline-terminated JSON messages to a
//! long-lived HTTP response. Reads can split a message anywhere, so bytes
//! are buffered until a full line is available.

use bytes::{Buf, BytesMut};

/// Newline-delimited frame decoder
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of bytes read from the stream
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete line, without its terminator. Empty lines are skipped.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buf.iter().position(|b| *b == b'\n')?;
            let mut line = self.buf.split_to(pos);
            self.buf.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Drain every complete line currently buffered
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { decoder: self }
    }

    /// Bytes of the incomplete trailing line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Iterator over complete lines; see [`LineDecoder::lines`]
pub struct Lines<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.decoder.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_split_across_many_reads() {
        let mut d = LineDecoder::new();
        let msg = r#"{"type":"OPEN","payload":null}"#;

        for piece in msg.as_bytes().chunks(4) {
            d.feed(piece);
            assert!(d.next_line().is_none());
        }
        d.feed(b"\n{\"type\":");
        assert_eq!(d.next_line().as_deref(), Some(msg));
        assert!(d.next_line().is_none());
        assert_eq!(d.pending(), 8);
    }

    #[test]
    fn test_multiple_lines_one_read() {
        let mut d = LineDecoder::new();
        d.feed(b"a\r\n\nb\nc");
        let lines: Vec<String> = d.lines().collect();
        assert_eq!(lines, vec!["a", "b"]);

        d.feed(b"\n");
        assert_eq!(d.lines().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(d.pending(), 0);
    }
}
