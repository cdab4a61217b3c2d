use mcp_types::Message;
use tracing::warn;

/// Accumulates bytes off a framed transport and extracts complete,
/// LF-terminated JSON-RPC messages.
///
/// Not internally synchronized: the caller guarantees a `ReadBuffer` is
/// driven from a single task at a time.
#[derive(Default)]
pub struct ReadBuffer {
    buf: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to the internal buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drains the next complete line's raw bytes (terminator stripped), or
    /// `None` if no LF is buffered yet. Distinguishes "no newline yet" (outer
    /// `None`) from "newline found but the line is empty" (`Some(None)`) so
    /// callers that need to keep scanning past a blank line can do so.
    fn take_line(&mut self) -> Option<Option<String>> {
        let newline_pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line_bytes: Vec<u8> = self.buf.drain(..=newline_pos).collect();
        line_bytes.pop(); // drop the '\n'
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.pop();
        }
        let line = String::from_utf8_lossy(&line_bytes).into_owned();
        if line.is_empty() {
            Some(None)
        } else {
            Some(Some(line))
        }
    }

    /// Returns the next complete line (sans terminator), or `None` if no LF
    /// is buffered yet. A line consisting only of CR is trimmed; an isolated
    /// leading LF is consumed and yields `None` for that call since the line
    /// it terminates is empty.
    pub fn read_line(&mut self) -> Option<String> {
        self.take_line()?
    }

    /// Returns the next successfully decoded message, or `None` if no
    /// complete line is buffered yet. On decode failure, attempts one
    /// recovery by seeking the first `{` in the line; if that also fails the
    /// line is discarded and a warning is logged. Blank lines (including an
    /// isolated leading LF) are skipped rather than treated as end-of-buffer.
    pub fn read_message(&mut self) -> Option<Message> {
        loop {
            let line = match self.take_line()? {
                Some(line) => line,
                None => continue,
            };
            match Message::from_json_str(&line) {
                Ok(message) => return Some(message),
                Err(first_err) => {
                    if let Some(brace) = line.find('{') {
                        match Message::from_json_str(&line[brace..]) {
                            Ok(message) => return Some(message),
                            Err(_) => {
                                warn!("discarding unparsable line: {first_err}");
                                continue;
                            }
                        }
                    }
                    warn!("discarding unparsable line: {first_err}");
                    continue;
                }
            }
        }
    }

    /// Drops all buffered data.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::Message;

    fn encode_line(msg: &Message) -> String {
        format!("{}\n", msg.to_json_string().unwrap())
    }

    #[test]
    fn reassembles_messages_split_across_arbitrary_chunks() {
        let messages: Vec<Message> = (0..5)
            .map(|i| Message::request(i, "ping", None))
            .collect();
        let mut wire = String::new();
        for m in &messages {
            wire.push_str(&encode_line(m));
        }
        let bytes = wire.into_bytes();

        let mut buf = ReadBuffer::new();
        let mut decoded = Vec::new();
        // Feed the wire data in uneven 3-byte chunks.
        for chunk in bytes.chunks(3) {
            buf.append(chunk);
            while let Some(msg) = buf.read_message() {
                decoded.push(msg);
            }
        }

        assert_eq!(decoded, messages);
    }

    #[test]
    fn recovers_from_non_json_prefix() {
        let mut buf = ReadBuffer::new();
        buf.append(b"garbage-prefix {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");
        let msg = buf.read_message().expect("should recover a message");
        assert!(matches!(msg, Message::Response(_)));
    }

    #[test]
    fn discards_fully_unparsable_line_and_continues() {
        let mut buf = ReadBuffer::new();
        buf.append(b"not json at all, no braces\n");
        buf.append(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n");
        let msg = buf.read_message().expect("second line should decode");
        assert_eq!(msg.id().unwrap(), &mcp_types::RequestId::Number(2));
    }

    #[test]
    fn read_line_returns_none_with_no_newline_buffered() {
        let mut buf = ReadBuffer::new();
        buf.append(b"partial line without terminator");
        assert!(buf.read_line().is_none());
    }

    #[test]
    fn isolated_leading_newline_yields_none() {
        let mut buf = ReadBuffer::new();
        buf.append(b"\n");
        assert!(buf.read_line().is_none());
    }

    #[test]
    fn clear_drops_buffered_data() {
        let mut buf = ReadBuffer::new();
        buf.append(b"partial");
        buf.clear();
        buf.append(b" line\n");
        assert_eq!(buf.read_line().as_deref(), Some(" line"));
    }
}
