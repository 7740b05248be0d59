//! Newline-delimited JSON-RPC framing.
//!
//! Each message occupies exactly one line. Lines that are not JSON-RPC
//! messages (banners, stray `console.log` output) are surfaced as
//! [`Frame::Diagnostic`] rather than failing the stream.

use crate::error::McpError;
use crate::protocol::{JsonRpcMessage, MessageKind};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(JsonRpcMessage),
    Diagnostic(String),
}

/// Codec turning a byte stream into [`Frame`]s and messages into lines.
#[derive(Debug, Default)]
pub struct MessageFramer {
    /// Bytes of the buffer already scanned for a newline.
    scanned: usize,
    /// Buffer used by [`MessageFramer::feed`].
    pending: BytesMut,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and return every frame it completes.
    ///
    /// For callers that receive bytes themselves instead of using `FramedRead`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(&mut buf) {
            frames.push(frame);
        }
        self.pending = buf;
        frames
    }

    /// Bytes buffered by [`MessageFramer::feed`] that do not yet form a line.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn next_frame(&mut self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            let newline = buf[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = buf.len();
                return None;
            };

            let line = buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let mut line = &line[..line.len() - 1];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let text = String::from_utf8_lossy(line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Some(parse_line(text));
        }
    }
}

fn parse_line(text: &str) -> Frame {
    match serde_json::from_str::<JsonRpcMessage>(text) {
        Ok(message) if message.kind() != MessageKind::Invalid => Frame::Message(message),
        _ => Frame::Diagnostic(text.to_string()),
    }
}

impl Decoder for MessageFramer {
    type Item = Frame;
    type Error = McpError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, McpError> {
        Ok(self.next_frame(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, McpError> {
        if let Some(frame) = self.next_frame(buf) {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            debug!(bytes = buf.len(), "Discarding partial line at end of stream");
            buf.clear();
        }
        self.scanned = 0;
        Ok(None)
    }
}

impl Encoder<JsonRpcMessage> for MessageFramer {
    type Error = McpError;

    fn encode(&mut self, message: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), McpError> {
        let json = serde_json::to_vec(&message)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_messages() -> Vec<JsonRpcMessage> {
        vec![
            JsonRpcMessage::request(1, "tools/list", None),
            JsonRpcMessage::notification("notifications/progress", Some(json!({"p": "é"}))),
            JsonRpcMessage::response(crate::protocol::RequestId::Number(1), json!({"tools": []})),
        ]
    }

    fn encode_all(messages: &[JsonRpcMessage]) -> BytesMut {
        let mut codec = MessageFramer::new();
        let mut out = BytesMut::new();
        for message in messages {
            codec.encode(message.clone(), &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_encode_is_compact_single_line() {
        let out = encode_all(&[JsonRpcMessage::request(3, "ping", None)]);
        assert_eq!(&out[..], b"{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n");
    }

    #[test]
    fn test_any_chunking_yields_same_messages() {
        let messages = sample_messages();
        let bytes = encode_all(&messages);

        for chunk_size in 1..=bytes.len() {
            let mut framer = MessageFramer::new();
            let mut frames = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                frames.extend(framer.feed(chunk));
            }
            let decoded: Vec<_> = frames
                .into_iter()
                .map(|f| match f {
                    Frame::Message(m) => m,
                    Frame::Diagnostic(d) => panic!("unexpected diagnostic {d}"),
                })
                .collect();
            assert_eq!(decoded, messages, "chunk size {chunk_size}");
            assert_eq!(framer.buffered(), 0);
        }
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut framer = MessageFramer::new();
        let frames = framer.feed(b"\r\n   \n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\r\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], Frame::Message(m) if m.method() == Some("x")));
    }

    #[test]
    fn test_non_protocol_lines_are_diagnostics() {
        let mut framer = MessageFramer::new();
        let frames = framer.feed(b"Server listening on stdio\n{\"not\":\"rpc\"}\n[1,2]\n");
        assert_eq!(
            frames,
            vec![
                Frame::Diagnostic("Server listening on stdio".to_string()),
                Frame::Diagnostic("{\"not\":\"rpc\"}".to_string()),
                Frame::Diagnostic("[1,2]".to_string()),
            ]
        );
    }

    #[test]
    fn test_partial_line_held_until_newline() {
        let mut framer = MessageFramer::new();
        assert!(framer.feed(b"{\"jsonrpc\":\"2.0\",").is_empty());
        assert!(framer.buffered() > 0);
        let frames = framer.feed(b"\"method\":\"late\"}\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_decode_eof_discards_partial_line() {
        let mut framer = MessageFramer::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n{\"jsonrpc\""[..]);

        let first = framer.decode_eof(&mut buf).unwrap();
        assert!(matches!(first, Some(Frame::Message(_))));
        assert!(framer.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
