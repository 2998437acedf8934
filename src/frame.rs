//! Incremental frame parser for agent runtime streams
//!
//! The runtime writes one record per line in the form `data: <json>\n`.
//! Chunks from the transport split records (and UTF-8 sequences) at
//! arbitrary byte offsets, so the parser keeps a carry-over buffer and
//! only decodes lines whose terminator has arrived. Feeding any split of
//! a stream through `push` and then calling `finish` yields exactly the
//! records `parse_complete` yields for the concatenated stream.

use crate::types::FinalResponse;
use serde_json::Value;
use thiserror::Error;

const DATA_PREFIX: &[u8] = b"data:";

/// Frame-level decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A complete line was not valid UTF-8
    #[error("Record is not valid UTF-8")]
    InvalidUtf8,

    /// A complete `data:` line did not contain valid JSON
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// Valid JSON that does not describe a known record shape
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The stream ended with an unterminated record in the buffer
    #[error("Stream ended with {pending} bytes of an unterminated record")]
    Incomplete { pending: usize },
}

/// A decoded runtime record
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Next piece of the answer
    Token { value: String },

    /// Terminal marker carrying the assembled answer
    Final(FinalResponse),

    /// Error reported by the runtime itself
    Error { message: String },

    /// Any other record (heartbeats, runtime telemetry)
    Other { action: Option<String> },
}

/// Outcome of decoding one complete line
pub type FrameResult = std::result::Result<Frame, ParseError>;

/// Per-invocation incremental parser
///
/// Owns its buffer; one parser is created for each invocation and never shared.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already scanned without finding a newline
    scanned: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and decode every line it completes
    ///
    /// A bad line yields an `Err` entry and parsing carries on with the
    /// next line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameResult> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;

        while let Some(offset) = self.buffer[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            if let Some(frame) = decode_line(&self.buffer[start..end]) {
                frames.push(frame);
            }
            start = end + 1;
            cursor = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        frames
    }

    /// Number of buffered bytes waiting for a line terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Close the stream
    ///
    /// Whitespace left over is discarded; anything else is an
    /// unterminated record.
    pub fn finish(&mut self) -> std::result::Result<(), ParseError> {
        let leftover = std::mem::take(&mut self.buffer);
        self.scanned = 0;

        if leftover.iter().all(|b| b.is_ascii_whitespace()) {
            Ok(())
        } else {
            Err(ParseError::Incomplete {
                pending: leftover.len(),
            })
        }
    }
}

/// Decode a whole stream in one pass
pub fn parse_complete(stream: &[u8]) -> std::result::Result<Vec<FrameResult>, ParseError> {
    let mut parser = FrameParser::new();
    let frames = parser.push(stream);
    parser.finish()?;
    Ok(frames)
}

/// Decode one line (without its `\n`); `None` for lines that carry no record
fn decode_line(line: &[u8]) -> Option<FrameResult> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }

    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);

    let payload = match std::str::from_utf8(payload) {
        Ok(payload) => payload,
        Err(_) => return Some(Err(ParseError::InvalidUtf8)),
    };

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(e) => return Some(Err(ParseError::Malformed(e.to_string()))),
    };

    Some(classify(value))
}

/// Map a decoded JSON record to a `Frame`
fn classify(value: Value) -> FrameResult {
    let Value::Object(mut record) = value else {
        return Err(ParseError::InvalidRecord(
            "record must be a JSON object".to_string(),
        ));
    };

    if let Some(message) = record.get("error").and_then(Value::as_str) {
        return Ok(Frame::Error {
            message: message.to_string(),
        });
    }

    let action = record
        .get("action")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = record.remove("data").unwrap_or(Value::Null);

    match action.as_deref() {
        Some("on_new_llm_token") | Some("token") => {
            let value = data
                .pointer("/token/value")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ParseError::InvalidRecord("token record without data.token.value".to_string())
                })?;
            Ok(Frame::Token {
                value: value.to_string(),
            })
        }
        Some("final_response") => serde_json::from_value::<FinalResponse>(data)
            .map(Frame::Final)
            .map_err(|e| ParseError::InvalidRecord(format!("final_response: {}", e))),
        Some("error") => {
            let message = ["message", "content"]
                .iter()
                .find_map(|key| data.get(*key).and_then(Value::as_str))
                .unwrap_or("agent runtime reported an error");
            Ok(Frame::Error {
                message: message.to_string(),
            })
        }
        _ => Ok(Frame::Other { action }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "data: {\"action\":\"on_new_llm_token\",\"data\":{\"token\":{\"sequenceNumber\":0,\"value\":\"It\"}}}\n\n",
        "data: {\"action\":\"on_new_llm_token\",\"data\":{\"token\":{\"sequenceNumber\":1,\"value\":\" is ☀️\"}}}\n\n",
        "data: {\"action\":\"final_response\",\"data\":{\"content\":\"It is ☀️\",\"sessionId\":\"s\",\"type\":\"text\"}}\n\n",
    );

    fn ok_frames(results: Vec<FrameResult>) -> Vec<Frame> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_parse_complete_stream() {
        let frames = ok_frames(parse_complete(STREAM.as_bytes()).unwrap());
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[0],
            Frame::Token {
                value: "It".to_string()
            }
        );
        match &frames[2] {
            Frame::Final(final_response) => assert_eq!(final_response.content, "It is ☀️"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_every_split_point_matches_whole_parse() {
        let bytes = STREAM.as_bytes();
        let expected = parse_complete(bytes).unwrap();

        for split in 0..=bytes.len() {
            let mut parser = FrameParser::new();
            let mut frames = parser.push(&bytes[..split]);
            frames.extend(parser.push(&bytes[split..]));
            parser.finish().unwrap();
            assert_eq!(frames, expected, "split at byte {}", split);
        }
    }

    /// CRLF endings, comments, blank lines, a malformed record, invalid
    /// UTF-8 inside a record and multi-byte text
    fn mixed_stream() -> Vec<u8> {
        let mut stream = b": keep-alive \xff\r\n".to_vec();
        stream.extend_from_slice("data: {\"action\":\"token\",\"data\":{\"token\":{\"value\":\"Il fait\"}}}\r\n\r\n".as_bytes());
        stream.extend_from_slice(b"data: {broken\n");
        stream.extend_from_slice(b"data: {\"x\":\"\xf0\x9f\"}\n");
        stream.extend_from_slice("data:{\"action\":\"token\",\"data\":{\"token\":{\"value\":\" beau ☀️\"}}}\n".as_bytes());
        stream.extend_from_slice(b"event: message\r\n");
        stream.extend_from_slice(b"data: {\"action\":\"final_response\",\"data\":{\"content\":\"ok\"}}\r\n");
        stream
    }

    fn parse_pieces(bytes: &[u8], cuts: &[usize]) -> Vec<FrameResult> {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        let mut start = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            frames.extend(parser.push(&bytes[start..cut]));
            start = cut;
        }
        parser.finish().unwrap();
        frames
    }

    #[test]
    fn test_mixed_stream_every_cut_pair_matches_whole_parse() {
        let bytes = mixed_stream();
        let expected = parse_complete(&bytes).unwrap();
        assert_eq!(expected.len(), 5);
        assert!(matches!(expected[1], Err(ParseError::Malformed(_))));
        assert_eq!(expected[2], Err(ParseError::InvalidUtf8));

        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let frames = parse_pieces(&bytes, &[first, second]);
                assert_eq!(frames, expected, "cuts at {} and {}", first, second);
            }
        }
    }

    #[test]
    fn test_mixed_stream_random_cuts_match_whole_parse() {
        let bytes = mixed_stream();
        let expected = parse_complete(&bytes).unwrap();

        // xorshift64, fixed seed
        let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        for round in 0..500 {
            let count = (next() % 12) as usize;
            let mut cuts: Vec<usize> = (0..count)
                .map(|_| (next() % (bytes.len() as u64 + 1)) as usize)
                .collect();
            cuts.sort_unstable();
            let frames = parse_pieces(&bytes, &cuts);
            assert_eq!(frames, expected, "round {} cuts {:?}", round, cuts);
        }
    }

    #[test]
    fn test_non_data_line_with_invalid_utf8_is_ignored() {
        let mut stream = b": comment \xff\xfe\n".to_vec();
        stream.extend_from_slice(b"id: \xc3\n");
        stream.extend_from_slice(b"data: {\"error\":\"boom\"}\n");

        let results = parse_complete(&stream).unwrap();
        assert_eq!(
            results,
            vec![Ok(Frame::Error {
                message: "boom".to_string()
            })]
        );
    }

    #[test]
    fn test_byte_by_byte_matches_whole_parse() {
        let bytes = STREAM.as_bytes();
        let expected = parse_complete(bytes).unwrap();

        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in bytes {
            frames.extend(parser.push(std::slice::from_ref(byte)));
        }
        parser.finish().unwrap();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_partial_record_stays_buffered() {
        let mut parser = FrameParser::new();
        let frames = parser.push(b"data: {\"action\":\"tok");
        assert!(frames.is_empty());
        assert_eq!(parser.pending(), 20);

        let frames = parser.push(b"en\",\"data\":{\"token\":{\"value\":\"a\"}}}\n");
        assert_eq!(ok_frames(frames), vec![Frame::Token { value: "a".to_string() }]);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_unterminated_record_is_incomplete() {
        let mut parser = FrameParser::new();
        parser.push(b"data: {\"action\":\"token\"}");
        assert_eq!(
            parser.finish(),
            Err(ParseError::Incomplete { pending: 24 })
        );
    }

    #[test]
    fn test_trailing_whitespace_is_not_an_error() {
        let mut parser = FrameParser::new();
        parser.push(b"data: {\"action\":\"heartbeat\"}\n  \r");
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn test_malformed_record_does_not_stop_parsing() {
        let stream = concat!(
            "data: {\"action\":\"token\",\"data\":{\"token\":{\"value\":\"a\"}}}\n",
            "data: {not json}\n",
            "data: {\"action\":\"token\",\"data\":{\"token\":{\"value\":\"b\"}}}\n",
        );

        let results = parse_complete(stream.as_bytes()).unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ParseError::Malformed(_))));
        assert_eq!(
            results[2],
            Ok(Frame::Token {
                value: "b".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_utf8_line_is_isolated() {
        let mut stream = b"data: {\"x\":\"".to_vec();
        stream.extend_from_slice(&[0xff, 0xfe]);
        stream.extend_from_slice(b"\"}\ndata: {\"error\":\"boom\"}\n");

        let results = parse_complete(&stream).unwrap();
        assert_eq!(results[0], Err(ParseError::InvalidUtf8));
        assert_eq!(
            results[1],
            Ok(Frame::Error {
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_crlf_and_non_data_lines() {
        let stream = ": keep-alive\r\nevent: message\r\ndata:{\"action\":\"heartbeat\"}\r\n";
        let frames = ok_frames(parse_complete(stream.as_bytes()).unwrap());
        assert_eq!(
            frames,
            vec![Frame::Other {
                action: Some("heartbeat".to_string())
            }]
        );
    }

    #[test]
    fn test_error_record_shapes() {
        let stream = concat!(
            "data: {\"error\":\"model throttled\",\"action\":\"error\"}\n",
            "data: {\"action\":\"error\",\"data\":{\"content\":\"bad config\"}}\n",
        );
        let frames = ok_frames(parse_complete(stream.as_bytes()).unwrap());
        assert_eq!(
            frames,
            vec![
                Frame::Error {
                    message: "model throttled".to_string()
                },
                Frame::Error {
                    message: "bad config".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_token_without_value_is_invalid() {
        let results =
            parse_complete(b"data: {\"action\":\"on_new_llm_token\",\"data\":{}}\n").unwrap();
        assert!(matches!(results[0], Err(ParseError::InvalidRecord(_))));
    }

    #[test]
    fn test_non_object_record_is_invalid() {
        let results = parse_complete(b"data: [1,2,3]\n").unwrap();
        assert!(matches!(results[0], Err(ParseError::InvalidRecord(_))));
    }
}
