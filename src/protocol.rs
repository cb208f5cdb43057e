//! Wire protocol for server-to-client stream events.
//!
//! Each event is framed as a tag line plus a single JSON payload line,
//! terminated by a blank line:
//!
//! ```text
//! event: text
//! data: {"text":"Hel"}
//!
//! ```
//!
//! The JSON encoder escapes newlines inside string values, so the payload
//! always occupies exactly one line and the double-newline delimiter can
//! never appear inside a frame. [`encode_frame`] emits one frame per event,
//! atomically; [`FrameDecoder`] accepts bytes chunked at arbitrary
//! boundaries and yields complete events, retaining trailing partial frames
//! for the next read.
//!
//! # Event Order
//!
//! Within one turn the relay emits `text`* → `citations`? → `title`? →
//! exactly one of `done` / `error`. The codec itself does not enforce this;
//! it is an invariant of the relay (see [`crate::relay`]).

use serde_json::json;
use tracing::warn;

use crate::models::Citation;

/// A single server-to-client event.
///
/// Closed set of variants; both [`encode_frame`] and the decoder match
/// exhaustively so a new variant cannot be added without updating both
/// sides of the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental piece of answer text, in production order.
    Text { text: String },
    /// The consolidated citation list for the in-progress message.
    Citations { citations: Vec<Citation> },
    /// A late conversation title, generated after the first exchange.
    Title { title: String },
    /// Terminal: the upstream call failed. Previously streamed text stands.
    Error { message: String },
    /// Terminal: the turn completed.
    Done,
}

impl StreamEvent {
    /// The tag written on the `event:` line.
    pub fn tag(&self) -> &'static str {
        match self {
            StreamEvent::Text { .. } => "text",
            StreamEvent::Citations { .. } => "citations",
            StreamEvent::Title { .. } => "title",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }
}

/// Encode one event as a self-delimited frame.
pub fn encode_frame(event: &StreamEvent) -> String {
    let payload = match event {
        StreamEvent::Text { text } => json!({ "text": text }),
        StreamEvent::Citations { citations } => json!({ "citations": citations }),
        StreamEvent::Title { title } => json!({ "title": title }),
        StreamEvent::Error { message } => json!({ "message": message }),
        StreamEvent::Done => json!({}),
    };
    format!("event: {}\ndata: {}\n\n", event.tag(), payload)
}

/// Incremental decoder for the frame protocol.
///
/// Buffers raw bytes across reads, splits on the blank-line delimiter, and
/// parses each complete segment. A frame boundary falling in the middle of
/// a network read is handled by retaining the partial tail; a complete but
/// unparseable segment is dropped with a warning rather than terminating
/// the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return all events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = find_delimiter(&self.buf) {
            let segment: Vec<u8> = self.buf.drain(..pos + 2).collect();
            let segment = &segment[..pos];
            if segment.is_empty() {
                continue;
            }
            match parse_segment(segment) {
                Some(event) => events.push(event),
                None => {
                    warn!(
                        segment = %String::from_utf8_lossy(segment),
                        "dropping unparseable frame segment"
                    );
                }
            }
        }
        events
    }

    /// Bytes held back waiting for a frame delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Parse one complete segment into an event.
///
/// Returns `None` for anything malformed: invalid UTF-8, missing tag or
/// data line, unknown tag, or a payload that does not match the tag's
/// schema. The caller logs and skips; arbitrary chunk boundaries can
/// truncate the final segment of a read, so this must never be fatal.
fn parse_segment(segment: &[u8]) -> Option<StreamEvent> {
    let text = std::str::from_utf8(segment).ok()?;

    let mut tag = None;
    let mut data = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            tag = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = Some(rest);
        }
    }

    let payload: serde_json::Value = serde_json::from_str(data?).ok()?;

    match tag? {
        "text" => Some(StreamEvent::Text {
            text: payload.get("text")?.as_str()?.to_string(),
        }),
        "citations" => {
            let citations: Vec<Citation> =
                serde_json::from_value(payload.get("citations")?.clone()).ok()?;
            Some(StreamEvent::Citations { citations })
        }
        "title" => Some(StreamEvent::Title {
            title: payload.get("title")?.as_str()?.to_string(),
        }),
        "error" => Some(StreamEvent::Error {
            message: payload.get("message")?.as_str()?.to_string(),
        }),
        "done" => Some(StreamEvent::Done),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Text {
                text: "Hello, wörld\n\nwith a fake delimiter".to_string(),
            },
            StreamEvent::Citations {
                citations: vec![
                    Citation {
                        id: 1,
                        source_title: "Reports/Q3 – überblick.pdf".to_string(),
                        source_uri: Some("https://example.sharepoint.com/q3".to_string()),
                        text: Some("data: not a real frame".to_string()),
                    },
                    Citation {
                        id: 2,
                        source_title: "notes.md".to_string(),
                        source_uri: None,
                        text: None,
                    },
                ],
            },
            StreamEvent::Title {
                title: "Q3 numbers".to_string(),
            },
            StreamEvent::Error {
                message: "upstream closed\nmid-stream".to_string(),
            },
            StreamEvent::Done,
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for event in sample_events() {
            let encoded = encode_frame(&event);
            let mut decoder = FrameDecoder::new();
            let decoded = decoder.push(encoded.as_bytes());
            assert_eq!(decoded, vec![event.clone()]);
            // encode(decode(encode(e))) == encode(e)
            assert_eq!(encode_frame(&decoded[0]), encoded);
        }
    }

    #[test]
    fn test_payload_is_single_line() {
        // Newlines in content must be escaped so the frame stays intact.
        let frame = encode_frame(&StreamEvent::Text {
            text: "line1\nline2\n\nline3".to_string(),
        });
        assert_eq!(frame.matches("\n\n").count(), 1);
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_decode_split_at_every_byte_offset() {
        let mut wire = String::new();
        for event in sample_events() {
            wire.push_str(&encode_frame(&event));
        }
        let bytes = wire.as_bytes();

        let mut reference = FrameDecoder::new();
        let expected = reference.push(bytes);
        assert_eq!(expected.len(), sample_events().len());

        for split in 1..bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut got = decoder.push(&bytes[..split]);
            got.extend(decoder.push(&bytes[split..]));
            assert_eq!(got, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_decode_one_byte_at_a_time() {
        let wire = encode_frame(&StreamEvent::Text {
            text: "héllo".to_string(),
        });
        let mut decoder = FrameDecoder::new();
        let mut got = Vec::new();
        for b in wire.as_bytes() {
            got.extend(decoder.push(&[*b]));
        }
        assert_eq!(
            got,
            vec![StreamEvent::Text {
                text: "héllo".to_string()
            }]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_partial_frame_retained() {
        let wire = encode_frame(&StreamEvent::Done);
        let mut decoder = FrameDecoder::new();
        // Everything except the final delimiter byte: no event yet.
        assert!(decoder.push(&wire.as_bytes()[..wire.len() - 1]).is_empty());
        assert!(decoder.pending() > 0);
        let got = decoder.push(&wire.as_bytes()[wire.len() - 1..]);
        assert_eq!(got, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_malformed_segment_skipped() {
        let mut wire = String::from("event: text\ndata: {truncated\n\n");
        wire.push_str(&encode_frame(&StreamEvent::Done));
        let mut decoder = FrameDecoder::new();
        let got = decoder.push(wire.as_bytes());
        assert_eq!(got, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_unknown_tag_skipped() {
        let mut wire = String::from("event: heartbeat\ndata: {}\n\n");
        wire.push_str(&encode_frame(&StreamEvent::Done));
        let mut decoder = FrameDecoder::new();
        let got = decoder.push(wire.as_bytes());
        assert_eq!(got, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_citation_optional_fields_omitted() {
        let frame = encode_frame(&StreamEvent::Citations {
            citations: vec![Citation {
                id: 1,
                source_title: "Doc.pdf".to_string(),
                source_uri: None,
                text: None,
            }],
        });
        assert!(!frame.contains("sourceUri"));
        assert!(frame.contains("sourceTitle"));
    }
}
