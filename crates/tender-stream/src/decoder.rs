//! Line-oriented frame decoder for the `data:` event protocol.
//!
//! Bytes are buffered until a newline completes a line, so frames may be split
//! across chunks at any byte (including inside a UTF-8 sequence) and one chunk
//! may carry many frames. Malformed frames are dropped, never surfaced.
use serde_json::error::Category;

use crate::StreamEvent;

pub const FRAME_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const MAX_PENDING_FRAGMENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Default)]
/// Incremental decoder turning raw byte chunks into typed stream events.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Bytes before this offset are known to contain no newline.
    scan_from: usize,
    // Payload that ended mid-object; continuation lines are appended to it.
    pending_fragment: Option<String>,
    terminated: bool,
    dropped_frames: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `done` or `error` event was decoded.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending_fragment.as_ref().map_or(0, String::len)
    }

    pub fn dropped_frames(&self) -> usize {
        self.dropped_frames
    }

    /// Appends `chunk` and returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.terminated {
            return events;
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(chunk);

        let mut line_start = 0;
        let mut cursor = self.scan_from.min(buffer.len());
        while let Some(offset) = buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let line_end = cursor + offset;
            self.decode_line(&buffer[line_start..line_end], &mut events);
            line_start = line_end + 1;
            cursor = line_start;

            if self.terminated {
                self.scan_from = 0;
                return events;
            }
        }

        buffer.drain(..line_start);
        self.scan_from = buffer.len();
        self.buffer = buffer;
        events
    }

    /// Decodes whatever is left once the transport closes.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let remaining = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        if self.terminated {
            return events;
        }

        if !remaining.is_empty() {
            self.decode_line(&remaining, &mut events);
        }
        if let Some(fragment) = self.pending_fragment.take() {
            tracing::warn!(
                bytes = fragment.len(),
                "dropping incomplete stream frame at end of stream"
            );
            self.dropped_frames += 1;
        }
        events
    }

    fn decode_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(error = %error, "dropping stream line with invalid UTF-8");
                self.dropped_frames += 1;
                return;
            }
        };

        if let Some(payload) = line.strip_prefix(FRAME_PREFIX) {
            if let Some(fragment) = self.pending_fragment.take() {
                tracing::warn!(
                    bytes = fragment.len(),
                    "dropping incomplete stream frame superseded by a new frame"
                );
                self.dropped_frames += 1;
            }
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            self.decode_payload(payload.to_string(), events);
            return;
        }

        if let Some(mut fragment) = self.pending_fragment.take() {
            fragment.push('\n');
            fragment.push_str(line);
            self.decode_payload(fragment, events);
            return;
        }

        if !line.trim().is_empty() {
            tracing::trace!(line, "ignoring non-frame stream line");
        }
    }

    fn decode_payload(&mut self, payload: String, events: &mut Vec<StreamEvent>) {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed == DONE_SENTINEL {
            self.emit(StreamEvent::Done { confidence: None }, events);
            return;
        }

        match serde_json::from_str::<StreamEvent>(trimmed) {
            Ok(event) => self.emit(event, events),
            Err(error) if error.classify() == Category::Eof => {
                if payload.len() > MAX_PENDING_FRAGMENT_BYTES {
                    tracing::warn!(
                        bytes = payload.len(),
                        "dropping oversized incomplete stream frame"
                    );
                    self.dropped_frames += 1;
                } else {
                    tracing::trace!(bytes = payload.len(), "re-buffering incomplete frame");
                    self.pending_fragment = Some(payload);
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "dropping malformed stream frame");
                self.dropped_frames += 1;
            }
        }
    }

    fn emit(&mut self, event: StreamEvent, events: &mut Vec<StreamEvent>) {
        if event.is_terminal() {
            self.terminated = true;
            self.pending_fragment = None;
        }
        events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::FrameDecoder;
    use crate::{Citation, StreamEvent};

    fn frames(events: &[StreamEvent]) -> String {
        events
            .iter()
            .map(|event| event.to_frame().expect("frame"))
            .collect()
    }

    fn decode_in_pieces(bytes: &[u8], cuts: &[usize]) -> Vec<StreamEvent> {
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        let mut start = 0;
        for cut in cuts {
            let cut = (*cut).clamp(start, bytes.len());
            events.extend(decoder.feed(&bytes[start..cut]));
            start = cut;
        }
        events.extend(decoder.feed(&bytes[start..]));
        events.extend(decoder.flush());
        events
    }

    #[test]
    fn unit_decodes_many_frames_from_one_chunk() {
        let expected = vec![
            StreamEvent::status("Searching"),
            StreamEvent::content("Hel"),
            StreamEvent::content("lo"),
        ];
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(frames(&expected).as_bytes()), expected);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn unit_retains_partial_line_between_feeds() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"data: {\"type\":\"content\",").is_empty());
        assert!(decoder.buffered_len() > 0);
        assert_eq!(
            decoder.feed(b"\"content\":\"Hi\"}\n"),
            vec![StreamEvent::content("Hi")]
        );
    }

    #[test]
    fn functional_malformed_line_between_content_frames_is_dropped() {
        let raw = concat!(
            "data: {\"type\":\"content\",\"content\":\"a\"}\n",
            "data: {\"type\":\"content\",\"content\":}\n",
            "data: {\"type\":\"content\",\"content\":\"b\"}\n",
        );
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(raw.as_bytes());
        assert_eq!(
            events,
            vec![StreamEvent::content("a"), StreamEvent::content("b")]
        );
        assert_eq!(decoder.dropped_frames(), 1);
        assert!(!decoder.is_terminated());
    }

    #[test]
    fn functional_unknown_type_and_foreign_lines_are_ignored() {
        let raw = concat!(
            ": keep-alive\n",
            "event: message\n",
            "data: {\"type\":\"heartbeat\"}\n",
            "\n",
            "data: {\"type\":\"content\",\"content\":\"ok\"}\n",
        );
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.feed(raw.as_bytes()),
            vec![StreamEvent::content("ok")]
        );
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn functional_terminal_event_makes_later_feeds_no_ops() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(
            concat!(
                "data: {\"type\":\"content\",\"content\":\"x\"}\n",
                "data: {\"type\":\"done\",\"confidence\":0.8}\n",
                "data: {\"type\":\"content\",\"content\":\"late\"}\n",
            )
            .as_bytes(),
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::content("x"),
                StreamEvent::Done {
                    confidence: Some(0.8)
                }
            ]
        );
        assert!(decoder.is_terminated());
        assert!(decoder
            .feed(b"data: {\"type\":\"content\",\"content\":\"y\"}\n")
            .is_empty());
        assert!(decoder.flush().is_empty());
    }

    #[test]
    fn functional_error_event_is_terminal() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"data: {\"type\":\"error\",\"message\":\"boom\"}\ndata: [DONE]\n");
        assert_eq!(events, vec![StreamEvent::error("boom")]);
        assert!(decoder.feed(b"data: [DONE]\n").is_empty());
    }

    #[test]
    fn unit_flush_decodes_unterminated_trailing_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder
            .feed(b"data: {\"type\":\"content\",\"content\":\"tail\"}")
            .is_empty());
        assert_eq!(decoder.flush(), vec![StreamEvent::content("tail")]);
    }

    #[test]
    fn unit_done_sentinel_and_crlf_lines_are_supported() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"data: {\"type\":\"content\",\"content\":\"a\"}\r\n\r\ndata: [DONE]\r\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::content("a"),
                StreamEvent::Done { confidence: None }
            ]
        );
    }

    #[test]
    fn regression_incomplete_payload_is_rebuffered_until_continuation_line() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"data: {\"type\":\"citations\",\"citations\":[\n{\"source\":\"Doc A\",\"similarity\":0.9}]}\n");
        assert_eq!(
            events,
            vec![StreamEvent::Citations {
                citations: vec![Citation::new("Doc A", 0.9)]
            }]
        );
        assert_eq!(decoder.dropped_frames(), 0);
    }

    #[test]
    fn regression_incomplete_payload_is_dropped_when_a_new_frame_starts() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(
            concat!(
                "data: {\"type\":\"content\",\"content\":\"cut\n",
                "data: {\"type\":\"content\",\"content\":\"next\"}\n",
            )
            .as_bytes(),
        );
        assert_eq!(events, vec![StreamEvent::content("next")]);
        assert_eq!(decoder.dropped_frames(), 1);
    }

    #[test]
    fn regression_incomplete_payload_at_end_of_stream_is_dropped() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder
            .feed(b"data: {\"type\":\"content\",\"content\":\"cut\n")
            .is_empty());
        assert!(decoder.flush().is_empty());
        assert_eq!(decoder.dropped_frames(), 1);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn regression_multibyte_text_split_inside_a_code_point() {
        let frame = StreamEvent::content("Größe €").to_frame().expect("frame");
        let bytes = frame.as_bytes();
        let euro = frame.find('€').expect("euro sign") + 1;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bytes[..euro]).is_empty());
        assert_eq!(
            decoder.feed(&bytes[euro..]),
            vec![StreamEvent::content("Größe €")]
        );
    }

    fn arb_event() -> impl Strategy<Value = StreamEvent> {
        prop_oneof![
            "[a-zA-Z .]{0,24}".prop_map(StreamEvent::status),
            "[a-zA-Z0-9 äöü€\"\\\\{}:,]{0,32}".prop_map(StreamEvent::content),
            ("[A-Z][a-z]{0,8}", 0u8..=100).prop_map(|(source, percent)| {
                StreamEvent::Citations {
                    citations: vec![Citation::new(source, f64::from(percent) / 100.0)],
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn property_frame_splitting_does_not_change_decoded_events(
            events in prop::collection::vec(arb_event(), 1..12),
            mut cuts in prop::collection::vec(0usize..2048, 0..24),
        ) {
            let raw = frames(&events);
            cuts.sort_unstable();

            let whole = decode_in_pieces(raw.as_bytes(), &[]);
            let split = decode_in_pieces(raw.as_bytes(), &cuts);
            let bytewise = decode_in_pieces(raw.as_bytes(), &(1..raw.len()).collect::<Vec<_>>());

            prop_assert_eq!(&whole, &events);
            prop_assert_eq!(&split, &events);
            prop_assert_eq!(&bytewise, &events);
        }
    }
}
