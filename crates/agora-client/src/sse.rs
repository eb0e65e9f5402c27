//! Incremental decoder for `text/event-stream` turn frames.
//!
//! A frame is a run of field lines terminated by a blank line. Every `data:`
//! line of a frame contributes one line of the payload. Decoding is pure and
//! restartable: feeding `remainder + new_bytes` back in produces the same
//! frames no matter where the stream was split.

use serde_json::{json, Value};

const DATA_FIELD: &str = "data";
const EVENT_FIELD: &str = "event";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// One blank-line delimited frame of the turn stream.
pub struct RawFrame {
    pub event: Option<String>,
    pub data: String,
}

impl RawFrame {
    /// Parsed payload. Data that is not JSON degrades to a chunk payload so a
    /// malformed frame never aborts the stream.
    pub fn payload(&self) -> Value {
        match serde_json::from_str::<Value>(&self.data) {
            Ok(value) => value,
            Err(_) => json!({ "type": "chunk", "delta": self.data }),
        }
    }
}

#[derive(Default)]
struct FrameBuilder<'a> {
    event: Option<&'a str>,
    data: Vec<&'a str>,
}

impl<'a> FrameBuilder<'a> {
    fn push_line(&mut self, line: &'a str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            DATA_FIELD => self.data.push(value),
            EVENT_FIELD => self.event = Some(value),
            _ => {}
        }
    }

    fn finish(&mut self) -> Option<RawFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let frame = RawFrame {
            event: event.map(str::to_string),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(frame)
    }
}

fn trim_line_ending(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Splits `buffer` into complete frames and the unterminated remainder.
pub fn decode_frames(buffer: &str) -> (Vec<RawFrame>, String) {
    let mut frames = Vec::new();
    let mut builder = FrameBuilder::default();
    let mut consumed = 0;
    let mut cursor = 0;

    while let Some(offset) = buffer[cursor..].find('\n') {
        let line_end = cursor + offset;
        let line = trim_line_ending(&buffer[cursor..line_end]);
        cursor = line_end + 1;

        if line.is_empty() {
            frames.extend(builder.finish());
            consumed = cursor;
        } else {
            builder.push_line(line);
        }
    }

    (frames, buffer[consumed..].to_string())
}

/// End-of-stream decode: complete frames plus whatever the unterminated tail
/// holds, treated as a final frame.
pub fn flush_frames(buffer: &str) -> Vec<RawFrame> {
    let (mut frames, remainder) = decode_frames(buffer);
    let mut builder = FrameBuilder::default();
    for line in remainder.split('\n').map(trim_line_ending) {
        if !line.is_empty() {
            builder.push_line(line);
        }
    }
    frames.extend(builder.finish());
    frames
}

#[derive(Debug, Default)]
/// Stateful wrapper over [`decode_frames`] that accepts raw body chunks.
///
/// A multi-byte UTF-8 sequence split across chunks is held back until it is
/// complete; invalid bytes become U+FFFD.
pub struct FrameDecoder {
    text: String,
    pending_bytes: Vec<u8>,
    /// Bytes of `text` already searched for a frame boundary.
    scanned: usize,
    /// Start of the line containing `scanned`.
    line_start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.append_utf8(chunk);
        self.drain_complete()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<RawFrame> {
        self.text.push_str(chunk);
        self.drain_complete()
    }

    /// Unterminated text waiting for more input.
    pub fn remainder(&self) -> &str {
        &self.text
    }

    pub fn finish(&mut self) -> Vec<RawFrame> {
        if !self.pending_bytes.is_empty() {
            self.text
                .push_str(&String::from_utf8_lossy(&self.pending_bytes));
            self.pending_bytes.clear();
        }
        let buffer = std::mem::take(&mut self.text);
        self.scanned = 0;
        self.line_start = 0;
        flush_frames(&buffer)
    }

    /// Decodes up to the last blank line. Only text appended since the
    /// previous call is searched, so a long frame arriving in small chunks
    /// is scanned once.
    fn drain_complete(&mut self) -> Vec<RawFrame> {
        let Some(end) = self.last_frame_boundary() else {
            return Vec::new();
        };
        let (frames, _) = decode_frames(&self.text[..end]);
        self.text.drain(..end);
        self.scanned -= end;
        self.line_start -= end;
        frames
    }

    fn last_frame_boundary(&mut self) -> Option<usize> {
        let bytes = self.text.as_bytes();
        let mut boundary = None;
        for (index, byte) in bytes.iter().enumerate().skip(self.scanned) {
            if *byte != b'\n' {
                continue;
            }
            let line = &bytes[self.line_start..index];
            if line.is_empty() || line == b"\r" {
                boundary = Some(index + 1);
            }
            self.line_start = index + 1;
        }
        self.scanned = bytes.len();
        boundary
    }

    fn append_utf8(&mut self, chunk: &[u8]) {
        self.pending_bytes.extend_from_slice(chunk);
        let mut start = 0;
        loop {
            match std::str::from_utf8(&self.pending_bytes[start..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending_bytes.clear();
                    return;
                }
                Err(error) => {
                    let valid_up_to = start + error.valid_up_to();
                    self.text.push_str(
                        std::str::from_utf8(&self.pending_bytes[start..valid_up_to])
                            .unwrap_or_default(),
                    );
                    match error.error_len() {
                        Some(invalid_len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            start = valid_up_to + invalid_len;
                        }
                        None => {
                            self.pending_bytes.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::{decode_frames, flush_frames, FrameDecoder, RawFrame};

    fn data_frame(data: &str) -> RawFrame {
        RawFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_single_frame_and_keeps_unterminated_tail() {
        let (frames, remainder) = decode_frames("data: {\"type\":\"chunk\"}\n\ndata: par");
        assert_eq!(frames, vec![data_frame("{\"type\":\"chunk\"}")]);
        assert_eq!(remainder, "data: par");
    }

    #[test]
    fn multi_line_frame_joins_data_lines_with_newline() {
        let (frames, remainder) = decode_frames("data: foo\ndata: bar\n\n");
        assert_eq!(frames, vec![data_frame("foo\nbar")]);
        assert!(remainder.is_empty());
    }

    #[test]
    fn empty_buffer_yields_no_frames_and_empty_remainder() {
        let (frames, remainder) = decode_frames("");
        assert!(frames.is_empty());
        assert_eq!(remainder, "");
    }

    #[test]
    fn malformed_payload_degrades_to_chunk() {
        let (frames, _) = decode_frames("data: not-json\n\n");
        assert_eq!(
            frames[0].payload(),
            json!({ "type": "chunk", "delta": "not-json" })
        );
    }

    #[test]
    fn crlf_line_endings_decode_like_lf() {
        let (crlf, crlf_rest) = decode_frames("data: a\r\ndata: b\r\n\r\ndata: c\r\n");
        let (lf, lf_rest) = decode_frames("data: a\ndata: b\n\ndata: c\n");
        assert_eq!(crlf, lf);
        assert_eq!(crlf_rest.replace('\r', ""), lf_rest);
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored_and_event_name_is_kept() {
        let (frames, _) = decode_frames(": keep-alive\n\nevent: turn\nid: 7\ndata:{\"x\":1}\n\n");
        assert_eq!(
            frames,
            vec![RawFrame {
                event: Some("turn".to_string()),
                data: "{\"x\":1}".to_string(),
            }]
        );
    }

    #[test]
    fn only_one_leading_space_is_stripped_from_data() {
        let (frames, _) = decode_frames("data:   padded\n\n");
        assert_eq!(frames, vec![data_frame("  padded")]);
    }

    #[test]
    fn flush_emits_unterminated_final_frame() {
        let frames = flush_frames("data: one\n\ndata: two");
        assert_eq!(frames, vec![data_frame("one"), data_frame("two")]);
        assert!(flush_frames("").is_empty());
        assert!(flush_frames(": comment only").is_empty());
    }

    #[test]
    fn decoder_holds_split_utf8_sequences() {
        let encoded = "data: héllo\n\n".as_bytes();
        let split = encoded
            .iter()
            .position(|byte| *byte == 0xC3)
            .expect("multi-byte lead")
            + 1;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_bytes(&encoded[..split]).is_empty());
        let frames = decoder.push_bytes(&encoded[split..]);
        assert_eq!(frames, vec![data_frame("héllo")]);
        assert_eq!(decoder.remainder(), "");
    }

    #[test]
    fn regression_invalid_utf8_is_replaced_instead_of_failing() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push_bytes(b"data: a\xFFb\n\n");
        assert_eq!(frames, vec![data_frame("a\u{FFFD}b")]);
    }

    #[test]
    fn decoder_finish_flushes_tail_and_resets() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push_str("data: tail").is_empty());
        assert_eq!(decoder.finish(), vec![data_frame("tail")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn regression_long_frame_in_small_chunks_decodes_once_complete() {
        let payload = "x".repeat(4096);
        let stream = format!("data: {payload}\r\ndata: end\r\n\r\ndata: next\n");

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in stream.as_bytes() {
            frames.extend(decoder.push_bytes(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![data_frame(&format!("{payload}\nend"))]);
        assert_eq!(decoder.remainder(), "data: next\n");
        assert_eq!(decoder.scanned, decoder.remainder().len());
        assert_eq!(decoder.finish(), vec![data_frame("next")]);
    }

    fn build_stream(frames: &[Vec<String>]) -> String {
        let mut stream = String::new();
        for lines in frames {
            for line in lines {
                stream.push_str("data: ");
                stream.push_str(line);
                stream.push('\n');
            }
            stream.push('\n');
        }
        stream
    }

    proptest! {
        #[test]
        fn property_decode_is_invariant_under_arbitrary_byte_splits(
            frames in prop::collection::vec(
                prop::collection::vec("[a-z0-9é😀 {}\":,]{0,10}", 1..3),
                0..6,
            ),
            cuts in prop::collection::vec(any::<usize>(), 0..8),
        ) {
            let stream = build_stream(&frames);
            let bytes = stream.as_bytes();

            let one_shot = flush_frames(&stream);

            let mut points = cuts
                .iter()
                .map(|cut| if bytes.is_empty() { 0 } else { cut % (bytes.len() + 1) })
                .collect::<Vec<_>>();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();

            let mut decoder = FrameDecoder::new();
            let mut incremental = Vec::new();
            for window in points.windows(2) {
                incremental.extend(decoder.push_bytes(&bytes[window[0]..window[1]]));
            }
            incremental.extend(decoder.finish());

            prop_assert_eq!(incremental, one_shot);
        }

        #[test]
        fn property_remainder_round_trip_matches_one_shot(
            text in "(data: [a-z]{0,4}\n|\n|: c\n){0,12}",
            split in any::<usize>(),
        ) {
            let split = split % (text.len() + 1);
            let (mut frames, remainder) = decode_frames(&text[..split]);
            let (rest, tail) = decode_frames(&format!("{remainder}{}", &text[split..]));
            frames.extend(rest);

            let (expected, expected_tail) = decode_frames(&text);
            prop_assert_eq!(frames, expected);
            prop_assert_eq!(tail, expected_tail);
        }
    }
}
