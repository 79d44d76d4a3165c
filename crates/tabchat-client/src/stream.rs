use crate::wire::StreamChunk;
use memchr::memchr;
use serde::{Deserialize, Serialize};
use tabchat_core::{ChatError, ChatResult, Message};
use uuid::Uuid;

/// Prefix of every frame that carries a payload.
pub const DATA_PREFIX: &str = "data: ";

/// Payload that terminates the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Message-lifecycle events emitted while a response streams in.
///
/// For one stream the order is always: at most one `Started`, any number of
/// `Appended`, then exactly one terminal event (`Completed`, `Aborted` or
/// `Failed`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The first frame arrived. The message carries that frame's text and is
    /// still streaming.
    Started {
        /// The new assistant message.
        message: Message,
    },

    /// A later frame arrived. `delta` is the increment only.
    Appended {
        /// Id from the `Started` event.
        message_id: Uuid,
        /// New text only.
        delta: String,
    },

    /// The stream ended; `content` is the full concatenated text.
    Completed {
        /// Id of the finished message.
        message_id: Uuid,
        /// Full concatenated text.
        content: String,
    },

    /// The caller cancelled; `content` is whatever had arrived.
    Aborted {
        /// Id of the interrupted message.
        message_id: Uuid,
        /// Text received before cancellation.
        content: String,
    },

    /// Reading or decoding failed.
    Failed {
        /// Id of the interrupted message.
        message_id: Uuid,
        /// Rendered error.
        error: String,
    },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Aborted { .. } | Self::Failed { .. }
        )
    }
}

/// Incremental decoder for `data: <json>` streams.
///
/// Bytes are buffered across chunks so a frame split over several network
/// reads is decoded only once its newline arrives. Decoding is pure: the
/// same byte sequence yields the same events however it is chunked (apart
/// from the minted message id).
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    message: Option<Message>,
    /// Events decoded from a chunk that later failed; delivered by `fail`.
    pending: Vec<StreamEvent>,
    done: bool,
    finished: bool,
}

impl StreamDecoder {
    /// A decoder that has seen no bytes yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `[DONE]` has been seen. Later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Text accumulated so far.
    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", Message::content)
    }

    /// Feeds one chunk of the response body and returns the events it
    /// completes.
    ///
    /// Malformed frame JSON is an error. Events decoded from the same chunk
    /// before the bad frame are kept and returned by [`StreamDecoder::fail`],
    /// so the caller still sees them ahead of the `Failed` event.
    pub fn feed(&mut self, chunk: &[u8]) -> ChatResult<Vec<StreamEvent>> {
        let mut events = Vec::new();
        if self.done || self.finished {
            return Ok(events);
        }

        self.buffer.extend_from_slice(chunk);
        match self.decode_buffered(&mut events) {
            Ok(()) => Ok(events),
            Err(err) => {
                self.pending = events;
                Err(err)
            }
        }
    }

    /// Ends the stream: flushes a trailing unterminated frame, finalizes the
    /// message and returns the `Completed` event.
    ///
    /// A stream with no frames still completes, with a fresh id and empty
    /// content. Once the decoder is closed this returns no events and the
    /// same finalized message.
    pub fn finish(&mut self) -> ChatResult<(Vec<StreamEvent>, Message)> {
        let mut events = Vec::new();
        if self.finished {
            return Ok((events, self.close()));
        }
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = std::str::from_utf8(&rest)
                .map_err(|e| ChatError::StreamParse(format!("invalid UTF-8 in frame: {e}")))?
                .to_string();
            if let Err(err) = self.process_line(&line, &mut events) {
                self.pending = events;
                return Err(err);
            }
        }

        let message = self.close();
        events.push(StreamEvent::Completed {
            message_id: message.id,
            content: message.content().to_string(),
        });
        Ok((events, message))
    }

    /// Ends the stream on cancellation.
    pub fn abort(&mut self) -> StreamEvent {
        let message = self.close();
        StreamEvent::Aborted {
            message_id: message.id,
            content: message.content().to_string(),
        }
    }

    /// Ends the stream on a read or decode failure.
    ///
    /// Returns any events decoded before the failure, then `Failed`.
    pub fn fail(&mut self, error: &ChatError) -> Vec<StreamEvent> {
        let mut events = std::mem::take(&mut self.pending);
        let message = self.close();
        events.push(StreamEvent::Failed {
            message_id: message.id,
            error: error.to_string(),
        });
        events
    }

    fn decode_buffered(&mut self, events: &mut Vec<StreamEvent>) -> ChatResult<()> {
        let mut consumed = 0;
        while let Some(pos) = memchr(b'\n', &self.buffer[consumed..]) {
            let line_end = consumed + pos;
            let line = std::str::from_utf8(&self.buffer[consumed..line_end])
                .map_err(|e| ChatError::StreamParse(format!("invalid UTF-8 in frame: {e}")))?
                .to_string();
            consumed = line_end + 1;

            self.process_line(&line, events)?;
            if self.done {
                break;
            }
        }
        self.buffer.drain(..consumed);
        Ok(())
    }

    /// Finalizes the message, minting an empty one if no frame arrived.
    /// Repeated calls return the same message.
    fn close(&mut self) -> Message {
        self.finished = true;
        self.buffer.clear();
        let message = self
            .message
            .get_or_insert_with(|| Message::streaming(""));
        message.finish();
        message.clone()
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) -> ChatResult<()> {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            return Ok(());
        }
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return Ok(());
        };

        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.done = true;
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(payload)
            .map_err(|e| ChatError::StreamParse(format!("{e} in frame: {payload}")))?;
        let delta = chunk.into_delta();

        match self.message.as_mut() {
            None => {
                let message = Message::streaming(delta);
                events.push(StreamEvent::Started {
                    message: message.clone(),
                });
                self.message = Some(message);
            }
            Some(message) => {
                if !delta.is_empty() {
                    message.append(&delta);
                    events.push(StreamEvent::Appended {
                        message_id: message.id,
                        delta,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn frame(content: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n")
    }

    /// Events with ids blanked out so runs can be compared.
    fn shape(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                StreamEvent::Started { message } => format!("started:{}", message.content()),
                StreamEvent::Appended { delta, .. } => format!("appended:{delta}"),
                StreamEvent::Completed { content, .. } => format!("completed:{content}"),
                StreamEvent::Aborted { content, .. } => format!("aborted:{content}"),
                StreamEvent::Failed { error, .. } => format!("failed:{error}"),
            })
            .collect()
    }

    fn run(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.feed(chunk).unwrap());
        }
        events.extend(decoder.finish().unwrap().0);
        events
    }

    #[test]
    fn test_basic_sequence() {
        let body = format!("{}{}data: [DONE]\n", frame("A"), frame("B"));
        let events = run(&[body.as_bytes()]);
        assert_eq!(
            shape(&events),
            vec!["started:A", "appended:B", "completed:AB"]
        );
    }

    #[test]
    fn test_same_events_for_every_split_point() {
        let body = format!("{}{}{}data: [DONE]\n", frame("A"), frame("B"), frame("C"));
        let bytes = body.as_bytes();
        let expected = vec!["started:A", "appended:B", "appended:C", "completed:ABC"];

        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(shape(&run(&[head, tail])), expected, "split at {split}");
        }

        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(shape(&run(&single_bytes)), expected);
    }

    #[test]
    fn test_ids_are_consistent_across_events() {
        let body = format!("{}{}", frame("x"), frame("y"));
        let events = run(&[body.as_bytes()]);
        let StreamEvent::Started { message } = &events[0] else {
            panic!("expected Started, got {:?}", events[0]);
        };
        assert!(message.is_streaming());
        for event in &events[1..] {
            match event {
                StreamEvent::Appended { message_id, .. }
                | StreamEvent::Completed { message_id, .. } => assert_eq!(*message_id, message.id),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let body = format!("{}data: [DONE]\n", frame("你好"));
        let bytes = body.as_bytes();
        let split = body.find('你').unwrap() + 1;
        let events = run(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(shape(&events), vec!["started:你好", "completed:你好"]);
    }

    #[test]
    fn test_zero_frames_completes_empty() {
        let mut decoder = StreamDecoder::new();
        let (events, message) = decoder.finish().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Completed {
                message_id,
                content,
            } => {
                assert_eq!(*message_id, message.id);
                assert!(content.is_empty());
            }
            other => panic!("Expected Completed, got {other:?}"),
        }
        assert!(!message.is_streaming());
    }

    #[test]
    fn test_ignores_blank_comment_and_foreign_lines() {
        let body = format!(
            "\n: keep-alive\nevent: message\r\n{}\r\n\n{}",
            frame("A").trim_end(),
            frame("B")
        );
        let events = run(&[body.as_bytes()]);
        assert_eq!(
            shape(&events),
            vec!["started:A", "appended:B", "completed:AB"]
        );
    }

    #[test]
    fn test_done_stops_processing() {
        let body = format!("{}data: [DONE]\n{}", frame("A"), frame("ignored"));
        let mut decoder = StreamDecoder::new();
        let events = decoder.feed(body.as_bytes()).unwrap();
        assert!(decoder.is_done());
        assert_eq!(shape(&events), vec!["started:A"]);
        assert!(decoder.feed(frame("late").as_bytes()).unwrap().is_empty());
        assert_eq!(decoder.content(), "A");
    }

    #[test]
    fn test_trailing_partial_frame_flushed_on_close() {
        let body = format!("{}{}", frame("A"), frame("B").trim_end());
        let events = run(&[body.as_bytes()]);
        assert_eq!(
            shape(&events),
            vec!["started:A", "appended:B", "completed:AB"]
        );
    }

    #[test]
    fn test_empty_first_delta_starts_message() {
        let body = format!(
            "data: {{\"choices\":[{{\"delta\":{{\"role\":\"assistant\"}}}}]}}\n{}{}",
            frame(""),
            frame("Hi")
        );
        let events = run(&[body.as_bytes()]);
        assert_eq!(shape(&events), vec!["started:", "appended:Hi", "completed:Hi"]);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frame("A").as_bytes()).unwrap();
        let err = decoder.feed(b"data: {\"choices\": [\n").unwrap_err();
        assert!(matches!(err, ChatError::StreamParse(_)));

        let events = decoder.fail(&err);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Failed { error, .. } => assert!(error.contains("Stream parse error")),
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_frames_before_malformed_one_in_same_chunk_are_kept() {
        let mut decoder = StreamDecoder::new();
        let body = format!("{}data: {{not json}}\n", frame("A"));
        let err = decoder.feed(body.as_bytes()).unwrap_err();
        assert!(matches!(err, ChatError::StreamParse(_)));

        let events = decoder.fail(&err);
        assert_eq!(events.len(), 2);
        assert_eq!(shape(&events[..1]), vec!["started:A"]);

        let StreamEvent::Started { message } = &events[0] else {
            panic!("expected Started, got {:?}", events[0]);
        };
        assert_eq!(
            events[1],
            StreamEvent::Failed {
                message_id: message.id,
                error: err.to_string(),
            }
        );
    }

    #[test]
    fn test_finish_twice_does_not_complete_again() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frame("A").as_bytes()).unwrap();
        let (events, first) = decoder.finish().unwrap();
        assert_eq!(events.len(), 1);

        let (events, second) = decoder.finish().unwrap();
        assert!(events.is_empty());
        assert_eq!(second.id, first.id);
        assert_eq!(second.content(), "A");
    }

    #[test]
    fn test_finish_twice_without_frames_keeps_one_id() {
        let mut decoder = StreamDecoder::new();
        let (_, first) = decoder.finish().unwrap();
        let (events, second) = decoder.finish().unwrap();
        assert!(events.is_empty());
        assert_eq!(second.id, first.id);
    }

    #[test]
    fn test_abort_keeps_partial_content() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(frame("par").as_bytes()).unwrap();
        decoder.feed(frame("tial").as_bytes()).unwrap();
        match decoder.abort() {
            StreamEvent::Aborted { content, .. } => assert_eq!(content, "partial"),
            other => panic!("Expected Aborted, got {other:?}"),
        }
        assert!(decoder.feed(frame("more").as_bytes()).unwrap().is_empty());
    }
}
