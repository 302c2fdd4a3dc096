use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt, stream};
use tracing::debug;

use super::{ChatStream, TransportError};
use crate::model::ChatStreamChunk;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug)]
pub enum SseEvent {
    Chunk(ChatStreamChunk),
    Done,
}

/// Splits a byte stream into `data:` lines, holding partial lines (and
/// partial UTF-8 sequences) until their `\n` arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parses whatever is left once the body ends without a final newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let Ok(line) = std::str::from_utf8(raw) else {
        debug!(len = raw.len(), "skipping non-UTF-8 stream line");
        return None;
    };
    let line = line.trim_end_matches(['\n', '\r']);
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    if payload.trim() == DONE_SENTINEL {
        return Some(SseEvent::Done);
    }

    match serde_json::from_str::<ChatStreamChunk>(payload) {
        Ok(chunk) => Some(SseEvent::Chunk(chunk)),
        Err(err) => {
            debug!(error = %err, payload_len = payload.len(), "skipping malformed stream chunk");
            None
        }
    }
}

struct DecodeState<S> {
    body: std::pin::Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    eof: bool,
    done: bool,
}

/// Turns a response body into chunks. Ends on `[DONE]`, on the first chunk
/// carrying a finish reason, or when the body ends.
pub fn decode_stream<S, B, E>(body: S) -> ChatStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        eof: false,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            if let Some(event) = state.pending.pop_front() {
                match event {
                    SseEvent::Done => {
                        state.done = true;
                        return None;
                    }
                    SseEvent::Chunk(chunk) => {
                        if chunk.finish_reason().is_some() {
                            state.done = true;
                        }
                        return Some((Ok(chunk), state));
                    }
                }
            }

            if state.eof {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(bytes.as_ref());
                    state.pending.extend(events);
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(TransportError::Stream(err.to_string())), state));
                }
                None => {
                    state.eof = true;
                    if let Some(event) = state.decoder.finish() {
                        state.pending.push_back(event);
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt, stream};

    use super::{SseDecoder, SseEvent, decode_stream};
    use crate::transport::{ChatStream, TransportError};

    fn body(parts: &[&[u8]]) -> ChatStream {
        let items: Vec<Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|part| Ok(part.to_vec())).collect();
        decode_stream(stream::iter(items))
    }

    async fn collect_text(mut chunks: ChatStream) -> (String, usize) {
        let mut text = String::new();
        let mut count = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.expect("stream should not error");
            text.push_str(&chunk.delta_content());
            count += 1;
        }
        (text, count)
    }

    #[tokio::test]
    async fn single_delta_then_done_yields_text() {
        let chunks = body(&[
            br#"data: {"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}
"#,
            b"data: [DONE]\n",
        ]);
        let (text, count) = collect_text(chunks).await;
        assert_eq!(text, "Hi");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn event_split_across_reads_is_reassembled() {
        let chunks = body(&[
            b"data: {\"choices\":[{\"delta\":{\"con",
            b"tent\":\"Hel\"}}]}\ndata: {\"choices\":[{\"delta\":",
            b"{\"content\":\"lo\"}}]}\n\ndata: [DO",
            b"NE]\n",
        ]);
        let (text, count) = collect_text(chunks).await;
        assert_eq!(text, "Hello");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn multibyte_character_split_across_reads_survives() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').expect("accent present") + 1;
        let chunks = body(&[&bytes[..split], &bytes[split..], b"data: [DONE]\n"]);
        let (text, _) = collect_text(chunks).await;
        assert_eq!(text, "caf\u{e9}");
    }

    #[tokio::test]
    async fn malformed_and_non_data_lines_are_skipped() {
        let chunks = body(&[
            b": keep-alive\n",
            b"event: message\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]\n",
            b"\r\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\r\n",
            b"data: [DONE]\r\n",
        ]);
        let (text, count) = collect_text(chunks).await;
        assert_eq!(text, "B");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn finish_reason_ends_the_stream() {
        let chunks = body(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello!\"},\"finish_reason\":\"stop\"}]}\n",
            b"data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        ]);
        let (text, count) = collect_text(chunks).await;
        assert_eq!(text, "Hello!");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn done_ends_the_stream_before_later_lines() {
        let chunks = body(&[
            b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
        ]);
        let (text, count) = collect_text(chunks).await;
        assert_eq!(text, "");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_parsed_at_eof() {
        let chunks = body(&[b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"]);
        let (text, _) = collect_text(chunks).await;
        assert_eq!(text, "tail");
    }

    #[tokio::test]
    async fn body_error_is_surfaced_and_ends_the_stream() {
        let items: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n".to_vec()),
            Err(std::io::Error::other("connection reset")),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n".to_vec()),
        ];
        let mut chunks = decode_stream(stream::iter(items));

        let first = chunks.next().await.expect("first item");
        assert_eq!(first.expect("first chunk ok").delta_content(), "x");
        let second = chunks.next().await.expect("second item");
        match second {
            Err(TransportError::Stream(message)) => assert!(message.contains("connection reset")),
            other => panic!("unexpected item: {other:?}"),
        }
        assert!(chunks.next().await.is_none());
    }

    #[test]
    fn decoder_holds_partial_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DO").is_empty());
        let events = decoder.push(b"NE]\n");
        assert!(matches!(events.as_slice(), [SseEvent::Done]));
        assert!(decoder.finish().is_none());
    }
}
