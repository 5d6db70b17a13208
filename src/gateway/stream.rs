//! SSE relay wrapper that meters a streamed reply and settles exactly once.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::UpstreamError;
use super::adapter::UpstreamStream;
use super::metering::Usage;

const TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const TRACKER_TAIL_BYTES: usize = 128 * 1024;

pub type RelayStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Error,
    /// The consumer went away before the upstream finished.
    Aborted,
}

/// What the stream saw by the time it ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub observed_usage: Option<Usage>,
    pub completion_text: String,
    pub bytes_sent: u64,
}

pub type StreamFinisher = Box<dyn FnOnce(StreamSummary) + Send>;

#[derive(Default)]
struct SseTracker {
    buffer: BytesMut,
    observed_usage: Option<Usage>,
    completion_text: String,
}

impl SseTracker {
    fn ingest(&mut self, chunk: &Bytes) {
        self.buffer.extend_from_slice(chunk.as_ref());

        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let event = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);

            let Some(data) = extract_sse_data(event.as_ref()) else {
                continue;
            };
            let trimmed = trim_ascii_whitespace(&data);
            if trimmed == b"[DONE]" || !trimmed.starts_with(b"{") {
                continue;
            }
            let Ok(value) = serde_json::from_slice::<Value>(trimmed) else {
                continue;
            };
            self.observe(&value);
        }

        if self.buffer.len() > TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    fn observe(&mut self, value: &Value) {
        if let Some(usage) = Usage::from_value(value) {
            self.observed_usage = Some(usage);
        }
        let Some(choices) = value.get("choices").and_then(Value::as_array) else {
            return;
        };
        for choice in choices {
            if let Some(text) = choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
            {
                self.completion_text.push_str(text);
            }
        }
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }

    // One forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len() && &buf[idx..idx + 4] == b"\r\n\r\n" {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn extract_sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

struct MeteredState {
    upstream: UpstreamStream,
    tracker: SseTracker,
    bytes_sent: u64,
    finisher: Option<StreamFinisher>,
}

impl MeteredState {
    fn finish(&mut self, end: StreamEnd) {
        let Some(finisher) = self.finisher.take() else {
            return;
        };
        finisher(StreamSummary {
            end,
            observed_usage: self.tracker.observed_usage,
            completion_text: std::mem::take(&mut self.tracker.completion_text),
            bytes_sent: self.bytes_sent,
        });
    }
}

impl Drop for MeteredState {
    fn drop(&mut self) {
        self.finish(StreamEnd::Aborted);
    }
}

/// Relays `upstream` unchanged while metering it. `finisher` runs once: at the end of the
/// stream, on the first upstream error, or when the stream is dropped early.
pub fn metered_stream(upstream: UpstreamStream, finisher: StreamFinisher) -> RelayStream {
    let state = MeteredState {
        upstream,
        tracker: SseTracker::default(),
        bytes_sent: 0,
        finisher: Some(finisher),
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.bytes_sent = state.bytes_sent.saturating_add(chunk.len() as u64);
                state.tracker.ingest(&chunk);
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                state.finish(StreamEnd::Error);
                Err(err)
            }
            None => {
                state.finish(StreamEnd::Completed);
                Ok(None)
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn chunks(parts: &[&'static str]) -> UpstreamStream {
        let items: Vec<Result<Bytes, UpstreamError>> =
            parts.iter().map(|part| Ok(Bytes::from_static(part.as_bytes()))).collect();
        futures_util::stream::iter(items).boxed()
    }

    fn capture() -> (Arc<Mutex<Vec<StreamSummary>>>, StreamFinisher) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |summary| sink.lock().unwrap().push(summary)))
    }

    #[tokio::test]
    async fn accumulates_text_across_split_chunks() {
        let (seen, finisher) = capture();
        let mut stream = metered_stream(
            chunks(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
                "\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\r\n\r\n",
                "data: [DONE]\n\n",
            ]),
            finisher,
        );
        let mut relayed = Vec::new();
        while let Some(chunk) = stream.next().await {
            relayed.extend_from_slice(&chunk.unwrap());
        }
        assert!(relayed.ends_with(b"data: [DONE]\n\n"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].end, StreamEnd::Completed);
        assert_eq!(seen[0].completion_text, "Hello");
        assert_eq!(seen[0].observed_usage, None);
    }

    #[tokio::test]
    async fn reported_usage_wins() {
        let (seen, finisher) = capture();
        let mut stream = metered_stream(
            chunks(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
                "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\n\n",
            ]),
            finisher,
        );
        while stream.next().await.is_some() {}
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0].observed_usage,
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 7
            })
        );
    }

    #[tokio::test]
    async fn drop_before_end_settles_once() {
        let (seen, finisher) = capture();
        let mut stream = metered_stream(
            chunks(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\" never read\"}}]}\n\n",
            ]),
            finisher,
        );
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].end, StreamEnd::Aborted);
        assert_eq!(seen[0].completion_text, "partial");
    }

    #[tokio::test]
    async fn upstream_error_settles_with_what_was_seen() {
        let (seen, finisher) = capture();
        let items: Vec<Result<Bytes, UpstreamError>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n")),
            Err(UpstreamError::transport(500, "stream_broken", "connection reset")),
        ];
        let mut stream = metered_stream(futures_util::stream::iter(items).boxed(), finisher);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_err());
        drop(stream);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].end, StreamEnd::Error);
        assert_eq!(seen[0].completion_text, "a");
    }

    #[test]
    fn delimiter_scan_prefers_earliest_boundary() {
        assert_eq!(find_sse_delimiter(b"a\r\n\r\nb\n\n"), Some((1, 4)));
        assert_eq!(find_sse_delimiter(b"a\n\nb\r\n\r\n"), Some((1, 2)));
        assert_eq!(find_sse_delimiter(b"a\n"), None);
    }
}
