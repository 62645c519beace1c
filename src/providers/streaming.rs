use super::codec::{clean_text, WireCodec};
use super::error::ProviderError;
use super::TextStream;
use crate::models::StreamEvent;
use bytes::Bytes;
use futures::ready;
use futures::stream::{Stream, StreamExt};
use pin_project::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream adapter that splits a response byte stream into text lines.
///
/// Bytes are buffered until a `\n` arrives, so a UTF-8 sequence or a JSON
/// payload split across network chunks is reassembled before decoding.
/// A trailing `\r` is stripped. Whatever is left in the buffer when the
/// body ends is emitted as a final line.
#[pin_project]
pub struct LineStream<S> {
    #[pin]
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    finished: bool,
}

impl<S> LineStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

fn bytes_to_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8_lossy(&raw).into_owned()
}

fn split_complete_lines(buffer: &mut Vec<u8>, pending: &mut VecDeque<String>) {
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        pending.push_back(bytes_to_line(line));
    }
}

impl<S, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(line) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => {
                    this.buffer.extend_from_slice(&bytes);
                    split_complete_lines(this.buffer, this.pending);
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => {
                    *this.finished = true;
                    if !this.buffer.is_empty() {
                        let rest = std::mem::take(this.buffer);
                        this.pending.push_back(bytes_to_line(rest));
                    }
                }
            }
        }
    }
}

struct DecodeState<S> {
    lines: S,
    codec: Arc<dyn WireCodec>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
    finished: bool,
}

enum NextLine<E> {
    Cancelled,
    TimedOut(Duration),
    Line(Option<Result<String, E>>),
}

async fn next_line<S, E>(lines: &mut S, idle_timeout: Option<Duration>) -> NextLine<E>
where
    S: Stream<Item = Result<String, E>> + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, lines.next()).await {
            Ok(next) => NextLine::Line(next),
            Err(_) => NextLine::TimedOut(limit),
        },
        None => NextLine::Line(lines.next().await),
    }
}

/// Turn a stream of raw provider lines into a stream of cleaned text deltas.
///
/// - lines the codec does not recognise are skipped without ending the stream
/// - `EndOfStream` ends the output successfully, as does the body closing
/// - a transport error ends the output with that error
/// - the cancellation token is checked before every line; when it fires the
///   output yields `ProviderError::Cancelled` once and ends, dropping the
///   underlying connection
pub fn decode_text_stream<S, E>(
    lines: S,
    codec: Arc<dyn WireCodec>,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
) -> TextStream
where
    S: Stream<Item = Result<String, E>> + Send + Unpin + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    let state = DecodeState {
        lines,
        codec,
        cancel,
        idle_timeout,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => NextLine::Cancelled,
                next = next_line(&mut state.lines, state.idle_timeout) => next,
            };

            match next {
                NextLine::Cancelled => {
                    tracing::debug!("Stream cancelled by caller");
                    state.finished = true;
                    return Some((Err(ProviderError::Cancelled), state));
                }
                NextLine::TimedOut(limit) => {
                    tracing::warn!("No stream data for {:?}, giving up", limit);
                    state.finished = true;
                    return Some((Err(ProviderError::StreamTimeout(limit)), state));
                }
                NextLine::Line(None) => {
                    tracing::debug!("Stream body closed");
                    return None;
                }
                NextLine::Line(Some(Err(e))) => {
                    let err: ProviderError = e.into();
                    tracing::error!("Stream error: {}", err);
                    state.finished = true;
                    return Some((Err(err), state));
                }
                NextLine::Line(Some(Ok(line))) => {
                    let decoded = state.codec.decode_chunk(&line);
                    match decoded {
                        Some(StreamEvent::TextDelta(text)) => {
                            let cleaned = clean_text(&text);
                            if cleaned.is_empty() {
                                continue;
                            }
                            return Some((Ok(cleaned), state));
                        }
                        Some(StreamEvent::EndOfStream) => {
                            tracing::debug!("Stream finished with end marker");
                            return None;
                        }
                        None => continue,
                    }
                }
            }
        }
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::OpenAiCodec;
    use futures::stream;

    fn byte_chunks(chunks: &[&str]) -> impl Stream<Item = Result<Bytes, ProviderError>> {
        let owned: Vec<Result<Bytes, ProviderError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        stream::iter(owned)
    }

    #[tokio::test]
    async fn test_line_stream_reassembles_split_chunks() {
        let lines: Vec<String> = LineStream::new(byte_chunks(&["data: {\"a\"", ":1}\r\n\ndata: [DO", "NE]"]))
            .map(|l| l.unwrap())
            .collect()
            .await;

        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn test_line_stream_keeps_multibyte_char_across_chunks() {
        let text = "data: é\n";
        let bytes = text.as_bytes();
        // split inside the two-byte 'é'
        let first = Bytes::copy_from_slice(&bytes[..7]);
        let second = Bytes::copy_from_slice(&bytes[7..]);
        let inner = stream::iter(vec![Ok::<_, ProviderError>(first), Ok(second)]);

        let lines: Vec<String> = LineStream::new(inner).map(|l| l.unwrap()).collect().await;
        assert_eq!(lines, vec!["data: é"]);
    }

    #[tokio::test]
    async fn test_decode_skips_malformed_lines() {
        let lines = stream::iter(vec![
            Ok::<_, ProviderError>(r#"data: {"choices":[{"delta":{"content":"one"}}]}"#.to_string()),
            Ok("data: {not json".to_string()),
            Ok(": keep-alive".to_string()),
            Ok(r#"data: {"choices":[{"delta":{"content":" two"}}]}"#.to_string()),
        ]);
        let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
        let out: Vec<String> = decode_text_stream(lines, codec, CancellationToken::new(), None)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(out, vec!["one", " two"]);
    }

    #[tokio::test]
    async fn test_decode_keeps_hash_split_from_previous_delta() {
        let lines = stream::iter(
            ["Use C", "#", " for this", "#include <vector>"]
                .iter()
                .map(|d| Ok::<_, ProviderError>(format!(r#"data: {{"choices":[{{"delta":{{"content":"{}"}}}}]}}"#, d)))
                .collect::<Vec<_>>(),
        );
        let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
        let out: Vec<String> = decode_text_stream(lines, codec, CancellationToken::new(), None)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(out.concat(), "Use C# for this#include <vector>");
    }

    #[tokio::test]
    async fn test_decode_stops_at_end_marker() {
        let lines = stream::iter(vec![
            Ok::<_, ProviderError>(r#"data: {"choices":[{"delta":{"content":"kept"}}]}"#.to_string()),
            Ok("data: [DONE]".to_string()),
            Ok(r#"data: {"choices":[{"delta":{"content":"dropped"}}]}"#.to_string()),
        ]);
        let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
        let out: Vec<String> = decode_text_stream(lines, codec, CancellationToken::new(), None)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(out, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_decode_yields_cancelled_once() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let lines = stream::pending::<Result<String, ProviderError>>();
        let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
        let out: Vec<Result<String, ProviderError>> =
            decode_text_stream(lines, codec, cancel, None).collect().await;

        assert_eq!(out.len(), 1);
        assert!(out[0].as_ref().unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_decode_idle_timeout() {
        let lines = stream::pending::<Result<String, ProviderError>>();
        let codec: Arc<dyn WireCodec> = Arc::new(OpenAiCodec::developer());
        let out: Vec<Result<String, ProviderError>> = decode_text_stream(
            lines,
            codec,
            CancellationToken::new(),
            Some(Duration::from_millis(20)),
        )
        .collect()
        .await;

        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(ProviderError::StreamTimeout(_))));
    }
}
