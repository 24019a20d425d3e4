//! Provider stream relay and format normalization.
//!
//! `Transcoder` is a synchronous state machine: raw provider bytes go in,
//! canonical frames (`data: {"choices":[{"delta":{"content":..}}]}`) come out.
//! `relay_stream` drives it (or plain passthrough) from a spawned task that
//! feeds an mpsc channel, so the HTTP body is just the receiving end.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::{
    chat::{DONE_EVENT, encode_delta},
    providers::{NativeEvent, ProviderKind},
    sse::{LineBuffer, data_payload},
};

/// Body stream handed to the HTTP layer
pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

const CHANNEL_CAPACITY: usize = 32;

/// Converts one provider's native stream into canonical frames
#[derive(Debug)]
pub struct Transcoder {
    kind: ProviderKind,
    lines: LineBuffer,
    /// Payload that failed to parse, waiting for its continuation
    carry: Option<String>,
    finished: bool,
}

impl Transcoder {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            lines: LineBuffer::new(),
            carry: None,
            finished: false,
        }
    }

    /// Feed raw bytes, returning the canonical frames completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        self.lines.push(chunk);
        while !self.finished {
            let Some(line) = self.lines.next_line() else {
                break;
            };
            self.process_line(&line, &mut out);
        }
        out
    }

    /// Flush the residual buffer once the upstream has ended
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        if let Some(rest) = self.lines.take_remainder() {
            self.process_line(&rest, &mut out);
        }
        if let Some(fragment) = self.carry.take() {
            warn!(
                provider_kind = ?self.kind,
                fragment_len = fragment.len(),
                "Dropping unparseable stream payload at end of input"
            );
        }
        out
    }

    /// True once the provider's terminal signal (or an in-stream error) was seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<String>) {
        if let Some(fragment) = self.carry.take() {
            let combined = format!("{}{}", fragment, line);
            match self.kind.interpret(&combined) {
                Ok(event) => {
                    self.emit(event, out);
                    return;
                }
                Err(e) => {
                    warn!(
                        provider_kind = ?self.kind,
                        error = %e,
                        "Dropping stream payload that failed to parse after recombination"
                    );
                }
            }
        }

        let Some(payload) = data_payload(line) else {
            return;
        };

        match self.kind.interpret(payload) {
            Ok(event) => self.emit(event, out),
            Err(e) => {
                debug!(error = %e, "Stream payload incomplete, carrying it into the next line");
                self.carry = Some(payload.to_string());
            }
        }
    }

    fn emit(&mut self, event: NativeEvent, out: &mut Vec<String>) {
        match event {
            NativeEvent::Delta(text) => out.push(encode_delta(&text)),
            NativeEvent::Done => {
                out.push(DONE_EVENT.to_string());
                self.finished = true;
            }
            NativeEvent::Abort(reason) => {
                warn!(provider_kind = ?self.kind, reason = %reason, "Provider reported an error mid-stream");
                self.finished = true;
            }
            NativeEvent::Skip => {}
        }
    }
}

/// Relay an upstream body to the caller
///
/// With a transcoder the bytes are normalized; without one they are forwarded
/// untouched. Either way the relay stops when the upstream goes quiet for
/// longer than `idle_timeout`, when `cancel` fires, or when the receiving
/// side is dropped.
pub fn relay_stream<S, E>(
    upstream: S,
    mut transcoder: Option<Transcoder>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> ByteStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Relay cancelled");
                    return;
                }
                _ = tx.closed() => {
                    debug!("Downstream closed, abandoning upstream");
                    return;
                }
                next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
            };

            let frames: Vec<Bytes> = match next {
                Err(_) => {
                    warn!(idle_timeout_ms = idle_timeout.as_millis() as u64, "Upstream stream went idle");
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::TimedOut, "upstream stream idle timeout")))
                        .await;
                    return;
                }
                Ok(None) => {
                    if let Some(transcoder) = transcoder.as_mut() {
                        for frame in transcoder.finish() {
                            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                                return;
                            }
                        }
                    }
                    debug!("Upstream stream ended");
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Upstream stream failed");
                    let _ = tx.send(Err(io::Error::other(e))).await;
                    return;
                }
                Ok(Some(Ok(bytes))) => match transcoder.as_mut() {
                    Some(transcoder) => transcoder.push(&bytes).into_iter().map(Bytes::from).collect(),
                    None => vec![bytes],
                },
            };

            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }

            if transcoder.as_ref().is_some_and(Transcoder::is_finished) {
                return;
            }
        }
    });

    ReceiverStream::new(rx).boxed()
}

/// Cancel `token` as soon as the returned stream is dropped
pub fn cancel_on_drop(inner: ByteStream, token: CancellationToken) -> ByteStream {
    CancelOnDrop {
        inner,
        _guard: token.drop_guard(),
    }
    .boxed()
}

struct CancelOnDrop {
    inner: ByteStream,
    _guard: DropGuard,
}

impl Stream for CancelOnDrop {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn anthropic_stream() -> String {
        [
            r#"event: message_start"#,
            r#"data: {"type":"message_start","message":{"id":"msg_1"}}"#,
            "",
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            "",
            r#"data: {"type":"ping"}"#,
            "",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"The "}}"#,
            "",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"deadline is June 30."}}"#,
            "",
            r#"data: {"type":"message_stop"}"#,
            "",
        ]
        .join("\n")
    }

    fn expected_canonical() -> Vec<String> {
        vec![
            encode_delta("The "),
            encode_delta("deadline is June 30."),
            DONE_EVENT.to_string(),
        ]
    }

    #[test]
    fn test_transcodes_whole_stream() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        let mut out = transcoder.push(anthropic_stream().as_bytes());
        out.extend(transcoder.finish());

        assert_eq!(out, expected_canonical());
        assert!(transcoder.is_finished());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        let mut out = Vec::new();
        for byte in anthropic_stream().as_bytes() {
            out.extend(transcoder.push(std::slice::from_ref(byte)));
        }
        out.extend(transcoder.finish());
        assert_eq!(out, expected_canonical());
    }

    #[test]
    fn test_truncated_line_recombined_with_continuation() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        // The provider broke one JSON payload over two physical lines.
        let input = "data: {\"type\":\"content_block_delta\",\"delta\":{\"te\nxt\":\"Hello\"}}\ndata: {\"type\":\"message_stop\"}\n";
        let out = transcoder.push(input.as_bytes());
        assert_eq!(out, vec![encode_delta("Hello"), DONE_EVENT.to_string()]);
    }

    #[test]
    fn test_unrecoverable_fragment_dropped_without_losing_next_event() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        let input = "data: {\"type\":\"content_block_delta\",\"delta\n\
                     data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"kept\"}}\n";
        let out = transcoder.push(input.as_bytes());
        assert_eq!(out, vec![encode_delta("kept")]);
        assert!(!transcoder.is_finished());
    }

    #[test]
    fn test_residual_buffer_processed_on_finish() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        let out = transcoder.push(br#"data: {"type":"content_block_delta","delta":{"text":"tail"}}"#);
        assert!(out.is_empty());
        assert_eq!(transcoder.finish(), vec![encode_delta("tail")]);
        // No terminal signal was seen, so no [DONE] is invented.
        assert!(!transcoder.is_finished());
    }

    #[test]
    fn test_error_event_closes_without_done() {
        let mut transcoder = Transcoder::new(ProviderKind::Anthropic);
        let input = "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"par\"}}\n\
                     data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\
                     data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"ignored\"}}\n";
        let out = transcoder.push(input.as_bytes());
        assert_eq!(out, vec![encode_delta("par")]);
        assert!(transcoder.is_finished());
        assert!(transcoder.push(b"data: {}\n").is_empty());
    }

    #[test]
    fn test_openai_normalization_strips_extras() {
        let mut transcoder = Transcoder::new(ProviderKind::OpenAiCompatible);
        let input = "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                     data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"logprobs\":null}]}\n\n\
                     : keep-alive\n\n\
                     data: {\"choices\":[],\"usage\":{\"total_tokens\":9}}\n\n\
                     data: [DONE]\n\n";
        let out = transcoder.push(input.as_bytes());
        assert_eq!(out, vec![encode_delta("Hi"), DONE_EVENT.to_string()]);
    }

    async fn collect(stream: ByteStream) -> (String, Option<io::ErrorKind>) {
        let mut stream = stream;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => text.push_str(&String::from_utf8_lossy(&bytes)),
                Err(e) => return (text, Some(e.kind())),
            }
        }
        (text, None)
    }

    #[tokio::test]
    async fn test_relay_passthrough_is_byte_identical() {
        let chunks = vec![
            Ok::<_, io::Error>(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"con")),
            Ok(Bytes::from_static(b"tent\":\"x\"}}]}\n\ndata: [DONE]\n\n")),
        ];
        let relayed = relay_stream(
            stream::iter(chunks),
            None,
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let (text, error) = collect(relayed).await;
        assert_eq!(text, "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n");
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_relay_transcodes_and_stops_at_terminal_event() {
        let raw = anthropic_stream() + "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"late\"}}\n";
        let chunks: Vec<Result<Bytes, io::Error>> = raw
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let relayed = relay_stream(
            stream::iter(chunks),
            Some(Transcoder::new(ProviderKind::Anthropic)),
            Duration::from_secs(5),
            CancellationToken::new(),
        );
        let (text, error) = collect(relayed).await;
        assert_eq!(text, expected_canonical().concat());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_relay_idle_timeout_surfaces_error() {
        let upstream = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"data: [DONE]"))])
            .chain(stream::pending());
        let relayed = relay_stream(upstream, None, Duration::from_millis(50), CancellationToken::new());
        let (text, error) = collect(relayed).await;
        assert_eq!(text, "data: [DONE]");
        assert_eq!(error, Some(io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_relay_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let relayed = relay_stream(
            stream::pending::<Result<Bytes, io::Error>>(),
            None,
            Duration::from_secs(30),
            cancel.clone(),
        );
        cancel.cancel();
        let (text, error) = collect(relayed).await;
        assert!(text.is_empty());
        assert!(error.is_none());
    }

    #[tokio::test]
    async fn test_dropping_body_cancels_token() {
        let token = CancellationToken::new();
        let body = cancel_on_drop(stream::empty().boxed(), token.clone());
        assert!(!token.is_cancelled());
        drop(body);
        assert!(token.is_cancelled());
    }
}
