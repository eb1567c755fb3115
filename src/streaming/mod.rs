//! Streaming plumbing: SSE inspection, live fan-out, and cached replay.
//!
//! A streaming leader tees upstream chunks to every attached client through
//! a [`StreamBroadcaster`] while recording `(delay, chunk)` tuples; a
//! complete transcript becomes a cache entry and is later replayed with
//! clamped pacing. Partial transcripts are never cached.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{cache::TranscriptChunk, providers::ProviderError};

/// Broadcast channel capacity per live stream. A follower that lags this
/// far behind the leader is failed rather than stalling the fan-out.
const FANOUT_CAPACITY: usize = 1024;

// ============================================================================
// SSE inspection
// ============================================================================

/// True when the chunk carries the `data: [DONE]` terminator.
pub fn chunk_contains_done(chunk: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(chunk) else {
        return false;
    };
    text.lines()
        .any(|line| line.strip_prefix("data:").is_some_and(|d| d.trim() == "[DONE]"))
}

/// Extract `(prompt_tokens, completion_tokens)` from the usage object some
/// providers send in the final chunk before `[DONE]`.
pub fn extract_chunk_usage(chunk: &[u8]) -> Option<(i64, i64)> {
    let text = std::str::from_utf8(chunk).ok()?;
    for line in text.lines() {
        let Some(json_str) = line.strip_prefix("data: ") else {
            continue;
        };
        if json_str.trim() == "[DONE]" {
            continue;
        }
        let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) else {
            continue;
        };
        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            let prompt = usage
                .get("prompt_tokens")
                .or_else(|| usage.get("input_tokens"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .or_else(|| usage.get("output_tokens"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            return Some((prompt, completion));
        }
    }
    None
}

/// Scan a complete transcript for the last usage report.
pub fn extract_transcript_usage(chunks: &[TranscriptChunk]) -> Option<(i64, i64)> {
    chunks
        .iter()
        .rev()
        .find_map(|chunk| extract_chunk_usage(&chunk.bytes))
}

/// True when the transcript ends with the `[DONE]` terminator, i.e. the
/// upstream stream completed.
pub fn transcript_is_complete(chunks: &[TranscriptChunk]) -> bool {
    chunks
        .iter()
        .rev()
        .any(|chunk| chunk_contains_done(&chunk.bytes))
}

/// True when any delta in the transcript carries a tool call. Tool-calling
/// responses are stateful and excluded from caching.
pub fn transcript_has_tool_call(chunks: &[TranscriptChunk]) -> bool {
    chunks.iter().any(|chunk| {
        let Ok(text) = std::str::from_utf8(&chunk.bytes) else {
            return false;
        };
        text.lines().any(|line| {
            line.strip_prefix("data: ")
                .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
                .and_then(|v| {
                    v.pointer("/choices/0/delta/tool_calls")
                        .map(|calls| !calls.is_null())
                })
                .unwrap_or(false)
        })
    })
}

// ============================================================================
// Live fan-out
// ============================================================================

/// One item on a live fan-out channel.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(Bytes),
    /// Upstream finished cleanly (after `[DONE]` was forwarded).
    End,
    /// Upstream failed; every attached client observes the same error.
    Error(ProviderError),
}

struct BroadcastState {
    /// Chunks already published, handed to late subscribers synchronously.
    prefix: Vec<Bytes>,
    /// Set once the stream terminated, for subscribers arriving after.
    terminal: Option<StreamItem>,
}

/// Multicast for a live upstream stream.
///
/// Each published chunk goes to every subscriber; a subscriber attaching
/// mid-stream receives the already-buffered prefix synchronously and then
/// joins the live tail. The prefix lock is held across both the snapshot
/// and the channel subscription so no chunk can fall between them.
pub struct StreamBroadcaster {
    state: Mutex<BroadcastState>,
    tx: broadcast::Sender<StreamItem>,
}

impl StreamBroadcaster {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(BroadcastState {
                prefix: Vec::new(),
                terminal: None,
            }),
            tx,
        })
    }

    pub fn publish_chunk(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        state.prefix.push(chunk.clone());
        // Send failures just mean no subscriber is currently attached.
        let _ = self.tx.send(StreamItem::Chunk(chunk));
    }

    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.terminal = Some(StreamItem::End);
        let _ = self.tx.send(StreamItem::End);
    }

    pub fn fail(&self, error: ProviderError) {
        let mut state = self.state.lock();
        state.terminal = Some(StreamItem::Error(error.clone()));
        let _ = self.tx.send(StreamItem::Error(error));
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Attach a subscriber: buffered prefix plus the live tail.
    pub fn subscribe(&self) -> impl Stream<Item = Result<Bytes, ProviderError>> + Send + use<> {
        let (prefix, terminal, rx) = {
            let state = self.state.lock();
            (
                state.prefix.clone(),
                state.terminal.clone(),
                self.tx.subscribe(),
            )
        };

        let head = stream::iter(prefix.into_iter().map(Ok));

        // If the stream already terminated, the tail is just the terminal
        // marker; otherwise follow the live channel until one arrives.
        let tail: futures_util::stream::BoxStream<'static, Result<Bytes, ProviderError>> =
            match terminal {
                Some(StreamItem::Error(error)) => stream::iter(vec![Err(error)]).boxed(),
                Some(_) => stream::empty().boxed(),
                None => stream::unfold(rx, |mut rx| async move {
                    match rx.recv().await {
                        Ok(StreamItem::Chunk(chunk)) => Some((Ok(chunk), rx)),
                        Ok(StreamItem::End) => None,
                        // Terminal: emit the error; the channel closes when
                        // the flight is torn down, ending the stream.
                        Ok(StreamItem::Error(error)) => Some((Err(error), rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Stream follower lagged the fan-out");
                            Some((
                                Err(ProviderError::Network(
                                    "stream follower fell behind the live fan-out".to_string(),
                                )),
                                rx,
                            ))
                        }
                        Err(broadcast::error::RecvError::Closed) => None,
                    }
                })
                .boxed(),
            };

        head.chain(tail)
    }
}

// ============================================================================
// Per-client stream accounting
// ============================================================================

/// How a client-facing stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndState {
    /// Inner stream drained cleanly.
    Completed,
    /// Inner stream yielded an error.
    Failed,
    /// The client went away before the stream ended (body dropped).
    Disconnected,
}

/// Wraps a client-facing SSE stream and invokes a callback exactly once
/// when the stream ends, carrying any usage block observed in the chunks.
/// The drop path covers client disconnects, which never poll to completion.
pub struct StreamAccountant<S, F>
where
    F: FnOnce(StreamEndState, Option<(i64, i64)>),
{
    inner: S,
    usage: Option<(i64, i64)>,
    on_end: Option<F>,
}

impl<S, F> StreamAccountant<S, F>
where
    F: FnOnce(StreamEndState, Option<(i64, i64)>),
{
    pub fn new(inner: S, on_end: F) -> Self {
        Self {
            inner,
            usage: None,
            on_end: Some(on_end),
        }
    }

    fn settle(&mut self, state: StreamEndState) {
        if let Some(on_end) = self.on_end.take() {
            on_end(state, self.usage);
        }
    }
}

impl<S, F, E> Stream for StreamAccountant<S, F>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    F: FnOnce(StreamEndState, Option<(i64, i64)>) + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        match std::pin::Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(usage) = extract_chunk_usage(&chunk) {
                    self.usage = Some(usage);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                self.settle(StreamEndState::Failed);
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.settle(StreamEndState::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S, F> Drop for StreamAccountant<S, F>
where
    F: FnOnce(StreamEndState, Option<(i64, i64)>),
{
    fn drop(&mut self) {
        self.settle(StreamEndState::Disconnected);
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Replay a cached transcript with its recorded inter-chunk delays, clamped
/// to `[min_delay, max_delay]` per chunk. The goal is preserved streaming
/// UX, not bit-perfect timing.
pub fn replay_transcript(
    chunks: Vec<TranscriptChunk>,
    min_delay: Duration,
    max_delay: Duration,
) -> impl Stream<Item = Result<Bytes, ProviderError>> + Send {
    crate::observability::metrics::record_stream_replay(chunks.len() as u64);

    stream::unfold(chunks.into_iter(), move |mut iter| async move {
        let chunk = iter.next()?;
        let delay = Duration::from_millis(chunk.delay_ms).clamp(min_delay, max_delay);
        tokio::time::sleep(delay).await;
        Some((Ok(Bytes::from(chunk.bytes)), iter))
    })
}

/// Synthesize a single-chunk SSE replay from a cached unary body: one
/// `chat.completion.chunk`-style data event carrying the full body, then
/// `[DONE]`. Serves `stream:true` requests that hit an entry recorded from
/// a non-streaming call.
pub fn synthesize_unary_replay(body: &[u8]) -> Vec<TranscriptChunk> {
    let mut first = Vec::with_capacity(body.len() + 16);
    first.extend_from_slice(b"data: ");
    first.extend_from_slice(body);
    first.extend_from_slice(b"\n\n");

    vec![
        TranscriptChunk {
            delay_ms: 0,
            bytes: first,
        },
        TranscriptChunk {
            delay_ms: 1,
            bytes: b"data: [DONE]\n\n".to_vec(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn chunk(delay_ms: u64, data: &str) -> TranscriptChunk {
        TranscriptChunk {
            delay_ms,
            bytes: data.as_bytes().to_vec(),
        }
    }

    #[test]
    fn done_detection() {
        assert!(chunk_contains_done(b"data: [DONE]\n\n"));
        assert!(chunk_contains_done(b"data: {\"x\":1}\n\ndata: [DONE]\n\n"));
        assert!(!chunk_contains_done(b"data: {\"x\":1}\n\n"));
    }

    #[test]
    fn usage_extraction_reads_openai_and_anthropic_field_names() {
        let openai = b"data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n";
        assert_eq!(extract_chunk_usage(openai), Some((7, 3)));

        let anthropic = b"data: {\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n\n";
        assert_eq!(extract_chunk_usage(anthropic), Some((5, 2)));

        assert_eq!(extract_chunk_usage(b"data: {\"choices\":[]}\n\n"), None);
    }

    #[test]
    fn transcript_completeness() {
        let complete = vec![chunk(0, "data: {\"a\":1}\n\n"), chunk(5, "data: [DONE]\n\n")];
        assert!(transcript_is_complete(&complete));

        let partial = vec![chunk(0, "data: {\"a\":1}\n\n")];
        assert!(!transcript_is_complete(&partial));
    }

    #[tokio::test]
    async fn subscriber_sees_all_chunks_in_order() {
        let broadcaster = StreamBroadcaster::new();
        let mut sub = Box::pin(broadcaster.subscribe());

        broadcaster.publish_chunk(Bytes::from("a"));
        broadcaster.publish_chunk(Bytes::from("b"));
        broadcaster.finish();

        let mut collected = Vec::new();
        while let Some(item) = sub.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_prefix_then_live_tail() {
        let broadcaster = StreamBroadcaster::new();
        broadcaster.publish_chunk(Bytes::from("a"));
        broadcaster.publish_chunk(Bytes::from("b"));

        let mut sub = Box::pin(broadcaster.subscribe());
        broadcaster.publish_chunk(Bytes::from("c"));
        broadcaster.finish();

        let mut collected = Vec::new();
        while let Some(item) = sub.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(
            collected,
            vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
        );
    }

    #[tokio::test]
    async fn subscriber_after_termination_gets_full_prefix() {
        let broadcaster = StreamBroadcaster::new();
        broadcaster.publish_chunk(Bytes::from("a"));
        broadcaster.finish();

        let mut sub = Box::pin(broadcaster.subscribe());
        let mut collected = Vec::new();
        while let Some(item) = sub.next().await {
            collected.push(item.unwrap());
        }
        assert_eq!(collected, vec![Bytes::from("a")]);
    }

    #[tokio::test]
    async fn failure_propagates_to_every_subscriber() {
        let broadcaster = StreamBroadcaster::new();
        let mut sub_a = Box::pin(broadcaster.subscribe());
        let mut sub_b = Box::pin(broadcaster.subscribe());

        broadcaster.publish_chunk(Bytes::from("a"));
        broadcaster.fail(ProviderError::Network("boom".to_string()));

        // Both see the chunk, then the same error.
        assert_eq!(sub_a.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert!(matches!(
            sub_a.next().await.unwrap(),
            Err(ProviderError::Network(_))
        ));
        assert_eq!(sub_b.next().await.unwrap().unwrap(), Bytes::from("a"));
        assert!(matches!(
            sub_b.next().await.unwrap(),
            Err(ProviderError::Network(_))
        ));
    }

    #[tokio::test]
    async fn replay_preserves_order_and_clamps_delays() {
        let chunks = vec![
            chunk(0, "one"),
            chunk(500, "two"), // clamped down to 50ms
            chunk(500, "three"),
        ];

        let started = Instant::now();
        let collected: Vec<Bytes> = replay_transcript(
            chunks,
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
        .map(|r| r.unwrap())
        .collect()
        .await;
        let elapsed = started.elapsed();

        assert_eq!(
            collected,
            vec![Bytes::from("one"), Bytes::from("two"), Bytes::from("three")]
        );
        // Two 500ms delays clamped to 50ms each; well under the original 1s.
        assert!(elapsed < Duration::from_millis(400), "elapsed {:?}", elapsed);
    }

    #[test]
    fn synthesized_replay_is_single_chunk_plus_done() {
        let chunks = synthesize_unary_replay(br#"{"id":"chatcmpl-1"}"#);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].bytes.starts_with(b"data: {\"id\""));
        assert!(chunk_contains_done(&chunks[1].bytes));
    }
}
