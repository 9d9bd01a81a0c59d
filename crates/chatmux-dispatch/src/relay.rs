//! SSE stream relay.
//!
//! Forwards upstream chunks byte-for-byte, keeps a running token estimate for
//! chunks that carry delta content, and guarantees the stream ends with
//! exactly one `data: [DONE]` sentinel. Transport faults after the first byte
//! cannot become HTTP statuses any more, so they are converted into in-band
//! SSE error frames.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{info, warn};

use crate::provider::ByteStream;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

const CONNECTION_ERROR_FRAME: &[u8] =
    b"data: {\"error\":{\"message\":\"Connection interrupted\",\"type\":\"connection_error\",\"code\":503}}\n\n";

/// Fault raised by the upstream byte stream, pre-classified by transport.
#[derive(Debug)]
pub enum RelayFault {
    /// Connection dropped or body cut short — reported as 503 in-band.
    Connection(String),
    /// Anything else — reported as 500 in-band.
    Other(String),
}

impl From<reqwest::Error> for RelayFault {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_body() {
            RelayFault::Connection(e.to_string())
        } else {
            RelayFault::Other(e.to_string())
        }
    }
}

/// Token estimate for one chunk: the span between `"content":"` and the
/// closing `",`, at four characters per token. A chunk that fails to decode
/// still forwards; it just counts zero.
pub(crate) fn chunk_tokens(chunk: &[u8]) -> u64 {
    let Ok(text) = std::str::from_utf8(chunk) else {
        return 0;
    };
    let Some(idx) = text.find("\"content\"") else {
        return 0;
    };
    let Some(tail) = text.get(idx + 11..) else {
        return 0;
    };
    match tail.find("\",") {
        Some(len) if len > 0 => (len / 4) as u64,
        _ => 0,
    }
}

fn stream_error_frame(message: &str) -> Bytes {
    let msg = serde_json::to_string(message)
        .unwrap_or_else(|_| String::from("\"stream error\""));
    Bytes::from(format!(
        "data: {{\"error\":{{\"message\":{msg},\"type\":\"stream_error\",\"code\":500}}}}\n\n"
    ))
}

/// Wrap an upstream byte stream into the client-facing relay.
pub fn relay_sse<S>(upstream: S) -> ByteStream
where
    S: Stream<Item = Result<Bytes, RelayFault>> + Send + 'static,
{
    Box::pin(stream! {
        let mut total_tokens: u64 = 0;
        let mut last_chunk: Option<Bytes> = None;
        let mut upstream = std::pin::pin!(upstream);

        loop {
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    total_tokens += chunk_tokens(&chunk);
                    last_chunk = Some(chunk.clone());
                    yield chunk;
                    // Let other tasks run between chunks (backpressure point).
                    tokio::task::yield_now().await;
                }
                Some(Err(RelayFault::Connection(msg))) => {
                    warn!(error = %msg, "connection error during streaming");
                    yield Bytes::from_static(CONNECTION_ERROR_FRAME);
                    yield Bytes::from_static(DONE_FRAME);
                    info!(tokens = total_tokens, "stream relay aborted by transport fault");
                    return;
                }
                Some(Err(RelayFault::Other(msg))) => {
                    warn!(error = %msg, "streaming error");
                    yield stream_error_frame(&format!("Stream error: {msg}"));
                    yield Bytes::from_static(DONE_FRAME);
                    info!(tokens = total_tokens, "stream relay aborted by stream fault");
                    return;
                }
                None => break,
            }
        }

        let already_done = last_chunk
            .as_deref()
            .map(|c| c.ends_with(DONE_FRAME))
            .unwrap_or(false);
        if !already_done {
            yield Bytes::from_static(DONE_FRAME);
        }
        info!(tokens = total_tokens, "stream relay complete");
    })
}
