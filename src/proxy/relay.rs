//! Streaming relay from the upstream response to the caller.
//!
//! Provides [`RelayBody`], a byte stream that forwards upstream chunks in
//! order, splits oversized frames, and settles the lease and session exactly
//! once when the stream ends, fails, is force-closed, or is dropped.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use super::session::{ForwardingSession, SessionPhase};
use crate::error::FailureCategory;
use crate::events::Outcome;
use crate::upstream::{classify_stream_error, PooledConnection};

/// Headers that are meaningful only for a single hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayResult {
    Completed,
    Truncated(FailureCategory),
    ClientDisconnect,
    Shutdown,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Header names listed in `Connection`, which are hop-by-hop as well.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(axum::http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn filter_headers(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || extra.contains(&name.as_str())
            || listed.iter().any(|l| l == name.as_str())
        {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Headers to send upstream: hop-by-hop, `host` and `content-length` removed.
pub fn outbound_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &["host", "content-length"])
}

/// Headers to send back to the caller: hop-by-hop removed.
pub fn inbound_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &[])
}

type UpstreamStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Response body that relays an upstream stream.
pub struct RelayBody {
    upstream: UpstreamStream,
    pending: Option<Bytes>,
    max_chunk: usize,
    lease: Option<PooledConnection>,
    session: Option<ForwardingSession>,
    force_close: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl RelayBody {
    pub fn new<S>(
        upstream: S,
        lease: PooledConnection,
        session: ForwardingSession,
        max_chunk: usize,
        force_close: CancellationToken,
    ) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            upstream: Box::pin(upstream),
            pending: None,
            max_chunk: max_chunk.max(1),
            lease: Some(lease),
            session: Some(session),
            force_close: Box::pin(force_close.cancelled_owned()),
            done: false,
        }
    }

    /// Emit at most `max_chunk` bytes, keeping the rest for the next poll.
    fn take_chunk(&mut self, mut bytes: Bytes) -> Bytes {
        if bytes.len() > self.max_chunk {
            let head = bytes.split_to(self.max_chunk);
            self.pending = Some(bytes);
            bytes = head;
        }
        if let Some(session) = self.session.as_mut() {
            session.add_bytes(bytes.len());
        }
        bytes
    }

    fn settle(&mut self, result: RelayResult) {
        self.done = true;
        self.pending = None;

        if let Some(lease) = self.lease.take() {
            lease.release(result == RelayResult::Completed);
        }

        let Some(mut session) = self.session.take() else {
            return;
        };
        match result {
            RelayResult::Completed => {
                session.enter(SessionPhase::Completed);
                let category = session
                    .status()
                    .filter(|status| *status >= 500)
                    .map(|_| FailureCategory::UpstreamError);
                session.finish(Outcome::Completed, category);
            }
            RelayResult::Truncated(category) => {
                session.enter(SessionPhase::Aborted);
                session.finish(Outcome::Truncated, Some(category));
            }
            RelayResult::Shutdown => {
                session.enter(SessionPhase::Aborted);
                session.finish(Outcome::Aborted, Some(FailureCategory::ShuttingDown));
            }
            RelayResult::ClientDisconnect => {
                tracing::debug!(
                    session_id = %session.id(),
                    bytes = session.bytes_relayed(),
                    "client disconnected mid-stream, cancelling upstream"
                );
                session.enter(SessionPhase::Aborted);
                session.finish(Outcome::Aborted, Some(FailureCategory::ClientDisconnect));
            }
        }
    }
}

impl Stream for RelayBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.force_close.as_mut().poll(cx).is_ready() {
            if let Some(session) = this.session.as_ref() {
                tracing::warn!(
                    session_id = %session.id(),
                    bytes = session.bytes_relayed(),
                    "force-closing stream on shutdown"
                );
            }
            this.settle(RelayResult::Shutdown);
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "proxy shutting down",
            ))));
        }

        if let Some(rest) = this.pending.take() {
            return Poll::Ready(Some(Ok(this.take_chunk(rest))));
        }

        match this.upstream.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(this.take_chunk(bytes)))),
            Poll::Ready(Some(Err(e))) => {
                let err = classify_stream_error(&e);
                if let Some(session) = this.session.as_ref() {
                    tracing::warn!(
                        session_id = %session.id(),
                        route = %session.route(),
                        bytes = session.bytes_relayed(),
                        category = err.category().as_str(),
                        error = %err,
                        "upstream stream failed, truncating response"
                    );
                }
                this.settle(RelayResult::Truncated(err.category()));
                Poll::Ready(Some(Err(std::io::Error::other(err.to_string()))))
            }
            Poll::Ready(None) => {
                this.settle(RelayResult::Completed);
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        if !self.done {
            self.settle(RelayResult::ClientDisconnect);
        }
    }
}

/// Build the caller's response from upstream status, headers and body.
pub fn relay_response(status: StatusCode, headers: HeaderMap, body: RelayBody) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::HeaderValue;
    use futures::StreamExt;

    use crate::events::{EventSink, MemorySink};
    use crate::upstream::{ConnectionPool, PoolConfig};

    fn pool() -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_size: 1,
            idle_ttl: Duration::from_secs(60),
            acquire_timeout: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(100),
        })
    }

    async fn relay_of(
        chunks: Vec<reqwest::Result<Bytes>>,
        max_chunk: usize,
        sink: &Arc<MemorySink>,
        pool: &ConnectionPool,
    ) -> RelayBody {
        let lease = pool.acquire().await.unwrap();
        let mut session = ForwardingSession::new("/chat", sink.clone() as Arc<dyn EventSink>);
        session.enter(SessionPhase::Connecting);
        session.enter(SessionPhase::Connected);
        session.set_status(200);
        session.enter(SessionPhase::Relaying);
        RelayBody::new(
            futures::stream::iter(chunks),
            lease,
            session,
            max_chunk,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_outbound_headers_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("proxy:8000"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        let out = outbound_request_headers(&headers);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_response_headers_keep_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_static("5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/x-ndjson"));

        let out = inbound_response_headers(&headers);
        assert_eq!(out.get("content-length").unwrap(), "5");
        assert_eq!(out.get("content-type").unwrap(), "application/x-ndjson");
        assert!(out.get("transfer-encoding").is_none());
    }

    #[tokio::test]
    async fn test_relay_completes_and_returns_lease() {
        let sink = Arc::new(MemorySink::new());
        let pool = pool();
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let relay = relay_of(chunks, 1024, &sink, &pool).await;

        let collected: Vec<Bytes> = relay.map(|c| c.unwrap()).collect().await;
        assert_eq!(collected.concat(), b"hello world");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Completed);
        assert_eq!(events[0].bytes_relayed, 11);
        assert!(events[0].failure_category.is_none());

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.discarded, 0);
    }

    #[tokio::test]
    async fn test_relay_splits_large_frames() {
        let sink = Arc::new(MemorySink::new());
        let pool = pool();
        let chunks = vec![Ok(Bytes::from(vec![7u8; 10]))];
        let relay = relay_of(chunks, 4, &sink, &pool).await;

        let sizes: Vec<usize> = relay.map(|c| c.unwrap().len()).collect().await;
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(sink.events()[0].bytes_relayed, 10);
    }

    #[tokio::test]
    async fn test_dropped_relay_discards_lease() {
        let sink = Arc::new(MemorySink::new());
        let pool = pool();
        let chunks = vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"b"))];
        let mut relay = relay_of(chunks, 1024, &sink, &pool).await;

        let first = relay.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"a"));
        drop(relay);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Aborted);
        assert_eq!(
            events[0].failure_category,
            Some(FailureCategory::ClientDisconnect)
        );
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_force_close_terminates_relay() {
        let sink = Arc::new(MemorySink::new());
        let pool = pool();
        let lease = pool.acquire().await.unwrap();
        let session = ForwardingSession::new("/chat", sink.clone() as Arc<dyn EventSink>);
        let token = CancellationToken::new();
        let mut relay = RelayBody::new(
            futures::stream::pending::<reqwest::Result<Bytes>>(),
            lease,
            session,
            1024,
            token.clone(),
        );

        token.cancel();
        let item = relay.next().await.unwrap();
        assert!(item.is_err());
        assert!(relay.next().await.is_none());

        let events = sink.events();
        assert_eq!(events[0].outcome, Outcome::Aborted);
        assert_eq!(
            events[0].failure_category,
            Some(FailureCategory::ShuttingDown)
        );
        assert_eq!(pool.stats().discarded, 1);
    }
}
