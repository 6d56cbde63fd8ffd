//! Response framing and delivery.
//!
//! The responder owns the connection's write half for the connection's
//! whole lifetime and frames every reply: complete responses with a
//! `Content-Length`, handler-driven chunked streams, and producer-driven
//! streams where the responder owns the chunk loop. Its write state is
//! monotone per request — nothing written, head written with the stream
//! open, or complete — and an attempt to start a second response for the
//! same request is a programming error that is logged and dropped.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::LocalBoxFuture;
use http::{header, HeaderMap, StatusCode, Version};
use monoio::io::{AsyncWriteRent, AsyncWriteRentExt};
use serde::Serialize;
use tracing::{debug, warn};
use weir_core::AnyResult;

use super::handler::BodyProducer;
use crate::http::{CLOSE_VALUE, KEEPALIVE_VALUE};

/// Object-safe view over the connection's write half. Erasing the
/// transport here keeps the handler traits free of the stream type.
pub(crate) trait ResponseTransport {
    fn write_all(&mut self, data: Bytes) -> LocalBoxFuture<'_, io::Result<()>>;
    fn flush(&mut self) -> LocalBoxFuture<'_, io::Result<()>>;
    fn shutdown(&mut self) -> LocalBoxFuture<'_, io::Result<()>>;
}

pub(crate) struct WriteHalfTransport<W>(pub(crate) W);

impl<W: AsyncWriteRent> ResponseTransport for WriteHalfTransport<W> {
    fn write_all(&mut self, data: Bytes) -> LocalBoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if data.is_empty() {
                return Ok(());
            }
            let (res, _buf) = AsyncWriteRentExt::write_all(&mut self.0, data).await;
            res.map(|_| ())
        })
    }

    fn flush(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
        Box::pin(async move { AsyncWriteRent::flush(&mut self.0).await })
    }

    fn shutdown(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
        Box::pin(async move { AsyncWriteRent::shutdown(&mut self.0).await })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    /// Nothing written for the current request.
    Fresh,
    /// Head written, body stream still open.
    Open,
    /// Response complete.
    Done,
}

/// The write side of one connection, reset per request.
pub struct Responder {
    transport: Box<dyn ResponseTransport>,
    state: WriteState,
    version: Version,
    keep_alive: bool,
    force_close: bool,
    aborted: bool,
}

impl Responder {
    pub(crate) fn new(transport: Box<dyn ResponseTransport>) -> Self {
        Self {
            transport,
            state: WriteState::Fresh,
            version: Version::HTTP_11,
            keep_alive: false,
            force_close: false,
            aborted: false,
        }
    }

    /// Arms the responder for the next request on this connection.
    pub(crate) fn begin(&mut self, version: Version, keep_alive: bool) {
        self.state = WriteState::Fresh;
        self.version = version;
        self.keep_alive = keep_alive;
        self.force_close = false;
    }

    /// Whether a response head has gone out for the current request.
    pub fn headers_sent(&self) -> bool {
        self.state != WriteState::Fresh
    }

    pub(crate) fn is_fresh(&self) -> bool {
        self.state == WriteState::Fresh
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == WriteState::Done
    }

    /// Marks the write side dead; every later write is silently dropped.
    pub(crate) fn abort(&mut self) {
        self.aborted = true;
    }

    /// Whether the connection can carry another request: the response is
    /// complete, nothing forced `Connection: close`, and the request asked
    /// for keep-alive.
    pub(crate) fn reusable(&self) -> bool {
        self.is_complete() && !self.aborted && self.keep_alive && !self.force_close
    }

    pub(crate) async fn close(&mut self) {
        let _ = self.transport.shutdown().await;
    }

    fn begin_write(&mut self, what: &str) -> bool {
        if self.aborted {
            debug!("dropping {what}: connection write side is dead");
            return false;
        }
        if self.state != WriteState::Fresh {
            warn!("dropping {what}: a response was already started for this request");
            return false;
        }
        true
    }

    fn note_connection(&mut self, extra: &HeaderMap) {
        if let Some(value) = extra.get(header::CONNECTION) {
            if value.as_bytes().eq_ignore_ascii_case(b"close") {
                self.force_close = true;
            }
        }
    }

    fn encode_head(
        &self,
        status: StatusCode,
        content_type: Option<&'static str>,
        body_len: Option<usize>,
        chunked: bool,
        extra: &HeaderMap,
    ) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        buf.put_slice(version.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.put_slice(b"\r\n");
        if let Some(ct) = content_type {
            if !extra.contains_key(header::CONTENT_TYPE) {
                buf.put_slice(b"Content-Type: ");
                buf.put_slice(ct.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
        for (name, value) in extra.iter() {
            buf.put_slice(name.as_str().as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        if let Some(len) = body_len {
            buf.put_slice(b"Content-Length: ");
            buf.put_slice(len.to_string().as_bytes());
            buf.put_slice(b"\r\n");
        }
        if chunked {
            buf.put_slice(b"Transfer-Encoding: chunked\r\n");
        }
        if !extra.contains_key(header::CONNECTION) {
            let reuse = self.keep_alive && !self.force_close;
            match self.version {
                Version::HTTP_10 if reuse => {
                    buf.put_slice(b"Connection: ");
                    buf.put_slice(KEEPALIVE_VALUE.as_bytes());
                    buf.put_slice(b"\r\n");
                }
                Version::HTTP_10 => {}
                _ if !reuse => {
                    buf.put_slice(b"Connection: ");
                    buf.put_slice(CLOSE_VALUE.as_bytes());
                    buf.put_slice(b"\r\n");
                }
                _ => {}
            }
        }
        buf.put_slice(b"\r\n");
        buf
    }

    async fn write_buf(&mut self, buf: BytesMut) -> AnyResult<()> {
        match self.transport.write_all(buf.freeze()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.aborted = true;
                Err(e.into())
            }
        }
    }

    async fn flush_transport(&mut self) -> AnyResult<()> {
        match self.transport.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.aborted = true;
                Err(e.into())
            }
        }
    }

    async fn send_fixed(
        &mut self,
        status: StatusCode,
        content_type: Option<&'static str>,
        body: Bytes,
        extra: HeaderMap,
    ) -> AnyResult<()> {
        if !self.begin_write("response") {
            return Ok(());
        }
        self.note_connection(&extra);
        let mut buf = self.encode_head(status, content_type, Some(body.len()), false, &extra);
        buf.put_slice(&body);
        self.state = WriteState::Open;
        self.write_buf(buf).await?;
        self.flush_transport().await?;
        self.state = WriteState::Done;
        Ok(())
    }

    /// Sends an empty-bodied response with `Content-Length: 0`.
    pub async fn send_status(&mut self, status: StatusCode) -> AnyResult<()> {
        self.send_fixed(status, None, Bytes::new(), HeaderMap::new())
            .await
    }

    /// Sends a complete UTF-8 text response.
    pub async fn send_string(&mut self, status: StatusCode, body: impl AsRef<str>) -> AnyResult<()> {
        self.send_string_with_headers(status, body, HeaderMap::new())
            .await
    }

    pub async fn send_string_with_headers(
        &mut self,
        status: StatusCode,
        body: impl AsRef<str>,
        extra: HeaderMap,
    ) -> AnyResult<()> {
        let body = Bytes::copy_from_slice(body.as_ref().as_bytes());
        self.send_fixed(status, Some("text/plain; charset=utf-8"), body, extra)
            .await
    }

    /// Serializes `value` as JSON and sends it as a complete response.
    pub async fn send_json<T: Serialize>(&mut self, status: StatusCode, value: &T) -> AnyResult<()> {
        let body = Bytes::from(serde_json::to_vec(value)?);
        self.send_fixed(status, Some("application/json"), body, HeaderMap::new())
            .await
    }

    /// Writes a chunked response head and hands back the chunk writer.
    /// Every chunk is flushed as it is sent.
    pub async fn send_chunk_start(
        &mut self,
        status: StatusCode,
        extra: HeaderMap,
    ) -> AnyResult<ChunkResponder<'_>> {
        let live = self.begin_write("chunked response");
        if live {
            self.note_connection(&extra);
            let buf = self.encode_head(status, None, None, true, &extra);
            self.state = WriteState::Open;
            self.write_buf(buf).await?;
            self.flush_transport().await?;
        }
        Ok(ChunkResponder {
            responder: self,
            live,
        })
    }

    /// Streams a response from a producer; the responder owns the chunk
    /// loop. `next_chunk` is invoked only after the previous chunk has
    /// been written, giving backpressure without an explicit flow-control
    /// surface.
    pub async fn send_content(
        &mut self,
        status: StatusCode,
        producer: &mut dyn BodyProducer,
        extra: HeaderMap,
    ) -> AnyResult<()> {
        if !self.begin_write("streamed response") {
            return Ok(());
        }
        self.note_connection(&extra);
        let head = self.encode_head(status, None, None, true, &extra);
        self.state = WriteState::Open;
        if let Err(e) = self.stream_from(head, producer).await {
            producer.handle_error(&e);
            return Err(e);
        }
        producer.finished();
        self.state = WriteState::Done;
        Ok(())
    }

    async fn stream_from(
        &mut self,
        head: BytesMut,
        producer: &mut dyn BodyProducer,
    ) -> AnyResult<()> {
        self.write_buf(head).await?;
        self.flush_transport().await?;
        loop {
            let chunk = producer.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            self.write_buf(chunk_frame(&chunk)).await?;
            self.flush_transport().await?;
        }
        self.write_buf(BytesMut::from(&b"0\r\n\r\n"[..])).await?;
        self.flush_transport().await
    }
}

fn chunk_frame(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf
}

/// Writer handle for a chunked response started with
/// [`Responder::send_chunk_start`].
pub struct ChunkResponder<'a> {
    responder: &'a mut Responder,
    live: bool,
}

impl ChunkResponder<'_> {
    /// Writes one framed chunk and flushes it. Empty input is ignored: a
    /// zero-sized frame would terminate the stream.
    pub async fn send_chunk(&mut self, data: impl Into<Bytes>) -> AnyResult<()> {
        let data: Bytes = data.into();
        if !self.live || self.responder.aborted || data.is_empty() {
            return Ok(());
        }
        self.responder.write_buf(chunk_frame(&data)).await?;
        self.responder.flush_transport().await
    }

    /// Writes the terminating frame and completes the response.
    pub async fn close(self) -> AnyResult<()> {
        if !self.live || self.responder.aborted {
            return Ok(());
        }
        self.responder
            .write_buf(BytesMut::from(&b"0\r\n\r\n"[..]))
            .await?;
        self.responder.flush_transport().await?;
        self.responder.state = WriteState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use futures::FutureExt;
    use weir_core::AnyError;

    use super::*;
    use crate::http::handler::HandlerFuture;

    struct SinkTransport(Rc<RefCell<Vec<u8>>>);

    impl ResponseTransport for SinkTransport {
        fn write_all(&mut self, data: Bytes) -> LocalBoxFuture<'_, io::Result<()>> {
            self.0.borrow_mut().extend_from_slice(&data);
            Box::pin(async { Ok(()) })
        }

        fn flush(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&mut self) -> LocalBoxFuture<'_, io::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn responder(keep_alive: bool) -> (Responder, Rc<RefCell<Vec<u8>>>) {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut responder = Responder::new(Box::new(SinkTransport(sink.clone())));
        responder.begin(Version::HTTP_11, keep_alive);
        (responder, sink)
    }

    fn written(sink: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(sink.borrow().clone()).unwrap()
    }

    #[monoio::test]
    async fn complete_response_carries_length_and_type() {
        let (mut responder, sink) = responder(true);
        responder.send_string(StatusCode::OK, "hello").await.unwrap();
        let out = written(&sink);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
        assert!(responder.reusable());
    }

    #[monoio::test]
    async fn close_header_is_added_when_not_reusable() {
        let (mut responder, sink) = responder(false);
        responder.send_status(StatusCode::NO_CONTENT).await.unwrap();
        let out = written(&sink);
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.contains("Content-Length: 0\r\n"));
        assert!(!responder.reusable());
    }

    #[monoio::test]
    async fn http10_keepalive_is_echoed() {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let mut responder = Responder::new(Box::new(SinkTransport(sink.clone())));
        responder.begin(Version::HTTP_10, true);
        responder.send_status(StatusCode::OK).await.unwrap();
        let out = written(&sink);
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("Connection: Keep-Alive\r\n"));
    }

    #[monoio::test]
    async fn second_response_is_dropped() {
        let (mut responder, sink) = responder(true);
        responder.send_status(StatusCode::OK).await.unwrap();
        responder
            .send_string(StatusCode::INTERNAL_SERVER_ERROR, "late")
            .await
            .unwrap();
        let out = written(&sink);
        assert!(out.contains("200 OK"));
        assert!(!out.contains("late"));
    }

    #[monoio::test]
    async fn chunked_stream_is_framed_and_terminated() {
        let (mut responder, sink) = responder(true);
        let mut chunks = responder
            .send_chunk_start(StatusCode::OK, HeaderMap::new())
            .await
            .unwrap();
        chunks.send_chunk(Bytes::from_static(b"hello ")).await.unwrap();
        chunks.send_chunk(Bytes::from_static(b"world")).await.unwrap();
        chunks.close().await.unwrap();
        let out = written(&sink);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.contains("6\r\nhello \r\n"));
        assert!(out.contains("5\r\nworld\r\n"));
        assert!(out.ends_with("0\r\n\r\n"));
        assert!(responder.reusable());
    }

    struct CountdownProducer {
        left: u32,
        finished: bool,
    }

    impl BodyProducer for CountdownProducer {
        fn next_chunk(&mut self) -> HandlerFuture<'_, Bytes> {
            async {
                if self.left == 0 {
                    return Ok(Bytes::new());
                }
                self.left -= 1;
                Ok(Bytes::from(format!("{};", self.left)))
            }
            .boxed_local()
        }

        fn finished(&mut self) {
            self.finished = true;
        }

        fn handle_error(&mut self, _cause: &AnyError) {
            unreachable!("writes to the sink cannot fail");
        }
    }

    #[monoio::test]
    async fn producer_is_drained_until_empty_then_finished() {
        let (mut responder, sink) = responder(true);
        let mut producer = CountdownProducer {
            left: 3,
            finished: false,
        };
        responder
            .send_content(StatusCode::OK, &mut producer, HeaderMap::new())
            .await
            .unwrap();
        assert!(producer.finished);
        let out = written(&sink);
        assert!(out.contains("2;"));
        assert!(out.contains("0;"));
        assert!(out.ends_with("0\r\n\r\n"));
        assert!(responder.is_complete());
    }

    #[monoio::test]
    async fn handler_connection_close_header_forces_close() {
        let (mut responder, sink) = responder(true);
        let mut extra = HeaderMap::new();
        extra.insert(header::CONNECTION, CLOSE_VALUE);
        responder
            .send_string_with_headers(StatusCode::OK, "bye", extra)
            .await
            .unwrap();
        assert!(!responder.reusable());
        assert!(written(&sink).contains("Connection: close\r\n"));
    }
}
