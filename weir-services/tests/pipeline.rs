//! End-to-end pipeline tests over an in-memory connection.
//!
//! The `TestStream` below implements monoio's rent-style IO traits over a
//! byte buffer, so a whole connection (request parsing, dispatch, body
//! streaming, response framing, keep-alive) runs in-process and the wire
//! output can be asserted byte for byte.

use std::{
    cell::RefCell,
    io,
    net::SocketAddr,
    rc::Rc,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use bytes::Bytes;
use certain_map::ParamSet;
use futures::FutureExt;
use http::{request::Parts, Method, StatusCode};
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent, Split},
    BufResult,
};
use service_async::Service;
use weir_core::{
    context::{Context, PeerAddr},
    AnyError,
};
use weir_services::http::{
    handler::{
        BodyConsumer, FullBodyHandler, HandlerFuture, HandlerSet, RewriteAction, StreamingHandler,
        UrlRewriter,
    },
    pipeline::{PipelineService, PipelineSettings},
    registry::{ParamSpec, ResourceRegistry, RouteSpec, ScalarKind},
    responder::Responder,
};

struct TestStream {
    input: Vec<u8>,
    pos: usize,
    output: Rc<RefCell<Vec<u8>>>,
}

unsafe impl Split for TestStream {}

impl AsyncReadRent for TestStream {
    async fn read<T: IoBufMut>(&mut self, mut buf: T) -> BufResult<usize, T> {
        let remaining = self.input.len() - self.pos;
        if remaining == 0 {
            return (Ok(0), buf);
        }
        let n = remaining.min(buf.bytes_total());
        unsafe {
            std::ptr::copy_nonoverlapping(self.input.as_ptr().add(self.pos), buf.write_ptr(), n);
            buf.set_init(n);
        }
        self.pos += n;
        (Ok(n), buf)
    }

    async fn readv<T: IoVecBufMut>(&mut self, mut buf: T) -> BufResult<usize, T> {
        if buf.write_iovec_len() == 0 {
            return (Ok(0), buf);
        }
        let iov = unsafe { *buf.write_iovec_ptr() };
        let remaining = self.input.len() - self.pos;
        if remaining == 0 {
            return (Ok(0), buf);
        }
        let n = remaining.min(iov.iov_len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.input.as_ptr().add(self.pos),
                iov.iov_base as *mut u8,
                n,
            );
            buf.set_init(n);
        }
        self.pos += n;
        (Ok(n), buf)
    }
}

impl AsyncWriteRent for TestStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        let slice = unsafe { std::slice::from_raw_parts(buf.read_ptr(), buf.bytes_init()) };
        self.output.borrow_mut().extend_from_slice(slice);
        (Ok(slice.len()), buf)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        let ptr = buf_vec.read_iovec_ptr();
        let mut written = 0;
        for i in 0..buf_vec.read_iovec_len() {
            let iov = unsafe { *ptr.add(i) };
            let slice =
                unsafe { std::slice::from_raw_parts(iov.iov_base as *const u8, iov.iov_len) };
            self.output.borrow_mut().extend_from_slice(slice);
            written += iov.iov_len;
        }
        (Ok(written), buf_vec)
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl Events {
    fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct Echo(&'static str);

impl FullBodyHandler for Echo {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move { responder.send_string(StatusCode::OK, self.0).await }.boxed_local()
    }
}

struct ResourceGet;

impl FullBodyHandler for ResourceGet {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            responder
                .send_json(
                    StatusCode::OK,
                    &serde_json::json!({"status": "Handled get in resource end-point"}),
                )
                .await
        }
        .boxed_local()
    }
}

struct MultiMatchParam;

impl FullBodyHandler for MultiMatchParam {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let body = format!("multi-match-param-{}", args.text(0));
            responder.send_string(StatusCode::OK, body).await
        }
        .boxed_local()
    }
}

struct MultiMatchFooBar;

impl FullBodyHandler for MultiMatchFooBar {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let body = format!(
                "multi-match-foo-bar-param-{}-id-{}",
                args.text(0),
                args.text(1)
            );
            responder.send_string(StatusCode::OK, body).await
        }
        .boxed_local()
    }
}

struct SortedSetQuery;

impl FullBodyHandler for SortedSetQuery {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move { responder.send_string(StatusCode::OK, args.join(0, ",")).await }.boxed_local()
    }
}

struct BodyLen;

impl FullBodyHandler for BodyLen {
    fn handle<'a>(
        &'a self,
        request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let body = format!("Len:{}", request.body().len());
            responder.send_string(StatusCode::OK, body).await
        }
        .boxed_local()
    }
}

struct ChunkedEcho;

impl FullBodyHandler for ChunkedEcho {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let mut chunks = responder
                .send_chunk_start(StatusCode::OK, http::HeaderMap::new())
                .await?;
            chunks.send_chunk(Bytes::from_static(b"he")).await?;
            chunks.send_chunk(Bytes::from_static(b"llo")).await?;
            chunks.close().await
        }
        .boxed_local()
    }
}

struct Exploding;

impl FullBodyHandler for Exploding {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        _responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async { Err(anyhow!("boom")) }.boxed_local()
    }
}

struct CountingConsumer {
    events: Arc<Events>,
    total: usize,
}

impl BodyConsumer for CountingConsumer {
    fn chunk<'a>(&'a mut self, data: Bytes, _responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        self.total += data.len();
        self.events.record("chunk");
        async { Ok(()) }.boxed_local()
    }

    fn finished<'a>(&'a mut self, responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        self.events.record("finished");
        let total = self.total;
        async move {
            responder
                .send_string(StatusCode::OK, format!("Uploaded:{total}"))
                .await
        }
        .boxed_local()
    }

    fn handle_error(&mut self, _cause: &AnyError) {
        self.events.record("error");
    }
}

struct UploadEndpoint {
    events: Arc<Events>,
}

impl StreamingHandler for UploadEndpoint {
    fn begin<'a>(
        &'a self,
        _head: &'a Parts,
        _responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, Option<Box<dyn BodyConsumer>>> {
        let events = self.events.clone();
        async move {
            Ok(Some(
                Box::new(CountingConsumer { events, total: 0 }) as Box<dyn BodyConsumer>
            ))
        }
        .boxed_local()
    }
}

struct RejectingEndpoint;

impl StreamingHandler for RejectingEndpoint {
    fn begin<'a>(
        &'a self,
        _head: &'a Parts,
        responder: &'a mut Responder,
        _args: &'a weir_services::http::BoundArgs,
    ) -> HandlerFuture<'a, Option<Box<dyn BodyConsumer>>> {
        async move {
            responder.send_status(StatusCode::FORBIDDEN).await?;
            Ok(None)
        }
        .boxed_local()
    }
}

struct TestEndpoints {
    events: Arc<Events>,
}

impl HandlerSet for TestEndpoints {
    fn base_path(&self) -> &str {
        "/test/v1"
    }

    fn routes(&self) -> Vec<RouteSpec> {
        vec![
            RouteSpec::full([Method::GET], "/resource", Arc::new(ResourceGet))
                .param(ParamSpec::query("num").int().with_default("10")),
            RouteSpec::full([Method::GET], "/multi-match/**", Arc::new(Echo("multi-match-*"))),
            RouteSpec::full([Method::GET], "/multi-match/{param}", Arc::new(MultiMatchParam))
                .param(ParamSpec::path("param")),
            RouteSpec::full(
                [Method::PUT],
                "/multi-match/foo",
                Arc::new(Echo("multi-match-put-actual-foo")),
            ),
            RouteSpec::full(
                [Method::GET],
                "/multi-match/foo/{param}/bar/{id}",
                Arc::new(MultiMatchFooBar),
            )
            .param(ParamSpec::path("param"))
            .param(ParamSpec::path("id")),
            RouteSpec::full([Method::GET], "/sortedSetQueryParam", Arc::new(SortedSetQuery))
                .param(ParamSpec::query("id").sorted_set(ScalarKind::Int)),
            RouteSpec::full([Method::POST], "/body", Arc::new(BodyLen)),
            RouteSpec::full([Method::GET], "/chunked", Arc::new(ChunkedEcho)),
            RouteSpec::full([Method::GET], "/exception", Arc::new(Exploding)),
            RouteSpec::streaming(
                [Method::PUT],
                "/stream/upload",
                Arc::new(UploadEndpoint {
                    events: self.events.clone(),
                }),
            ),
            RouteSpec::streaming([Method::PUT], "/stream/reject", Arc::new(RejectingEndpoint)),
        ]
    }
}

fn service(settings: PipelineSettings) -> (PipelineService, Arc<Events>) {
    let events = Arc::new(Events::default());
    let registry = Arc::new(
        ResourceRegistry::build(&[Arc::new(TestEndpoints {
            events: events.clone(),
        }) as Arc<dyn HandlerSet>])
        .unwrap(),
    );
    (
        PipelineService::new(registry, settings, None, None),
        events,
    )
}

async fn drive(svc: &PipelineService, input: &str) -> String {
    let output = Rc::new(RefCell::new(Vec::new()));
    let stream = TestStream {
        input: input.as_bytes().to_vec(),
        pos: 0,
        output: output.clone(),
    };
    let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
    let ctx = Context::new().param_set(PeerAddr(addr));
    svc.call((stream, ctx)).await.unwrap();
    let out = output.borrow().clone();
    String::from_utf8_lossy(&out).into_owned()
}

#[monoio::test(timer_enabled = true)]
async fn resource_endpoint_returns_json() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/resource?num=10 HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Type: application/json"));
    assert!(out.contains(r#"{"status":"Handled get in resource end-point"}"#));
}

#[monoio::test(timer_enabled = true)]
async fn literal_segments_beat_captures_and_glob() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/multi-match/foo/bar/bar/bar HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert!(out.contains("multi-match-foo-bar-param-bar-id-bar"));
}

#[monoio::test(timer_enabled = true)]
async fn glob_route_picks_up_everything_else() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/multi-match/a/b/c HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert!(out.contains("multi-match-*"));
}

#[monoio::test(timer_enabled = true)]
async fn sorted_set_query_dedups_and_orders() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/sortedSetQueryParam?id=30&id=10&id=20&id=30 HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert!(out.contains("\r\n\r\n10,20,30"));
}

#[monoio::test(timer_enabled = true)]
async fn put_on_get_only_route_is_method_not_allowed() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "PUT /test/v1/multi-match/bar HTTP/1.1\r\nHost: l\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn unknown_path_is_not_found() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(&svc, "GET /nope HTTP/1.1\r\nHost: l\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn keep_alive_carries_two_requests_on_one_connection() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/resource HTTP/1.1\r\nHost: l\r\n\r\n\
         GET /test/v1/sortedSetQueryParam?id=5 HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(out.contains("Handled get in resource end-point"));
    assert!(out.contains("\r\n\r\n5"));
}

#[monoio::test(timer_enabled = true)]
async fn connection_close_is_honored() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/resource HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n\
         GET /test/v1/resource HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
    assert!(out.contains("Connection: close\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn aggregated_body_at_the_cap_passes_and_one_byte_over_fails() {
    let settings = PipelineSettings {
        chunk_memory_limit: 8,
        ..Default::default()
    };
    let (svc, _) = service(settings.clone());
    let out = drive(
        &svc,
        "POST /test/v1/body HTTP/1.1\r\nHost: l\r\nContent-Length: 8\r\n\r\n12345678",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Len:8"));

    let (svc, _) = service(settings);
    let out = drive(
        &svc,
        "POST /test/v1/body HTTP/1.1\r\nHost: l\r\nContent-Length: 9\r\n\r\n123456789",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn chunked_upload_is_streamed_and_counted() {
    let (svc, events) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "PUT /test/v1/stream/upload HTTP/1.1\r\nHost: l\r\nTransfer-Encoding: chunked\r\n\r\n\
         5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    assert!(out.contains("Uploaded:11"));
    let events = events.snapshot();
    assert_eq!(events.iter().filter(|e| *e == "finished").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "error").count(), 0);
    assert!(events.iter().any(|e| e == "chunk"));
    assert_eq!(events.last().map(String::as_str), Some("finished"));
}

#[monoio::test(timer_enabled = true)]
async fn zero_length_chunked_body_only_finishes() {
    let (svc, events) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "PUT /test/v1/stream/upload HTTP/1.1\r\nHost: l\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
    )
    .await;
    assert!(out.contains("Uploaded:0"));
    assert_eq!(events.snapshot(), vec!["finished".to_string()]);
}

#[monoio::test(timer_enabled = true)]
async fn disconnect_mid_stream_fires_handle_error_exactly_once() {
    let settings = PipelineSettings {
        read_body_timeout: Some(std::time::Duration::from_millis(500)),
        ..Default::default()
    };
    let (svc, events) = service(settings);
    let out = drive(
        &svc,
        "PUT /test/v1/stream/upload HTTP/1.1\r\nHost: l\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel",
    )
    .await;
    let events = events.snapshot();
    assert_eq!(events.iter().filter(|e| *e == "error").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "finished").count(), 0);
    assert!(!out.contains("Uploaded"));
}

#[monoio::test(timer_enabled = true)]
async fn rejecting_streaming_handler_answers_and_discards_the_body() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "PUT /test/v1/stream/reject HTTP/1.1\r\nHost: l\r\nTransfer-Encoding: chunked\r\n\r\n\
         5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn chunked_response_is_framed() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(&svc, "GET /test/v1/chunked HTTP/1.1\r\nHost: l\r\n\r\n").await;
    assert!(out.contains("Transfer-Encoding: chunked\r\n"));
    assert!(out.contains("2\r\nhe\r\n"));
    assert!(out.contains("3\r\nllo\r\n"));
    assert!(out.contains("0\r\n\r\n"));
}

#[monoio::test(timer_enabled = true)]
async fn handler_failure_uses_the_default_translation() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(&svc, "GET /test/v1/exception HTTP/1.1\r\nHost: l\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.contains("Exception encountered while processing request : boom"));
}

#[monoio::test(timer_enabled = true)]
async fn bad_query_parameter_is_a_bad_request() {
    let (svc, _) = service(PipelineSettings::default());
    let out = drive(
        &svc,
        "GET /test/v1/resource?num=ten HTTP/1.1\r\nHost: l\r\n\r\n",
    )
    .await;
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

struct TestRewriter;

impl UrlRewriter for TestRewriter {
    fn rewrite<'a>(
        &'a self,
        head: &'a mut Parts,
        responder: &'a mut Responder,
    ) -> HandlerFuture<'a, RewriteAction> {
        async move {
            if head.uri.path() == "/blocked" {
                responder.send_status(StatusCode::FORBIDDEN).await?;
                return Ok(RewriteAction::Stop);
            }
            if head.uri.path() == "/old" {
                head.uri = "/test/v1/resource".parse().unwrap();
            }
            Ok(RewriteAction::Continue)
        }
        .boxed_local()
    }
}

fn service_with_rewriter() -> PipelineService {
    let registry = Arc::new(
        ResourceRegistry::build(&[Arc::new(TestEndpoints {
            events: Arc::new(Events::default()),
        }) as Arc<dyn HandlerSet>])
        .unwrap(),
    );
    PipelineService::new(
        registry,
        PipelineSettings::default(),
        Some(Arc::new(TestRewriter)),
        None,
    )
}

#[monoio::test(timer_enabled = true)]
async fn rewriter_can_redirect_dispatch() {
    let svc = service_with_rewriter();
    let out = drive(&svc, "GET /old HTTP/1.1\r\nHost: l\r\n\r\n").await;
    assert!(out.contains("Handled get in resource end-point"));
}

#[monoio::test(timer_enabled = true)]
async fn rewriter_stop_short_circuits_dispatch() {
    let svc = service_with_rewriter();
    let out = drive(&svc, "GET /blocked HTTP/1.1\r\nHost: l\r\n\r\n").await;
    assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(!out.contains("200 OK"));
}
