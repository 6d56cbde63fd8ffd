//! The reference handler set served by the demo binary.
//!
//! Exercises every dispatch shape the framework offers: plain and JSON
//! responses, the multi-match precedence family, typed query parameters,
//! streaming uploads (counting and file-backed), a chunked echo and a
//! producer-driven download.

use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use futures::FutureExt;
use http::{request::Parts, HeaderMap, Method, StatusCode};
use tracing::{debug, warn};
use weir_core::AnyError;
use weir_services::http::{
    handler::{BodyConsumer, BodyProducer, FullBodyHandler, HandlerFuture, StreamingHandler},
    BoundArgs, HandlerSet, ParamSpec, Responder, RouteSpec, ScalarKind,
};

pub struct DemoEndpoints;

impl DemoEndpoints {
    pub fn new() -> Self {
        Self
    }
}

impl HandlerSet for DemoEndpoints {
    fn base_path(&self) -> &str {
        "/test/v1"
    }

    fn routes(&self) -> Vec<RouteSpec> {
        vec![
            RouteSpec::full([Method::GET], "/resource", Arc::new(ResourceGet))
                .param(ParamSpec::query("num").int().with_default("10")),
            RouteSpec::full(
                [Method::GET],
                "/multi-match/**",
                Arc::new(Fixed("multi-match-*")),
            ),
            RouteSpec::full([Method::GET], "/multi-match/{param}", Arc::new(MultiMatchParam))
                .param(ParamSpec::path("param")),
            RouteSpec::full(
                [Method::PUT],
                "/multi-match/foo",
                Arc::new(Fixed("multi-match-put-actual-foo")),
            ),
            RouteSpec::full(
                [Method::GET],
                "/multi-match/foo/{param}/bar/{id}",
                Arc::new(MultiMatchFooBar),
            )
            .param(ParamSpec::path("param"))
            .param(ParamSpec::path("id")),
            RouteSpec::full(
                [Method::GET],
                "/sortedSetQueryParam",
                Arc::new(SortedSetQuery),
            )
            .param(ParamSpec::query("id").sorted_set(ScalarKind::Int)),
            RouteSpec::full([Method::POST], "/echo/chunked", Arc::new(ChunkedEcho)),
            RouteSpec::full([Method::GET], "/stream/download", Arc::new(Download))
                .param(ParamSpec::query("chunks").int().with_default("16")),
            RouteSpec::full([Method::GET], "/exception", Arc::new(Exploding)),
            RouteSpec::streaming([Method::PUT], "/stream/upload", Arc::new(CountingUpload)),
            RouteSpec::streaming([Method::PUT], "/stream/upload/file", Arc::new(FileUpload)),
        ]
    }
}

struct Fixed(&'static str);

impl FullBodyHandler for Fixed {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a BoundArgs,
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
        args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            debug!("resource endpoint asked for {} items", args.int(0));
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
        args: &'a BoundArgs,
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
        args: &'a BoundArgs,
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
        args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move { responder.send_string(StatusCode::OK, args.join(0, ",")).await }.boxed_local()
    }
}

/// Echoes the aggregated request body back as a chunked stream.
struct ChunkedEcho;

impl FullBodyHandler for ChunkedEcho {
    fn handle<'a>(
        &'a self,
        request: http::Request<Bytes>,
        responder: &'a mut Responder,
        _args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let body = request.into_body();
            let mut chunks = responder
                .send_chunk_start(StatusCode::OK, HeaderMap::new())
                .await?;
            for piece in body.chunks(1024) {
                chunks.send_chunk(Bytes::copy_from_slice(piece)).await?;
            }
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
        _args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async { Err(anyhow::anyhow!("demo exception")) }.boxed_local()
    }
}

/// Streams a configurable number of 1 KiB chunks under backpressure.
struct Download;

impl FullBodyHandler for Download {
    fn handle<'a>(
        &'a self,
        _request: http::Request<Bytes>,
        responder: &'a mut Responder,
        args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()> {
        async move {
            let mut producer = PatternProducer {
                remaining: args.int(0).max(0) as usize,
            };
            responder
                .send_content(StatusCode::OK, &mut producer, HeaderMap::new())
                .await
        }
        .boxed_local()
    }
}

struct PatternProducer {
    remaining: usize,
}

impl BodyProducer for PatternProducer {
    fn next_chunk(&mut self) -> HandlerFuture<'_, Bytes> {
        async {
            if self.remaining == 0 {
                return Ok(Bytes::new());
            }
            self.remaining -= 1;
            Ok(Bytes::from(vec![b'x'; 1024]))
        }
        .boxed_local()
    }

    fn finished(&mut self) {
        debug!("download stream complete");
    }

    fn handle_error(&mut self, cause: &AnyError) {
        warn!("download stream aborted: {cause:?}");
    }
}

/// Counts uploaded bytes and reports the total.
struct CountingUpload;

impl StreamingHandler for CountingUpload {
    fn begin<'a>(
        &'a self,
        _head: &'a Parts,
        _responder: &'a mut Responder,
        _args: &'a BoundArgs,
    ) -> HandlerFuture<'a, Option<Box<dyn BodyConsumer>>> {
        async { Ok(Some(Box::new(CountingConsumer { total: 0 }) as Box<dyn BodyConsumer>)) }
            .boxed_local()
    }
}

struct CountingConsumer {
    total: usize,
}

impl BodyConsumer for CountingConsumer {
    fn chunk<'a>(&'a mut self, data: Bytes, _responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        self.total += data.len();
        async { Ok(()) }.boxed_local()
    }

    fn finished<'a>(&'a mut self, responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        let total = self.total;
        async move {
            responder
                .send_string(StatusCode::OK, format!("Uploaded:{total}"))
                .await
        }
        .boxed_local()
    }

    fn handle_error(&mut self, cause: &AnyError) {
        warn!("upload abandoned after {} bytes: {cause:?}", self.total);
    }
}

/// Spools the upload to a file; an interrupted upload removes the file.
struct FileUpload;

impl StreamingHandler for FileUpload {
    fn begin<'a>(
        &'a self,
        _head: &'a Parts,
        responder: &'a mut Responder,
        _args: &'a BoundArgs,
    ) -> HandlerFuture<'a, Option<Box<dyn BodyConsumer>>> {
        async move {
            let path = std::env::temp_dir().join("weir-demo-upload.bin");
            let file = match File::create(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!("cannot create upload target {path:?}: {e}");
                    responder.send_status(StatusCode::INTERNAL_SERVER_ERROR).await?;
                    return Ok(None);
                }
            };
            Ok(Some(Box::new(FileConsumer {
                path,
                file: Some(file),
                written: 0,
            }) as Box<dyn BodyConsumer>))
        }
        .boxed_local()
    }
}

struct FileConsumer {
    path: PathBuf,
    file: Option<File>,
    written: usize,
}

impl BodyConsumer for FileConsumer {
    fn chunk<'a>(&'a mut self, data: Bytes, _responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        let result = match self.file.as_mut() {
            Some(file) => file.write_all(&data).map_err(AnyError::from),
            None => Ok(()),
        };
        if result.is_ok() {
            self.written += data.len();
        }
        async move { result }.boxed_local()
    }

    fn finished<'a>(&'a mut self, responder: &'a mut Responder) -> HandlerFuture<'a, ()> {
        self.file = None;
        let written = self.written;
        async move {
            responder
                .send_string(StatusCode::OK, format!("Uploaded:{written}"))
                .await
        }
        .boxed_local()
    }

    fn handle_error(&mut self, cause: &AnyError) {
        // release the handle first, then remove the partial file
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot remove partial upload {:?}: {e}", self.path);
        }
        warn!("file upload failed after {} bytes: {cause:?}", self.written);
    }
}
