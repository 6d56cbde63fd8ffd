//! The surface user handlers implement, and the protocol contracts for
//! streamed bodies.
//!
//! A handler object implements [`HandlerSet`] and declares its routes as
//! data: verb set, path template, and per-argument source/type/default.
//! Invocation is positional: every handler first receives the request (or
//! its head) and the live [`Responder`], then reads its declared arguments
//! from [`BoundArgs`] in declaration order.
//!
//! Handler objects are registered once and shared across worker threads,
//! so the traits are `Send + Sync`; the futures they return run entirely
//! on the connection's own worker and are single-threaded.

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use http::{request::Parts, Method, Uri, Version};
use weir_core::{AnyError, AnyResult};

use super::{binder::BoundArgs, registry::RouteSpec, responder::Responder};

/// Boxed single-threaded future returned by the handler traits.
pub type HandlerFuture<'a, T> = LocalBoxFuture<'a, AnyResult<T>>;

/// A handler object: a base path plus the routes it serves.
pub trait HandlerSet: Send + Sync + 'static {
    fn base_path(&self) -> &str {
        ""
    }

    fn routes(&self) -> Vec<RouteSpec>;
}

/// A handler invoked with the request body fully buffered.
pub trait FullBodyHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        request: http::Request<Bytes>,
        responder: &'a mut Responder,
        args: &'a BoundArgs,
    ) -> HandlerFuture<'a, ()>;
}

/// A handler invoked with the request head only; the returned consumer is
/// fed the body chunk by chunk.
///
/// Returning `None` signals immediate rejection: the handler must already
/// have written a response, the remaining body is discarded without
/// further events, and the connection closes.
pub trait StreamingHandler: Send + Sync + 'static {
    fn begin<'a>(
        &'a self,
        head: &'a Parts,
        responder: &'a mut Responder,
        args: &'a BoundArgs,
    ) -> HandlerFuture<'a, Option<Box<dyn BodyConsumer>>>;
}

/// Sink for the chunks of a streamed request body.
///
/// `chunk` is called zero or more times in wire order, then exactly one of
/// `finished` or `handle_error`. A consumer may write to the responder
/// from `chunk` or `finished`, never from `handle_error`.
pub trait BodyConsumer: 'static {
    fn chunk<'a>(&'a mut self, data: Bytes, responder: &'a mut Responder) -> HandlerFuture<'a, ()>;

    fn finished<'a>(&'a mut self, responder: &'a mut Responder) -> HandlerFuture<'a, ()>;

    fn handle_error(&mut self, cause: &AnyError);
}

/// Source of the chunks of a streamed response body.
///
/// The responder drives it: `next_chunk` until it yields an empty buffer,
/// then `finished`; a failure while writing surfaces as `handle_error`.
/// The next chunk is requested only once the previous one has been
/// written out, so a slow peer throttles the producer naturally. The
/// three calls are never made concurrently.
pub trait BodyProducer: 'static {
    fn next_chunk(&mut self) -> HandlerFuture<'_, Bytes>;

    fn finished(&mut self);

    fn handle_error(&mut self, cause: &AnyError);
}

/// Outcome of a URL rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteAction {
    /// Keep dispatching with the (possibly mutated) head.
    Continue,
    /// The rewriter finished the request itself; whatever it wrote is
    /// flushed and dispatch stops.
    Stop,
}

/// Pre-routing URL mutator. Must be safe for concurrent invocation; the
/// framework performs no locking around it.
pub trait UrlRewriter: Send + Sync + 'static {
    fn rewrite<'a>(
        &'a self,
        head: &'a mut Parts,
        responder: &'a mut Responder,
    ) -> HandlerFuture<'a, RewriteAction>;
}

/// Cheap copy of the request line kept for error reporting after the
/// request has been handed to a handler.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
}

impl RequestSummary {
    pub(crate) fn of(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
        }
    }
}

/// Translates handler failures into responses; consulted before the
/// built-in translation. Must be safe for concurrent invocation, and must
/// not fail itself — if it does, the built-in translation runs instead.
pub trait ExceptionHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        cause: &'a AnyError,
        request: &'a RequestSummary,
        responder: &'a mut Responder,
    ) -> HandlerFuture<'a, ()>;
}
