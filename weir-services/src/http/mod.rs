//! HTTP request dispatch.
//!
//! This module contains the framework proper: the path pattern matcher and
//! route registry, the parameter binder, the per-connection pipeline that
//! feeds matched handlers, and the responder that frames replies.
//!
//! # Key Components
//!
//! - [`router`]: compiled URL templates and the segment trie that matches
//!   incoming paths against them with deterministic precedence.
//! - [`registry`]: the immutable routing table built from handler
//!   declarations at startup.
//! - [`binder`]: extraction and coercion of path, query and header
//!   parameters into typed handler arguments.
//! - [`pipeline`]: the per-connection state machine deciding between body
//!   aggregation and chunk streaming, invoking handlers and translating
//!   failures.
//! - [`responder`]: response framing (complete, chunked and
//!   producer-driven) and keep-alive header management.
//! - [`handler`]: the declaration surface implemented by user handlers and
//!   the body consumer/producer protocol.

use http::HeaderValue;

pub mod binder;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod registry;
pub mod responder;
pub mod router;
pub(crate) mod util;

pub use binder::{BoundArgs, BoundValue};
pub use error::DispatchError;
pub use handler::{
    BodyConsumer, BodyProducer, ExceptionHandler, FullBodyHandler, HandlerSet, RequestSummary,
    RewriteAction, StreamingHandler, UrlRewriter,
};
pub use pipeline::{PipelineService, PipelineSettings};
pub use registry::{ParamSpec, ResourceRegistry, RouteSpec, ScalarKind, Target};
pub use responder::{ChunkResponder, Responder};

pub(crate) const CLOSE: &str = "close";
pub(crate) const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);

pub(crate) fn is_conn_keepalive(
    headers: &http::HeaderMap<HeaderValue>,
    version: http::Version,
) -> bool {
    match (version, headers.get(http::header::CONNECTION)) {
        (http::Version::HTTP_10, Some(header))
            if header.as_bytes().eq_ignore_ascii_case(KEEPALIVE.as_bytes()) =>
        {
            true
        }
        (http::Version::HTTP_11, None) => true,
        (http::Version::HTTP_11, Some(header))
            if !header.as_bytes().eq_ignore_ascii_case(CLOSE.as_bytes()) =>
        {
            true
        }
        _ => false,
    }
}
