//! The per-connection request pipeline.
//!
//! Each accepted connection is driven by [`PipelineService`]: decode a
//! request head, apply the optional URL rewriter, resolve the route, bind
//! the declared arguments, then branch on the matched handler's declared
//! body mode. An aggregating handler gets the body buffered up to the
//! configured cap before it runs; a streaming handler runs immediately
//! against the head and the consumer it returns becomes the sink for the
//! body chunks as they arrive. Responses are framed by the [`Responder`],
//! and the connection loops for the next request when keep-alive allows.
//!
//! Both body paths are pre-wired; the pipeline branches at the first byte
//! of body rather than reconfiguring any stages. Failure handling is
//! latched per request: of the possible failure sources (parser, handler
//! invocation, consumer callbacks) only the first produces a response,
//! later ones are logged at trace level.

use std::{convert::Infallible, fmt::Debug, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use bytes::BytesMut;
use http::{request::Parts, Request, StatusCode};
use monoio::io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_http::{
    common::body::{Body, HttpBody},
    h1::codec::decoder::{FillPayload, RequestDecoder},
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, ParamRef, Service,
};
use tracing::{debug, error, info, trace, warn};
use weir_core::{context::PeerAddr, AnyError};

use super::{
    binder::{bind_args, BoundArgs},
    error::{exception_body, DispatchError},
    handler::{
        ExceptionHandler, FullBodyHandler, RequestSummary, RewriteAction, StreamingHandler,
        UrlRewriter,
    },
    is_conn_keepalive,
    registry::{ResourceRegistry, RouteHandler},
    responder::{Responder, WriteHalfTransport},
    util::Accompany,
};

/// Default cap on an aggregated request body.
pub const DEFAULT_CHUNK_MEMORY_LIMIT: usize = 150 * 1024 * 1024;

const DEFAULT_KEEPALIVE_SEC: u64 = 75;

/// Tunables of the connection pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Cap on the buffered size of an aggregated request body.
    pub chunk_memory_limit: usize,
    /// Status used when an aggregated body exceeds the cap.
    pub over_limit_status: StatusCode,
    /// Idle timeout between requests on a keep-alive connection.
    pub keepalive_timeout: Option<Duration>,
    /// Timeout for reading a request head.
    pub read_header_timeout: Option<Duration>,
    /// Timeout for receiving a full request body.
    pub read_body_timeout: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_memory_limit: DEFAULT_CHUNK_MEMORY_LIMIT,
            over_limit_status: StatusCode::INTERNAL_SERVER_ERROR,
            keepalive_timeout: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SEC)),
            read_header_timeout: None,
            read_body_timeout: None,
        }
    }
}

enum CollectFailure {
    OverLimit,
    Transport(String),
}

enum DeliverOutcome {
    Finished,
    ConsumerFailed(AnyError),
    Transport(AnyError),
}

/// Connection service dispatching requests to registered handlers.
///
/// It is its own factory: workers clone it when they build their service
/// instances, sharing the read-only registry.
#[derive(Clone)]
pub struct PipelineService {
    registry: Arc<ResourceRegistry>,
    settings: PipelineSettings,
    rewriter: Option<Arc<dyn UrlRewriter>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

impl PipelineService {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        settings: PipelineSettings,
        rewriter: Option<Arc<dyn UrlRewriter>>,
        exception_handler: Option<Arc<dyn ExceptionHandler>>,
    ) -> Self {
        Self {
            registry,
            settings,
            rewriter,
            exception_handler,
        }
    }

    pub fn layer<C>() -> impl FactoryLayer<C, (), Factory = Self>
    where
        C: Param<Arc<ResourceRegistry>>
            + Param<PipelineSettings>
            + Param<Option<Arc<dyn UrlRewriter>>>
            + Param<Option<Arc<dyn ExceptionHandler>>>,
    {
        layer_fn(|c: &C, _inner| {
            PipelineService::new(c.param(), c.param(), c.param(), c.param())
        })
    }

    async fn drive_connection<S>(&self, stream: S, peer: SocketAddr)
    where
        S: Split + AsyncReadRent + AsyncWriteRent + 'static,
    {
        let (reader, writer) = stream.into_split();
        let mut decoder = RequestDecoder::new(reader);
        decoder.set_timeout(self.settings.keepalive_timeout);
        let mut responder = Responder::new(Box::new(WriteHalfTransport(writer)));

        loop {
            let decoded = match self.settings.read_header_timeout {
                Some(header_timeout) => {
                    match monoio::time::timeout(header_timeout, decoder.next()).await {
                        Ok(inner) => inner,
                        Err(_) => {
                            info!("connection {peer:?} timed out reading a request head");
                            break;
                        }
                    }
                }
                None => decoder.next().await,
            };

            let req = match decoded {
                Some(Ok(req)) => HttpBody::request(req),
                Some(Err(err)) => {
                    warn!("decode request head from {peer:?} failed: {err}");
                    break;
                }
                None => {
                    debug!("connection {peer:?} closed");
                    break;
                }
            };

            let (parts, body) = req.into_parts();
            let reuse = {
                let fill = decoder.fill_payload();
                self.run_cycle(parts, body, fill, &mut responder).await
            };
            if !reuse {
                break;
            }
        }
        responder.close().await;
    }

    /// Runs one request to completion. Returns whether the connection may
    /// carry another request.
    async fn run_cycle<FP, FE>(
        &self,
        mut parts: Parts,
        body: HttpBody,
        fill: FP,
        responder: &mut Responder,
    ) -> bool
    where
        FP: Future<Output = Result<(), FE>>,
        FE: Debug,
    {
        let keep_alive = is_conn_keepalive(&parts.headers, parts.version);
        responder.begin(parts.version, keep_alive);
        let mut latched = false;

        if let Some(rewriter) = &self.rewriter {
            match rewriter.rewrite(&mut parts, responder).await {
                Ok(RewriteAction::Continue) => {
                    if responder.headers_sent() {
                        error!("url rewriter wrote a response but asked to continue dispatching");
                        self.drain(body, fill).await;
                        return false;
                    }
                }
                Ok(RewriteAction::Stop) => {
                    trace!("url rewriter finished the request itself");
                    self.drain(body, fill).await;
                    return responder.reusable();
                }
                Err(cause) => {
                    self.fail(DispatchError::Internal(cause), responder, &mut latched)
                        .await;
                    self.drain(body, fill).await;
                    return responder.reusable();
                }
            }
        }

        let matched = match self.registry.resolve(parts.uri.path(), &parts.method) {
            Ok(matched) => matched,
            Err(err) => {
                self.fail(err, responder, &mut latched).await;
                self.drain(body, fill).await;
                return responder.reusable();
            }
        };

        let args = match bind_args(&matched.entry.params, &matched.groups, &parts) {
            Ok(args) => args,
            Err(err) => {
                self.fail(err.into_dispatch(), responder, &mut latched).await;
                self.drain(body, fill).await;
                return responder.reusable();
            }
        };

        let summary = RequestSummary::of(&parts);
        match matched.entry.handler.clone() {
            RouteHandler::Full(handler) => {
                self.run_aggregating(handler, parts, body, fill, responder, args, &summary, &mut latched)
                    .await
            }
            RouteHandler::Streaming(handler) => {
                self.run_streaming(handler, parts, body, fill, responder, args, &summary, &mut latched)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_aggregating<FP, FE>(
        &self,
        handler: Arc<dyn FullBodyHandler>,
        parts: Parts,
        mut body: HttpBody,
        fill: FP,
        responder: &mut Responder,
        args: BoundArgs,
        summary: &RequestSummary,
        latched: &mut bool,
    ) -> bool
    where
        FP: Future<Output = Result<(), FE>>,
        FE: Debug,
    {
        debug!("{} {} handled in aggregating mode", summary.method, summary.uri);
        let limit = self.settings.chunk_memory_limit;
        let collect = async {
            let mut buf = BytesMut::new();
            loop {
                match body.next_data().await {
                    Some(Ok(data)) => {
                        if buf.len() + data.len() > limit {
                            return Err(CollectFailure::OverLimit);
                        }
                        buf.extend_from_slice(&data);
                    }
                    Some(Err(e)) => return Err(CollectFailure::Transport(format!("{e:?}"))),
                    None => return Ok(buf.freeze()),
                }
            }
        };
        let collected = match self.with_body_timeout(Accompany::new(collect, fill)).await {
            Some((collected, fill_out)) => {
                if let Some(Err(e)) = fill_out {
                    debug!("request body feed ended with error: {e:?}");
                }
                collected
            }
            None => {
                warn!("timed out reading request body");
                return false;
            }
        };

        match collected {
            Ok(bytes) => {
                let request = Request::from_parts(parts, bytes);
                match handler.handle(request, responder, &args).await {
                    Ok(()) => {
                        if responder.is_fresh() {
                            self.fail(
                                DispatchError::Internal(anyhow!(
                                    "handler returned without writing a response"
                                )),
                                responder,
                                latched,
                            )
                            .await;
                        }
                    }
                    Err(cause) => {
                        self.dispatch_exception(cause, summary, responder, latched).await
                    }
                }
                responder.reusable()
            }
            Err(CollectFailure::OverLimit) => {
                self.fail(DispatchError::OverLimit(limit), responder, latched).await;
                false
            }
            Err(CollectFailure::Transport(msg)) => {
                let err = DispatchError::Disconnect(msg);
                err.log();
                *latched = true;
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_streaming<FP, FE>(
        &self,
        handler: Arc<dyn StreamingHandler>,
        parts: Parts,
        mut body: HttpBody,
        fill: FP,
        responder: &mut Responder,
        args: BoundArgs,
        summary: &RequestSummary,
        latched: &mut bool,
    ) -> bool
    where
        FP: Future<Output = Result<(), FE>>,
        FE: Debug,
    {
        debug!("{} {} handled in streaming mode", summary.method, summary.uri);
        let mut consumer = match handler.begin(&parts, responder, &args).await {
            Ok(Some(consumer)) => consumer,
            Ok(None) => {
                // immediate rejection: the handler already answered
                if responder.is_fresh() {
                    self.fail(
                        DispatchError::Internal(anyhow!(
                            "streaming handler rejected the request without writing a response"
                        )),
                        responder,
                        latched,
                    )
                    .await;
                }
                self.drain(body, fill).await;
                return false;
            }
            Err(cause) => {
                self.dispatch_exception(cause, summary, responder, latched).await;
                self.drain(body, fill).await;
                return responder.reusable();
            }
        };

        let deliver = async {
            loop {
                match body.next_data().await {
                    Some(Ok(data)) => {
                        if let Err(e) = consumer.chunk(data, responder).await {
                            return DeliverOutcome::ConsumerFailed(e);
                        }
                    }
                    Some(Err(e)) => {
                        return DeliverOutcome::Transport(anyhow!("request body failed: {e:?}"))
                    }
                    None => {
                        return match consumer.finished(responder).await {
                            Ok(()) => DeliverOutcome::Finished,
                            Err(e) => DeliverOutcome::ConsumerFailed(e),
                        };
                    }
                }
            }
        };
        let outcome = match self.with_body_timeout(Accompany::new(deliver, fill)).await {
            Some((outcome, fill_out)) => {
                if let Some(Err(e)) = fill_out {
                    debug!("request body feed ended with error: {e:?}");
                }
                outcome
            }
            None => DeliverOutcome::Transport(anyhow!("timed out reading request body")),
        };

        match outcome {
            DeliverOutcome::Finished => {
                if responder.is_fresh() {
                    self.fail(
                        DispatchError::Internal(anyhow!(
                            "body consumer finished without writing a response"
                        )),
                        responder,
                        latched,
                    )
                    .await;
                }
                responder.reusable()
            }
            DeliverOutcome::ConsumerFailed(cause) => {
                consumer.handle_error(&cause);
                self.dispatch_exception(cause, summary, responder, latched).await;
                false
            }
            DeliverOutcome::Transport(cause) => {
                let err = DispatchError::Disconnect(cause.to_string());
                err.log();
                *latched = true;
                consumer.handle_error(&cause);
                false
            }
        }
    }

    /// Writes the translation of an internal failure, respecting the
    /// per-request latch.
    async fn fail(&self, err: DispatchError, responder: &mut Responder, latched: &mut bool) {
        if *latched {
            trace!("suppressing subsequent failure: {err}");
            return;
        }
        *latched = true;
        err.log();
        if responder.headers_sent() {
            trace!("response already started; cannot translate failure onto the wire");
            if !responder.is_complete() {
                responder.abort();
            }
            return;
        }
        let status = match &err {
            DispatchError::OverLimit(_) => self.settings.over_limit_status,
            other => other.status(),
        };
        if let Err(e) = responder.send_status(status).await {
            warn!("failed to write error response: {e:?}");
        }
    }

    /// Routes a handler (or consumer) failure through the user exception
    /// handler, falling back to the built-in translation.
    async fn dispatch_exception(
        &self,
        cause: AnyError,
        summary: &RequestSummary,
        responder: &mut Responder,
        latched: &mut bool,
    ) {
        if *latched {
            trace!("suppressing subsequent failure: {cause:?}");
            return;
        }
        *latched = true;
        error!("handler for {} {} failed: {cause:?}", summary.method, summary.uri);
        if responder.headers_sent() {
            trace!("response already started; dropping error translation");
            if !responder.is_complete() {
                responder.abort();
            }
            return;
        }
        if let Some(handler) = &self.exception_handler {
            match handler.handle(&cause, summary, responder).await {
                Ok(()) => {
                    if responder.headers_sent() {
                        return;
                    }
                    // wrote nothing: fall through to the default translation
                }
                Err(e) => error!("user exception handler failed: {e:?}"),
            }
        }
        let body = exception_body(&cause);
        if let Err(e) = responder
            .send_string(StatusCode::INTERNAL_SERVER_ERROR, &body)
            .await
        {
            warn!("failed to write error response: {e:?}");
        }
    }

    /// Discards the rest of a request body so a keep-alive connection can
    /// continue with the next request.
    async fn drain<FP, FE>(&self, mut body: HttpBody, fill: FP)
    where
        FP: Future<Output = Result<(), FE>>,
        FE: Debug,
    {
        let discard = async {
            loop {
                match body.next_data().await {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        };
        match self.with_body_timeout(Accompany::new(discard, fill)).await {
            Some((_, Some(Err(e)))) => trace!("discarded request body ended with error: {e:?}"),
            Some(_) => {}
            None => trace!("timed out draining a discarded request body"),
        }
    }

    async fn with_body_timeout<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        match self.settings.read_body_timeout {
            Some(timeout) => monoio::time::timeout(timeout, fut).await.ok(),
            None => Some(fut.await),
        }
    }
}

impl<S, CX> Service<(S, CX)> for PipelineService
where
    S: Split + AsyncReadRent + AsyncWriteRent + 'static,
    CX: ParamRef<PeerAddr>,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (stream, ctx): (S, CX)) -> Result<Self::Response, Self::Error> {
        let peer = ParamRef::<PeerAddr>::param_ref(&ctx).0;
        self.drive_connection(stream, peer).await;
        Ok(())
    }
}

// PipelineService is a Service and its own MakeService.
impl MakeService for PipelineService {
    type Service = PipelineService;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}

impl AsyncMakeService for PipelineService {
    type Service = PipelineService;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(self.clone())
    }
}
