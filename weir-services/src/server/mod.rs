//! Building and running a complete HTTP service.
//!
//! [`HttpServiceBuilder`] is the registration surface: handler objects,
//! the aggregation cap, the optional exception handler and URL rewriter,
//! TLS, pool sizing and the bind address. `build()` resolves all handler
//! declarations into the routing table — declaration mistakes fail here,
//! not at request time — and yields an [`HttpService`] whose lifecycle is
//! `start` → `stop`, with [`HttpService::state`] reporting where it is.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use monoio::net::ListenerOpts;
use service_async::{stack::FactoryStack, Param};
use tracing::info;
use weir_core::{
    bail_into,
    config::{RuntimeConfig, DEFAULT_SHUTDOWN_GRACE},
    context::EmptyContext,
    listener::ListenerBuilder,
    orchestrator::{WorkerHandle, WorkerManager},
    AnyResult,
};

use crate::{
    common::ContextService,
    http::{
        handler::{ExceptionHandler, HandlerSet, UrlRewriter},
        pipeline::{PipelineService, PipelineSettings},
        registry::ResourceRegistry,
    },
};

/// Lifecycle states of an [`HttpService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
}

/// Per-worker factory configuration handed to the service stack.
pub(crate) struct SiteConfig {
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) settings: PipelineSettings,
    pub(crate) rewriter: Option<Arc<dyn UrlRewriter>>,
    pub(crate) exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

impl Param<Arc<ResourceRegistry>> for SiteConfig {
    fn param(&self) -> Arc<ResourceRegistry> {
        self.registry.clone()
    }
}

impl Param<PipelineSettings> for SiteConfig {
    fn param(&self) -> PipelineSettings {
        self.settings.clone()
    }
}

impl Param<Option<Arc<dyn UrlRewriter>>> for SiteConfig {
    fn param(&self) -> Option<Arc<dyn UrlRewriter>> {
        self.rewriter.clone()
    }
}

impl Param<Option<Arc<dyn ExceptionHandler>>> for SiteConfig {
    fn param(&self) -> Option<Arc<dyn ExceptionHandler>> {
        self.exception_handler.clone()
    }
}

#[cfg(feature = "tls")]
pub(crate) struct TlsSiteConfig {
    pub(crate) site: SiteConfig,
    pub(crate) identity: native_tls::Identity,
}

#[cfg(feature = "tls")]
impl Param<native_tls::Identity> for TlsSiteConfig {
    fn param(&self) -> native_tls::Identity {
        self.identity.clone()
    }
}

#[cfg(feature = "tls")]
impl Param<Arc<ResourceRegistry>> for TlsSiteConfig {
    fn param(&self) -> Arc<ResourceRegistry> {
        self.site.param()
    }
}

#[cfg(feature = "tls")]
impl Param<PipelineSettings> for TlsSiteConfig {
    fn param(&self) -> PipelineSettings {
        self.site.param()
    }
}

#[cfg(feature = "tls")]
impl Param<Option<Arc<dyn UrlRewriter>>> for TlsSiteConfig {
    fn param(&self) -> Option<Arc<dyn UrlRewriter>> {
        self.site.param()
    }
}

#[cfg(feature = "tls")]
impl Param<Option<Arc<dyn ExceptionHandler>>> for TlsSiteConfig {
    fn param(&self) -> Option<Arc<dyn ExceptionHandler>> {
        self.site.param()
    }
}

/// Builder for an [`HttpService`].
pub struct HttpServiceBuilder {
    handlers: Vec<Arc<dyn HandlerSet>>,
    settings: PipelineSettings,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    rewriter: Option<Arc<dyn UrlRewriter>>,
    runtime: RuntimeConfig,
    host: String,
    port: u16,
    shutdown_grace: Duration,
    modify_pipeline: Option<Box<dyn Fn(&mut PipelineSettings) + Send + Sync>>,
    #[cfg(feature = "tls")]
    tls: Option<weir_core::tls::TlsConfig>,
}

impl Default for HttpServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpServiceBuilder {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            settings: PipelineSettings::default(),
            exception_handler: None,
            rewriter: None,
            runtime: RuntimeConfig::default(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            modify_pipeline: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Appends handler objects to the set served by this service.
    pub fn add_http_handlers(
        mut self,
        handlers: impl IntoIterator<Item = Arc<dyn HandlerSet>>,
    ) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Caps the buffered size of aggregated request bodies.
    pub fn set_http_chunk_limit(mut self, bytes: usize) -> Self {
        self.settings.chunk_memory_limit = bytes;
        self
    }

    pub fn set_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn set_url_rewriter(mut self, rewriter: Arc<dyn UrlRewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    #[cfg(feature = "tls")]
    pub fn enable_ssl(mut self, config: weir_core::tls::TlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    /// Escape hatch: adjusts the pipeline settings the workers will run
    /// with, after all other builder options have been applied.
    pub fn modify_pipeline(
        mut self,
        f: impl Fn(&mut PipelineSettings) + Send + Sync + 'static,
    ) -> Self {
        self.modify_pipeline = Some(Box::new(f));
        self
    }

    pub fn set_boss_thread_pool_size(mut self, n: usize) -> Self {
        self.runtime.boss_threads = n;
        self
    }

    pub fn set_worker_thread_pool_size(mut self, n: usize) -> Self {
        self.runtime.worker_threads = n;
        self
    }

    pub fn set_exec_thread_pool_size(mut self, n: usize) -> Self {
        self.runtime.exec_threads = (n > 0).then_some(n);
        self
    }

    pub fn set_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn set_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn set_keepalive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.keepalive_timeout = timeout;
        self
    }

    pub fn set_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Resolves all handler declarations and produces a startable service.
    pub fn build(mut self) -> AnyResult<HttpService> {
        if let Some(modify) = &self.modify_pipeline {
            modify(&mut self.settings);
        }
        let registry = Arc::new(ResourceRegistry::build(&self.handlers)?);
        let addr = format!("{}:{}", self.host, self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow!("cannot resolve bind address {}:{}", self.host, self.port))?;
        #[cfg(feature = "tls")]
        let identity = match &self.tls {
            Some(config) => Some(config.load_identity()?),
            None => None,
        };
        Ok(HttpService {
            state: ServiceState::New,
            addr,
            registry,
            settings: self.settings,
            rewriter: self.rewriter,
            exception_handler: self.exception_handler,
            runtime: self.runtime,
            shutdown_grace: self.shutdown_grace,
            workers: Vec::new(),
            #[cfg(feature = "tls")]
            identity,
        })
    }
}

/// A built HTTP service: bind address, routing table and worker fleet.
pub struct HttpService {
    state: ServiceState,
    addr: SocketAddr,
    registry: Arc<ResourceRegistry>,
    settings: PipelineSettings,
    rewriter: Option<Arc<dyn UrlRewriter>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    runtime: RuntimeConfig,
    shutdown_grace: Duration,
    workers: Vec<WorkerHandle>,
    #[cfg(feature = "tls")]
    identity: Option<native_tls::Identity>,
}

impl HttpService {
    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn route_count(&self) -> usize {
        self.registry.len()
    }

    /// Binds and spawns the worker fleet.
    pub fn start(&mut self) -> AnyResult<()> {
        if self.state != ServiceState::New {
            bail_into!("service cannot start from state {:?}", self.state);
        }
        self.state = ServiceState::Starting;
        let listener_builder = Arc::new(ListenerBuilder::bind_tcp(
            self.addr,
            ListenerOpts::default(),
        ));
        // probe the bind so configuration errors surface here instead of
        // on the workers
        if let Err(e) = listener_builder.build() {
            self.state = ServiceState::New;
            return Err(e.into());
        }

        let site = SiteConfig {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            rewriter: self.rewriter.clone(),
            exception_handler: self.exception_handler.clone(),
        };
        let mut manager = WorkerManager::new(self.runtime.clone());

        #[cfg(feature = "tls")]
        if let Some(identity) = self.identity.clone() {
            let stack = FactoryStack::new(TlsSiteConfig { site, identity })
                .push(PipelineService::layer())
                .push(crate::tls::NativeTlsServiceFactory::layer())
                .push(ContextService::<EmptyContext, _>::layer());
            let factory = Arc::new(stack.into_inner());
            self.workers = manager.spawn_workers(factory, listener_builder, self.shutdown_grace);
            self.state = ServiceState::Running;
            info!("https service listening on {}", self.addr);
            return Ok(());
        }

        let stack = FactoryStack::new(site)
            .push(PipelineService::layer())
            .push(ContextService::<EmptyContext, _>::layer());
        let factory = Arc::new(stack.into_inner());
        self.workers = manager.spawn_workers(factory, listener_builder, self.shutdown_grace);
        self.state = ServiceState::Running;
        info!("http service listening on {}", self.addr);
        Ok(())
    }

    /// Stops accepting, drains in-flight connections bounded by the grace
    /// period, and joins every worker thread.
    pub fn stop(&mut self) {
        if matches!(self.state, ServiceState::Terminated | ServiceState::New) {
            self.state = ServiceState::Terminated;
            return;
        }
        self.state = ServiceState::Stopping;
        for worker in &mut self.workers {
            worker.signal_stop();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join.join();
        }
        self.state = ServiceState::Terminated;
        info!("http service terminated");
    }

    /// Blocks the calling thread until every worker exits.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            let _ = worker.join.join();
        }
    }
}
