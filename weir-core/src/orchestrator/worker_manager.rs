use std::{fmt::Debug, net::SocketAddr, rc::Rc, sync::Arc, thread::JoinHandle, time::Duration};

use futures_channel::oneshot::{channel as ochannel, Sender as OSender};
use monoio::{blocking::DefaultThreadPool, net::TcpStream, utils::bind_to_cpu_set};
use service_async::{MakeService, Service};
use tracing::{error, warn};

use super::{serve, ConnTracker, RuntimeWrapper};
use crate::{config::RuntimeConfig, listener::ListenerBuilder};

/// Handle to a spawned worker: the thread join handle plus its one-shot
/// stop signal.
pub struct WorkerHandle {
    pub join: JoinHandle<()>,
    stop: Option<OSender<()>>,
}

impl WorkerHandle {
    /// Asks the worker to leave its accept loop. Idempotent.
    pub fn signal_stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns and tracks the I/O worker fleet.
///
/// Each worker thread is optionally pinned to a CPU core, builds its own
/// runtime from the [`RuntimeConfig`], its own listener from the shared
/// [`ListenerBuilder`] and its own service instance from the shared
/// factory, then runs the accept loop until stopped. On stop the worker
/// waits for in-flight connections bounded by the grace period before the
/// thread exits.
pub struct WorkerManager {
    runtime_config: RuntimeConfig,
    thread_pool: Option<Box<DefaultThreadPool>>,
}

impl WorkerManager {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        let thread_pool = runtime_config
            .exec_threads
            .map(|tn| Box::new(DefaultThreadPool::new(tn)));
        Self {
            runtime_config,
            thread_pool,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    pub fn spawn_workers<F>(
        &mut self,
        factory: Arc<F>,
        listener_builder: Arc<ListenerBuilder>,
        grace: Duration,
    ) -> Vec<WorkerHandle>
    where
        F: MakeService + Send + Sync + 'static,
        F::Service: Service<(TcpStream, SocketAddr)> + 'static,
        <F::Service as Service<(TcpStream, SocketAddr)>>::Error: Debug,
        F::Error: Debug,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        let runtime_config = Arc::new(self.runtime_config.clone());
        (0..self.runtime_config.worker_threads)
            .map(|worker_id| {
                let thread_pool = self.thread_pool.clone();
                let runtime_config = runtime_config.clone();
                let factory = factory.clone();
                let listener_builder = listener_builder.clone();
                let (stop_tx, stop_rx) = ochannel::<()>();
                let join = std::thread::Builder::new()
                    .name(format!("weir-worker-{worker_id}"))
                    .spawn(move || {
                        // bind thread to cpu core
                        if let Some(cores) = cores {
                            let core = worker_id % cores;
                            if let Err(e) = bind_to_cpu_set([core]) {
                                warn!("bind thread {worker_id} to core {core} failed: {e}");
                            }
                        }
                        let mut runtime = RuntimeWrapper::new(
                            runtime_config.as_ref(),
                            thread_pool.map(|p| p as Box<_>),
                        );
                        runtime.block_on(async move {
                            let svc = match factory.make_via_ref(None) {
                                Ok(svc) => Rc::new(svc),
                                Err(e) => {
                                    error!("worker {worker_id} failed to build service: {e:?}");
                                    return;
                                }
                            };
                            let listener = match listener_builder.build() {
                                Ok(listener) => listener,
                                Err(e) => {
                                    error!("worker {worker_id} failed to bind listener: {e:?}");
                                    return;
                                }
                            };
                            let conns = ConnTracker::default();
                            serve(listener, svc, stop_rx, conns.clone()).await;
                            conns.drain(grace).await;
                        });
                    })
                    .expect("start worker thread failed");
                WorkerHandle {
                    join,
                    stop: Some(stop_tx),
                }
            })
            .collect()
    }
}
