//! Worker fleet orchestration.
//!
//! The framework is thread-per-core: [`WorkerManager`] spawns one OS thread
//! per I/O worker, each running its own runtime, its own listener instance
//! and its own copy of the connection service built from a shared factory.
//! [`serve`] is the per-worker accept loop; every accepted connection is
//! handled by a spawned task tracked by a [`ConnTracker`] so that shutdown
//! can wait for in-flight connections to drain.

use std::{cell::Cell, fmt::Debug, rc::Rc, time::Duration};

use futures_channel::oneshot::Receiver as OReceiver;
use monoio::io::stream::Stream;
use service_async::Service;
use tracing::{debug, error, info, warn};

mod runtime;
mod worker_manager;

pub use runtime::{BlockingPool, RuntimeWrapper};
pub use worker_manager::{WorkerHandle, WorkerManager};

/// Counts live connection tasks on a worker.
#[derive(Clone, Default)]
pub struct ConnTracker(Rc<Cell<usize>>);

impl ConnTracker {
    pub fn guard(&self) -> ConnGuard {
        self.0.set(self.0.get() + 1);
        ConnGuard(self.0.clone())
    }

    pub fn active(&self) -> usize {
        self.0.get()
    }

    /// Waits until all tracked connections have finished, bounded by the
    /// grace period.
    pub async fn drain(&self, grace: Duration) {
        let deadline = std::time::Instant::now() + grace;
        while self.active() > 0 {
            if std::time::Instant::now() >= deadline {
                warn!(
                    "shutdown grace period elapsed with {} connections still active",
                    self.active()
                );
                return;
            }
            monoio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

pub struct ConnGuard(Rc<Cell<usize>>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// Per-worker accept loop.
///
/// Runs until the stop signal fires or the listener closes. Each accepted
/// connection is handled on its own task using the shared service.
pub async fn serve<S, Svc, A, E>(
    mut listener: S,
    handler: Rc<Svc>,
    mut stop: OReceiver<()>,
    conns: ConnTracker,
) where
    S: Stream<Item = Result<A, E>> + 'static,
    E: Debug,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    loop {
        monoio::select! {
            _ = &mut stop => {
                info!("worker is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        let svc = handler.clone();
                        let guard = conns.guard();
                        monoio::spawn(async move {
                            let _guard = guard;
                            match svc.call(accept).await {
                                Ok(_) => {
                                    debug!("connection complete");
                                }
                                Err(e) => {
                                    error!("connection error: {e:?}");
                                }
                            }
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e:?}"),
                }
            }
        }
    }
}
