use std::{io, net::SocketAddr};

use monoio::{
    io::stream::Stream,
    net::{ListenerOpts, TcpListener, TcpStream},
};
use service_async::MakeService;

/// Factory for per-worker TCP listeners.
///
/// Every worker thread builds its own listener from the same builder; the
/// listener options let the kernel distribute accepted connections across
/// the workers.
pub struct ListenerBuilder {
    addr: SocketAddr,
    opts: ListenerOpts,
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> ListenerBuilder {
        Self { addr, opts }
    }

    pub fn build(&self) -> io::Result<Listener> {
        TcpListener::bind_with_config(self.addr, &self.opts).map(Listener)
    }
}

impl MakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

/// An accepting TCP listener, exposed as a stream of accepted connections.
pub struct Listener(TcpListener);

impl Stream for Listener {
    type Item = io::Result<(TcpStream, SocketAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        self.0.next().await
    }
}
