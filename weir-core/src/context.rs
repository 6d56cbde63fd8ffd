//! Typed per-connection context.
//!
//! The context is a `certain_map` whose entries are filled in by services
//! early in the connection stack (currently only the peer address) and read
//! by anything downstream through `ParamRef`.

use std::net::SocketAddr;

use derive_more::{From, Into};

#[derive(From, Into, Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

certain_map::certain_map! {
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[style = "unfilled"]
    pub struct Context {
        peer_addr: PeerAddr,
    }
}
