pub type AnyError = anyhow::Error;

pub mod common;
pub mod http;
pub mod server;
#[cfg(feature = "tls")]
pub mod tls;
