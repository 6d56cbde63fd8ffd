#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod context;
pub mod listener;
pub mod orchestrator;
#[cfg(feature = "tls")]
pub mod tls;
