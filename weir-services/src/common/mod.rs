//! Generic connection-level services shared by the protocol stack.

mod context;

pub use context::ContextService;

/// An accepted connection paired with its (typed) context.
pub type Accept<S, CX> = (S, CX);
