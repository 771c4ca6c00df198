//! Context tree and per-thread context
//!
//! - `tree`: shared, append-only arena of `(attribute, value, parent)` nodes
//! - `thread`: a thread's cursor into the tree (begin/end/current)

pub mod thread;
pub mod tree;

pub use thread::ThreadContext;
pub use tree::{Ancestors, ContextTree, Node, NodeRef};
