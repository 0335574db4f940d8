//! Lifecycle controller
//!
//! Dispatches observed cluster changes to the handler entry points and
//! holds the shared [`Context`] the handlers run against.

mod cluster;

pub use cluster::Context;
