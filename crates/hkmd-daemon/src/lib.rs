//! Lifecycle coordinator library target.
//!
//! `main.rs` is intentionally thin: it loads configuration and a gateway
//! adapter, then hands both to [`run`]. Everything else — bootstrap order,
//! signal handling, graceful drain — lives in [`lifecycle`].

pub mod gateway_stub;
pub mod lifecycle;

pub use lifecycle::{run, run_with_options, LifecycleOptions};
