//! The `client` module holds the process-level [`Session`].
//!
//! Applications create one session from their settings and obtain consumers
//! and producers from it. The session resolves destinations into shared
//! channel sets and owns the client identity and dispatcher they use.

mod session;

pub use session::Session;
