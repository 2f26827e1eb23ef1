//! Keel kubehub: the cluster side of the store contracts.
//!
//! Typed `Api<K>` clients behind [`ResourceClient`](keel_store::ResourceClient), reflector stores
//! behind [`ObjectCache`](keel_store::ObjectCache), watch streams feeding the router, the event
//! recorder and a Lease-based elector.

#![forbid(unsafe_code)]

mod cache;
mod client;
mod events;
mod lease;
mod watch;

pub use cache::ReflectorCache;
pub use client::{classify, KubeClient};
pub use events::KubeEventSink;
pub use lease::{LeaseElector, LeaseSettings};
pub use watch::{Watch, WatchScope};
