//! Keel store: the reconciliation engine.
//!
//! Watch notifications enter through the [`EventRouter`], receivers turn them into keys on a
//! [`WorkQueue`], and a [`Controller`] runs N workers per queue that call a [`Reconciler`] and act
//! on its [`Outcome`](keel_core::Outcome). The [`Manager`] starts pools only once caches are
//! synced and leadership is held, and drains them when either goes away.

#![forbid(unsafe_code)]

pub mod client;
pub mod clock;
pub mod events;
pub mod leader;
pub mod manager;
pub mod policy;
pub mod pool;
pub mod queue;
pub mod router;
pub mod timers;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{delete_if_present, Handle, ObjectCache, ResourceClient};
pub use clock::{Clock, SystemClock};
pub use events::{EventSink, Report, ReportType};
pub use leader::{leader_gate, Fenced, LeaderGate, LeaderSignal};
pub use manager::{Manager, Stop};
pub use policy::{Policy, PolicyRegistry};
pub use pool::{apply_outcome, Controller, Reconciler};
pub use queue::{RateLimit, WorkQueue};
pub use router::{EventRouter, Kind, Notification, Object, Receiver, Watched};
pub use timers::TimerRegistry;
