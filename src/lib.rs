//! Courier: forwards chat messages from an event source to one delivery
//! backend.
//!
//! Events flow `EventSource → filter → DeliveryQueue → Dispatcher → SinkAdapter`.
//! [`service::ForwarderService`] owns the lifecycle; everything else is a
//! building block that can be used and tested on its own.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod event;
pub mod filter;
pub mod logging;
pub mod queue;
pub mod service;
pub mod sinks;
pub mod source;
pub mod stats;
