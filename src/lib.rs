//! Offline support for a web storefront.
//!
//! The engine sits between storefront pages and the network. It answers
//! intercepted requests from versioned cache partitions when the network is
//! unreachable, stages cart and wishlist mutations for replay once
//! connectivity returns, and turns push payloads into order notifications.

pub mod cache;
pub mod config;
pub mod control;
pub mod engine;
pub mod event;
pub mod host;
pub mod http;
pub mod net;
pub mod notify;
pub mod router;
pub mod sync;

pub use config::Config;
pub use engine::{Engine, Lifecycle, Platform};
pub use event::{Dispatcher, Envelope, Event, Outcome, Report};
