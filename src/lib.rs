//! superduperfeeder: a WebSub (PubSubHubbub) hub with a fallback
//! polling engine.
//!
//! Three services share one data plane (store + queue):
//!
//! - the [`hub`] protocol engine: subscription lifecycle, verification,
//!   publish ingestion, and content fan-out;
//! - the [`external`] client: hub discovery, outbound subscriptions,
//!   lease renewal, and user-callback relays;
//! - the [`poller`]: conditional-GET scheduling, change detection, and
//!   synthesized publish notifications for hubless feeds.
//!
//! The [`server`] module is the HTTP adapter over all three; the
//! [`queue`] worker drives the asynchronous halves.

pub mod config;
pub mod external;
pub mod feed;
pub mod hub;
pub mod poller;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod util;

pub use config::Config;
pub use server::AppState;
