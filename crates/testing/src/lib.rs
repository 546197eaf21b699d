//! Test fixtures for clusters of realtime servers.
//!
//! [`setup`] starts several [`relay_realtime::Server`] instances tied together
//! through one broker, connects a client to each and hands back everything in
//! a [`TestContext`] once every server has accepted its client. The
//! [`Cleanup`] inside the context releases all of it again.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cluster;
mod error;
mod times;

pub use cluster::{
    Cleanup, ClusterBootstrap, ClusterOptions, TestContext, setup, setup_with_options,
};
pub use error::Error;
pub use times::{Times, times};

use std::time::Duration;

/// Resolves after `duration` has elapsed.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
