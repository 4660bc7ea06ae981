//! A [crate::Clock] backed by [Tokio](https://tokio.rs) timers.

use std::{future::Future, time::Duration};

/// Implementation of [crate::Clock] for the `tokio` runtime.
///
/// Sleeping requires a running `tokio` runtime with the time driver enabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct Context;

impl crate::Clock for Context {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        tokio::time::sleep(duration)
    }
}
