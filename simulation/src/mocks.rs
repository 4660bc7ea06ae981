//! A mock implementation of [Clock] for testing hosts that insert simulated delays.

use crate::Clock;
use futures::future::ready;
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

/// A [Clock] that records every requested sleep and resolves immediately.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Recorder {
    /// Create a recorder with no recorded sleeps.
    pub fn new() -> Self {
        Self::default()
    }

    /// All sleeps requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// Sum of all sleeps requested so far.
    pub fn total(&self) -> Duration {
        self.sleeps.lock().unwrap().iter().sum()
    }
}

impl Clock for Recorder {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        self.sleeps.lock().unwrap().push(duration);
        ready::<()>(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_sleeps() {
        let recorder = Recorder::new();
        let clone = recorder.clone();
        futures::executor::block_on(async {
            clone.sleep(Duration::from_millis(3)).await;
            clone.sleep(Duration::from_millis(4)).await;
        });
        assert_eq!(
            recorder.sleeps(),
            vec![Duration::from_millis(3), Duration::from_millis(4)]
        );
        assert_eq!(recorder.total(), Duration::from_millis(7));
    }
}
