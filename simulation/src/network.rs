//! Model a lossy, rate-limited link.
//!
//! Transmission delay is the serialization time of a payload over a link of the
//! given rate (in gigabits per second). Corruption routes the payload through
//! [crate::fault] as an array of bytes.

use crate::{config::Resolver, fault, Clock, SimulationConfig};
use bytes::Bytes;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::trace;

/// Bits per second in one gigabit per second.
const BITS_PER_GIGABIT: f64 = 1e9;

/// Seconds needed to serialize `byte_len` bytes over a `gbps` link.
///
/// Returns `0` if the rate is absent, non-positive, or not finite.
pub fn transmission_delay_seconds(byte_len: usize, gbps: Option<f64>) -> f64 {
    match gbps {
        Some(gbps) if gbps > 0.0 && gbps.is_finite() => {
            byte_len as f64 * 8.0 / (gbps * BITS_PER_GIGABIT)
        }
        _ => 0.0,
    }
}

/// [transmission_delay_seconds] as a [Duration] (saturating at [Duration::MAX]).
pub fn transmission_delay(byte_len: usize, gbps: Option<f64>) -> Duration {
    Duration::try_from_secs_f64(transmission_delay_seconds(byte_len, gbps))
        .unwrap_or(Duration::MAX)
}

/// Flip each bit of `data` independently with probability `ber`.
pub fn corrupt_bytes(data: &[u8], ber: Option<f64>, seed: Option<u64>) -> Bytes {
    Bytes::from(fault::flip_elements(data, ber, seed))
}

/// Wait for the transmission delay of `byte_len` bytes over a `gbps` link.
///
/// A zero delay completes on first poll without touching the clock.
pub fn throttle<C: Clock>(
    clock: &C,
    byte_len: usize,
    gbps: Option<f64>,
) -> impl Future<Output = ()> + Send + 'static {
    let delay = transmission_delay(byte_len, gbps);
    let clock = clock.clone();
    async move {
        if delay.is_zero() {
            return;
        }
        trace!(byte_len, ?delay, "throttling transmission");
        clock.sleep(delay).await;
    }
}

/// A simulated link gated by the active simulation profile.
#[derive(Clone)]
pub struct Network<C: Clock> {
    clock: C,
    resolver: Arc<Resolver>,
}

impl<C: Clock> Network<C> {
    pub fn new(clock: C, resolver: Arc<Resolver>) -> Self {
        Self { clock, resolver }
    }

    /// Return the active profile, if simulation is enabled.
    pub fn active(&self) -> Option<&SimulationConfig> {
        self.resolver.active()
    }

    /// Wait for the transmission delay of `byte_len` bytes (no-op when inactive).
    pub fn throttle(
        &self,
        byte_len: usize,
        gbps: Option<f64>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let gbps = self.active().and(gbps);
        throttle(&self.clock, byte_len, gbps)
    }

    /// Corrupt `data` with the active profile's bit error rate and seed.
    pub fn corrupt(&self, data: &[u8]) -> Bytes {
        match self.active() {
            Some(config) => corrupt_bytes(data, config.ber, config.seed),
            None => Bytes::copy_from_slice(data),
        }
    }

    /// Deliver `payload` over the link: wait for its transmission delay, then corrupt it.
    ///
    /// When simulation is inactive, `payload` is returned as-is without any delay.
    pub async fn transmit(&self, payload: Bytes, gbps: Option<f64>) -> Bytes {
        let Some(config) = self.active() else {
            return payload;
        };
        throttle(&self.clock, payload.len(), gbps).await;
        match config.ber {
            Some(ber) if ber > 0.0 => corrupt_bytes(&payload, Some(ber), config.seed),
            _ => payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Recorder;
    use futures::FutureExt;
    use test_case::test_case;

    fn network(config: SimulationConfig) -> (Recorder, Network<Recorder>) {
        let recorder = Recorder::new();
        let network = Network::new(recorder.clone(), Arc::new(Resolver::fixed(config)));
        (recorder, network)
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(diff <= Duration::from_nanos(1), "{actual:?} != {expected:?}");
    }

    fn lossy(ber: f64) -> SimulationConfig {
        SimulationConfig {
            enable: true,
            seed: Some(1),
            ber: Some(ber),
            ..Default::default()
        }
    }

    #[test]
    fn test_unit_delay() {
        let seconds = transmission_delay_seconds(125_000_000, Some(1.0));
        assert!((seconds - 1.0).abs() < 1e-12);
        assert_close(transmission_delay(1000, Some(1.0)), Duration::from_micros(8));
    }

    #[test_case(None; "absent")]
    #[test_case(Some(0.0); "zero")]
    #[test_case(Some(-10.0); "negative")]
    #[test_case(Some(f64::NAN); "nan")]
    #[test_case(Some(f64::INFINITY); "infinite")]
    fn test_no_delay(gbps: Option<f64>) {
        assert_eq!(transmission_delay_seconds(1 << 20, gbps), 0.0);
        assert_eq!(transmission_delay(1 << 20, gbps), Duration::ZERO);
    }

    #[test]
    fn test_saturating_delay() {
        assert_eq!(
            transmission_delay(usize::MAX, Some(f64::MIN_POSITIVE)),
            Duration::MAX
        );
    }

    #[test]
    fn test_corrupt_bytes() {
        let data = b"simulated payload";
        assert_eq!(corrupt_bytes(data, None, None).as_ref(), data);
        assert_eq!(corrupt_bytes(data, Some(0.0), None).as_ref(), data);
        assert!(corrupt_bytes(&[], Some(0.5), None).is_empty());

        let inverted: Vec<u8> = data.iter().map(|byte| !byte).collect();
        assert_eq!(corrupt_bytes(data, Some(1.0), None).as_ref(), inverted);

        assert_eq!(
            corrupt_bytes(data, Some(0.3), Some(17)),
            corrupt_bytes(data, Some(0.3), Some(17))
        );
    }

    #[test]
    fn test_zero_throttle_does_not_suspend() {
        let recorder = Recorder::new();
        assert!(throttle(&recorder, 4096, None).now_or_never().is_some());
        assert!(throttle(&recorder, 0, Some(10.0)).now_or_never().is_some());
        assert!(recorder.sleeps().is_empty());
    }

    #[test]
    fn test_throttle_sleeps() {
        let recorder = Recorder::new();
        throttle(&recorder, 1000, Some(1.0)).now_or_never().unwrap();
        let sleeps = recorder.sleeps();
        assert_eq!(sleeps.len(), 1);
        assert_close(sleeps[0], Duration::from_micros(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_tokio() {
        let start = tokio::time::Instant::now();
        throttle(&crate::tokio::Context, 125_000_000, Some(10.0)).await;
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[test]
    fn test_inactive_network() {
        let (recorder, network) = network(SimulationConfig {
            enable: false,
            ber: Some(1.0),
            ..Default::default()
        });
        assert!(network.active().is_none());

        let payload = Bytes::from_static(b"untouched");
        let delivered = network
            .transmit(payload.clone(), Some(1.0))
            .now_or_never()
            .unwrap();
        assert_eq!(delivered, payload);
        assert_eq!(network.corrupt(&payload), payload);
        network.throttle(1 << 30, Some(1.0)).now_or_never().unwrap();
        assert!(recorder.sleeps().is_empty());
    }

    #[test]
    fn test_transmit() {
        let (recorder, network) = network(lossy(1.0));
        let payload = Bytes::from(vec![0u8; 1000]);
        let delivered = network
            .transmit(payload, Some(1.0))
            .now_or_never()
            .unwrap();
        assert!(delivered.iter().all(|byte| *byte == u8::MAX));
        assert_close(recorder.total(), Duration::from_micros(8));
    }

    #[test]
    fn test_transmit_without_ber() {
        let (recorder, network) = network(SimulationConfig {
            enable: true,
            ..Default::default()
        });
        let payload = Bytes::from_static(b"clean");
        let delivered = network.transmit(payload.clone(), None).now_or_never().unwrap();
        assert_eq!(delivered, payload);
        assert!(recorder.sleeps().is_empty());
    }

    #[test]
    fn test_corrupt_is_reproducible() {
        let (_, network) = network(lossy(0.2));
        let payload = [0x5au8; 64];
        assert_eq!(network.corrupt(&payload), network.corrupt(&payload));
        assert_ne!(network.corrupt(&payload).as_ref(), payload);
    }
}
