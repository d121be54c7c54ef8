//! Per-thread sampling gate.
//!
//! Every hook call asks `sample()` whether to take the guarded path. Each
//! thread counts down from a geometrically distributed start, so the gaps
//! between sampled calls have mean `frequency` and the first allocation of
//! a thread is no more likely to be sampled than any other.

use crate::platform;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;
use std::thread::LocalKey;

/// Thread-local countdown storage for a `SamplingState`.
///
/// ```ignore
/// thread_local! {
///     static SAMPLES_LEFT: Cell<usize> = const { Cell::new(0) };
/// }
/// static SAMPLING: SamplingState = SamplingState::new(&SAMPLES_LEFT);
/// ```
pub type Countdown = LocalKey<Cell<usize>>;

pub struct SamplingState {
    frequency: AtomicUsize,
    countdown: &'static Countdown,
}

impl SamplingState {
    pub const fn new(countdown: &'static Countdown) -> Self {
        SamplingState {
            frequency: AtomicUsize::new(0),
            countdown,
        }
    }

    /// Set the sampling denominator. Call once, before the first `sample`.
    pub fn init(&self, frequency: usize) {
        self.frequency.store(frequency, Ordering::Relaxed);
    }

    /// True for roughly one call in `frequency`.
    #[inline]
    pub fn sample(&self) -> bool {
        let frequency = self.frequency.load(Ordering::Relaxed);
        match frequency {
            0 => false,
            1 => true,
            _ => self
                .countdown
                .try_with(|left| {
                    let mut n = left.get();
                    if n == 0 {
                        n = next_sample_distance(frequency);
                    }
                    n -= 1;
                    left.set(n);
                    n == 0
                })
                .unwrap_or(false),
        }
    }
}

/// Draw from the geometric distribution with mean `frequency`: the number
/// of calls up to and including the next sampled one. Always at least 1.
fn next_sample_distance(frequency: usize) -> usize {
    let u = platform::random_unit();
    let p = 1.0 / frequency as f64;
    let draw = (u.ln() / (-p).ln_1p()).ceil();
    if draw.is_nan() || draw < 1.0 {
        1
    } else if draw >= usize::MAX as f64 {
        usize::MAX
    } else {
        draw as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! sampling_state {
        ($name:ident) => {{
            thread_local! {
                static $name: Cell<usize> = const { Cell::new(0) };
            }
            SamplingState::new(&$name)
        }};
    }

    #[test]
    fn uninitialised_never_samples() {
        let state = sampling_state!(LEFT);
        assert!((0..10_000).all(|_| !state.sample()));
    }

    #[test]
    fn frequency_one_samples_everything() {
        let state = sampling_state!(LEFT);
        state.init(1);
        assert!((0..10_000).all(|_| state.sample()));
    }

    #[test]
    fn rate_matches_frequency() {
        let state = sampling_state!(LEFT);
        state.init(1000);
        let hits = (0..100_000).filter(|_| state.sample()).count();
        assert!((50..=150).contains(&hits), "{hits} samples");
    }

    #[test]
    fn threads_count_independently() {
        thread_local! {
            static LEFT: Cell<usize> = const { Cell::new(0) };
        }
        static STATE: SamplingState = SamplingState::new(&LEFT);
        STATE.init(64);
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..64_000).filter(|_| STATE.sample()).count()))
            .collect();
        for handle in handles {
            let hits = handle.join().unwrap();
            assert!((500..=1500).contains(&hits), "{hits} samples");
        }
    }

    #[test]
    fn distance_is_at_least_one() {
        for frequency in [2, 10, 1000, usize::MAX] {
            for _ in 0..1000 {
                assert!(next_sample_distance(frequency) >= 1);
            }
        }
    }
}
