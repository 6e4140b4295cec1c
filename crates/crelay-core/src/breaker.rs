use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::account::AccountId;

const BUCKET_COUNT: usize = 6;
const BUCKET_SPAN: Duration = Duration::from_secs(5);
const MIN_SAMPLES: u64 = 5;
const BASE_OPEN: Duration = Duration::from_secs(30);
const MAX_OPEN: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { window: Window },
    Open { until: Instant, generation: u32 },
    HalfOpen { probing: bool, generation: u32 },
}

/// Rolling 30s window of outcomes, bucketed so old samples age out
/// without timestamping every call.
#[derive(Debug)]
struct Window {
    buckets: [Bucket; BUCKET_COUNT],
    current: usize,
    rotated_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    successes: u64,
    failures: u64,
}

impl Window {
    fn new() -> Self {
        Self {
            buckets: [Bucket::default(); BUCKET_COUNT],
            current: 0,
            rotated_at: Instant::now(),
        }
    }

    fn rotate(&mut self) {
        let elapsed = self.rotated_at.elapsed();
        let steps = (elapsed.as_millis() / BUCKET_SPAN.as_millis()) as usize;
        if steps == 0 {
            return;
        }
        for _ in 0..steps.min(BUCKET_COUNT) {
            self.current = (self.current + 1) % BUCKET_COUNT;
            self.buckets[self.current] = Bucket::default();
        }
        self.rotated_at = Instant::now();
    }

    fn record(&mut self, success: bool) {
        self.rotate();
        let bucket = &mut self.buckets[self.current];
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    fn totals(&mut self) -> (u64, u64) {
        self.rotate();
        let mut successes = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            successes += bucket.successes;
            failures += bucket.failures;
        }
        (successes, failures)
    }
}

/// Per-account breaker: opens when over half the recent samples failed,
/// re-opens with exponential growth, and admits exactly one half-open
/// probe at a time.
#[derive(Debug)]
pub struct Breaker {
    state: Mutex<State>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::Closed {
                window: Window::new(),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut guard = self.state.lock().expect("breaker lock");
        self.advance(&mut guard);
        match *guard {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Whether a call may proceed. Half-open hands out a single probe
    /// slot; callers that got `true` must report an outcome.
    pub fn admit(&self) -> bool {
        let mut guard = self.state.lock().expect("breaker lock");
        self.advance(&mut guard);
        match &mut *guard {
            State::Closed { .. } => true,
            State::Open { .. } => false,
            State::HalfOpen { probing, .. } => {
                if *probing {
                    false
                } else {
                    *probing = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.state.lock().expect("breaker lock");
        match &mut *guard {
            State::Closed { window } => window.record(true),
            State::HalfOpen { .. } => {
                *guard = State::Closed {
                    window: Window::new(),
                };
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut guard = self.state.lock().expect("breaker lock");
        match &mut *guard {
            State::Closed { window } => {
                window.record(false);
                let (successes, failures) = window.totals();
                let samples = successes + failures;
                if samples >= MIN_SAMPLES && failures * 2 > samples {
                    *guard = State::Open {
                        until: Instant::now() + BASE_OPEN,
                        generation: 0,
                    };
                }
            }
            State::HalfOpen { generation, .. } => {
                let generation = *generation + 1;
                *guard = State::Open {
                    until: Instant::now() + open_duration(generation),
                    generation,
                };
            }
            State::Open { .. } => {}
        }
    }

    fn advance(&self, state: &mut State) {
        if let State::Open { until, generation } = state
            && Instant::now() >= *until
        {
            *state = State::HalfOpen {
                probing: false,
                generation: *generation,
            };
        }
    }
}

fn open_duration(generation: u32) -> Duration {
    let factor = 1u32 << generation.min(5);
    (BASE_OPEN * factor).min(MAX_OPEN)
}

/// Breakers by account id, created on first touch.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<AccountId, Arc<Breaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker(&self, account_id: &str) -> Arc<Breaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .expect("breaker registry lock")
            .get(account_id)
        {
            return existing.clone();
        }
        let mut guard = self.breakers.write().expect("breaker registry lock");
        guard
            .entry(account_id.to_string())
            .or_insert_with(|| {
                info!(event = "breaker.created", account_id = %account_id);
                Arc::new(Breaker::new())
            })
            .clone()
    }

    pub fn admit(&self, account_id: &str) -> bool {
        self.breaker(account_id).admit()
    }

    pub fn record(&self, account_id: &str, success: bool) {
        let breaker = self.breaker(account_id);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(breaker: &Breaker) {
        for _ in 0..5 {
            breaker.record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_majority_failures_and_recovers_via_probe() {
        let breaker = Breaker::new();
        assert!(breaker.admit());
        trip(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.admit());

        tokio::time::advance(BASE_OPEN + Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Exactly one probe is admitted.
        assert!(breaker.admit());
        assert!(!breaker.admit());

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.admit());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_longer() {
        let breaker = Breaker::new();
        trip(&breaker);
        tokio::time::advance(BASE_OPEN + Duration::from_millis(10)).await;
        assert!(breaker.admit());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // First open was 30s; the re-open doubles.
        tokio::time::advance(BASE_OPEN + Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::advance(BASE_OPEN).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn few_samples_never_open() {
        let breaker = Breaker::new();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_duration_caps_at_ten_minutes() {
        assert_eq!(open_duration(0), Duration::from_secs(30));
        assert_eq!(open_duration(1), Duration::from_secs(60));
        assert_eq!(open_duration(10), MAX_OPEN);
    }
}
