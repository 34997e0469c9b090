/*
 * This file is part of the Obvia ERP.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_trials_remaining: u32,
    /// (timestamp, was_failure), pruned to the sampling window.
    samples: VecDeque<(Instant, bool)>,
}

/// Per-tenant circuit breaker. Trips on either
/// `consecutive_failures >= threshold` or a failure ratio `>= ratio` over a
/// window with at least `min_calls` samples. Self-serializes via a mutex,
/// one instance per tenant — never shared across tenants.
pub struct CircuitBreaker {
    failure_threshold: u32,
    failure_ratio: f64,
    sample_window: Duration,
    sample_min_calls: u32,
    open_duration: Duration,
    half_open_trial_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        failure_ratio: f64,
        sample_window: Duration,
        sample_min_calls: u32,
        open_duration: Duration,
        half_open_trial_calls: u32,
    ) -> Self {
        Self {
            failure_threshold,
            failure_ratio,
            sample_window,
            sample_min_calls,
            open_duration,
            half_open_trial_calls,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_trials_remaining: 0,
                samples: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Call before attempting an acquisition. Transitions `open` → `half-open`
    /// once the open duration elapses, and meters half-open trial calls.
    pub fn allow_call(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.opened_at.is_some_and(|t| t.elapsed() >= self.open_duration) {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_trials_remaining = self.half_open_trial_calls;
                    inner.half_open_trials_remaining > 0
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trials_remaining > 0 {
                    inner.half_open_trials_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn prune(inner: &mut Inner, window: Duration) {
        let cutoff = Instant::now() - window;
        while inner.samples.front().is_some_and(|(t, _)| *t < cutoff) {
            inner.samples.pop_front();
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.samples.push_back((Instant::now(), false));
        Self::prune(&mut inner, self.sample_window);
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        inner.samples.push_back((Instant::now(), true));
        Self::prune(&mut inner, self.sample_window);

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            return;
        }

        let total = inner.samples.len() as u32;
        let failures = inner.samples.iter().filter(|(_, f)| *f).count() as u32;
        let ratio_tripped = total >= self.sample_min_calls
            && (failures as f64 / total as f64) >= self.failure_ratio;

        if inner.consecutive_failures >= self.failure_threshold || ratio_tripped {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, 0.5, Duration::from_secs(30), 10, Duration::from_secs(60), 3)
    }

    #[test]
    fn closed_allows_calls() {
        let cb = breaker();
        assert!(cb.allow_call());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn trips_on_consecutive_failures() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_call());
    }

    #[test]
    fn trips_on_failure_ratio_with_min_calls() {
        let cb = breaker();
        for _ in 0..4 {
            cb.record_failure();
        }
        // reset consecutive streak, stay under the consecutive threshold
        cb.record_success();
        for _ in 0..6 {
            cb.record_failure();
        }
        // 10 failures / 11 samples well over 50% with >=10 calls sampled
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_allows_limited_trials_then_recloses_on_success() {
        let cb = breaker();
        for _ in 0..5 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // simulate elapsed open duration by constructing with a near-zero one
        let cb = CircuitBreaker::new(5, 0.5, Duration::from_secs(30), 10, Duration::from_millis(0), 2);
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(cb.allow_call());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(5, 0.5, Duration::from_secs(30), 10, Duration::from_millis(0), 2);
        for _ in 0..5 {
            cb.record_failure();
        }
        assert!(cb.allow_call());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
