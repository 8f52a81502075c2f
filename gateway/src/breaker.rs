//! Per-upstream-host circuit breaking.
//!
//! Breakers are created on demand and live with the process. Concurrent
//! probes are permitted under half-open; they all contribute to the
//! success/failure counts.

use crate::config::BreakerSettings;
use crate::metrics_defs::{BREAKER_OPENED, BREAKER_REJECTED};
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BreakerError<E: std::error::Error> {
    #[error("circuit open, retry in {retry_after:?}")]
    Open { retry_after: Duration },

    #[error(transparent)]
    Inner(E),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: State,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
}

pub struct CircuitBreaker {
    host: String,
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    fn new(host: &str, settings: BreakerSettings) -> Self {
        CircuitBreaker {
            host: host.to_string(),
            settings,
            state: Mutex::new(BreakerState {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                next_attempt_at: None,
            }),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    /// Admission check. An open breaker that has cooled down transitions to
    /// half-open and admits the call.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        match state.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let now = Instant::now();
                match state.next_attempt_at {
                    Some(at) if now < at => Err(at - now),
                    _ => {
                        state.state = State::HalfOpen;
                        state.success_count = 0;
                        tracing::info!(host = %self.host, "circuit half-open, probing");
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        if state.state == State::HalfOpen {
            state.success_count += 1;
            if state.success_count >= self.settings.success_threshold {
                state.state = State::Closed;
                state.success_count = 0;
                state.next_attempt_at = None;
                tracing::info!(host = %self.host, "circuit closed");
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.success_count = 0;
        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.settings.failure_threshold {
                    self.trip(&mut state);
                }
            }
            State::HalfOpen | State::Open => self.trip(&mut state),
        }
    }

    fn trip(&self, state: &mut BreakerState) {
        state.state = State::Open;
        state.next_attempt_at = Some(Instant::now() + self.cooldown());
        counter!(BREAKER_OPENED, "host" => self.host.clone()).increment(1);
        tracing::warn!(
            host = %self.host,
            timeout_secs = self.settings.timeout_secs,
            "circuit opened"
        );
    }

    /// Runs `operation` under this breaker. A rejected call fails at once
    /// with the remaining cooldown and does not execute the operation.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        if let Err(retry_after) = self.try_acquire() {
            counter!(BREAKER_REJECTED, "host" => self.host.clone()).increment(1);
            return Err(BreakerError::Open { retry_after });
        }

        match operation.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    #[cfg(test)]
    fn expire_cooldown(&self) {
        self.state.lock().next_attempt_at = Some(Instant::now());
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.state.lock().state == State::Open
    }
}

pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        BreakerRegistry {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `host`, creating it on first use.
    pub fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(host, self.settings.clone())))
            .clone()
    }
}
