//! A per-sink circuit breaker guarding the ClickHouse insert call.
//!
//! Not part of the state machine in §4.5 — the sink's Retrying/Failed
//! states are unaffected by this. It is purely an ambient resiliency layer
//! that stops hammering a down cluster between backoff attempts, owned by
//! one `ClickHouseSink` instance rather than shared globally.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    state: AtomicU8,
    error_count: AtomicU64,
    last_state_change: Mutex<Instant>,
    errors_to_open: u64,
    cooldown: Duration,
}

pub struct CircuitBreakerConfig {
    pub errors_to_open: u64,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { errors_to_open: 5, cooldown: Duration::from_secs(5) }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            error_count: AtomicU64::new(0),
            last_state_change: Mutex::new(Instant::now()),
            errors_to_open: config.errors_to_open,
            cooldown: config.cooldown,
        })
    }

    /// True if a caller should attempt the guarded operation right now.
    /// Transitions Open -> HalfOpen once the cooldown has elapsed.
    pub async fn allow(&self) -> bool {
        match self.get_state().await {
            CircuitState::Open => false,
            CircuitState::HalfOpen | CircuitState::Closed => true,
        }
    }

    pub async fn on_success(&self) {
        let was_half_open = self.get_state().await == CircuitState::HalfOpen;
        self.error_count.store(0, Ordering::Relaxed);
        if was_half_open {
            self.transition_to(CircuitState::Closed).await;
        }
    }

    /// Returns `true` if this failure tripped the breaker open.
    pub async fn on_failure(&self) -> bool {
        if self.get_state().await == CircuitState::HalfOpen {
            self.transition_to(CircuitState::Open).await;
            return true;
        }
        let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.errors_to_open {
            self.transition_to(CircuitState::Open).await;
            return true;
        }
        false
    }

    async fn get_state(&self) -> CircuitState {
        let state = CircuitState::from(self.state.load(Ordering::Relaxed));
        if state == CircuitState::Open {
            let last_change = *self.last_state_change.lock().await;
            if last_change.elapsed() > self.cooldown {
                self.state.store(CircuitState::HalfOpen as u8, Ordering::Relaxed);
                return CircuitState::HalfOpen;
            }
        }
        state
    }

    async fn transition_to(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Relaxed);
        *self.last_state_change.lock().await = Instant::now();
        if state == CircuitState::Closed {
            self.error_count.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.load(Ordering::Relaxed) == CircuitState::Closed as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_errors() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { errors_to_open: 3, cooldown: Duration::from_secs(60) });
        assert!(!cb.on_failure().await);
        assert!(!cb.on_failure().await);
        assert!(cb.on_failure().await);
        assert!(!cb.allow().await);
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_success() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { errors_to_open: 1, cooldown: Duration::from_millis(10) });
        cb.on_failure().await;
        assert!(!cb.allow().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow().await);
        cb.on_success().await;
        assert!(cb.is_healthy());
    }
}
