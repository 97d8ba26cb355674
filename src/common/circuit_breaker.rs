//! Circuit breaker for the brokerage connection
//!
//! States:
//! - Closed: normal operation
//! - Open: too many consecutive failures, calls are refused until a cooldown
//! - HalfOpen: cooldown elapsed, probing whether the venue recovered

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before it closes again
    pub success_threshold: u32,
    /// Cooldown spent in Open before probing
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    config: CircuitBreakerConfig,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            config,
            last_failure_time: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed. Transitions Open -> HalfOpen once the
    /// cooldown has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.last_failure_time {
                Some(last) if last.elapsed() >= self.config.timeout => {
                    tracing::info!("circuit breaker probing venue (half-open)");
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    self.success_count = 0;
                    true
                }
                Some(_) => false,
                // No failure time recorded; allow the attempt
                None => true,
            },
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    tracing::info!("circuit breaker closed after recovery");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        self.failure_count
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker re-opened: probe failed");
                self.state = CircuitState::Open;
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
