//! Circuit breaker for one named external dependency.
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────▶ Open
//!     ▲                               │  cooldown elapsed,
//!     │ probe succeeds                │  next call admitted
//!     │                               ▼
//!     └─────────────────────────── HalfOpen
//!                probe fails ─▶ Open
//! ```
//!
//! While open, calls fail fast with [`Error::CircuitOpen`] and the
//! dependency is never invoked. In half-open exactly one probe call is in
//! flight; concurrent callers are rejected until it settles.
//!
//! Only transient failures (see [`Error::is_retryable`]) count against the
//! dependency. Caller-side rejections such as validation errors pass through
//! without moving the state machine.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use huddle_core::error::poison_err;
use huddle_core::{Error, Result};

use crate::metrics::{record_circuit_rejection, record_circuit_transition};

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a probe, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    /// Returns the cooldown as a duration.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// How long the breaker has been open, if it is.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Releases the half-open probe slot if the call is dropped before settling.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inner) = self.breaker.inner.lock() {
                inner.probe_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns the dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the breaker configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, BreakerInner>> {
        self.inner.lock().map_err(poison_err)
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        tracing::info!(
            dependency = %self.name,
            from = from.as_str(),
            to = to.as_str(),
            consecutive_failures = inner.consecutive_failures,
            "circuit breaker transition"
        );
        record_circuit_transition(&self.name, to.as_str());
    }

    /// Admits or rejects a call. Returns `true` when the call is the half-open probe.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown());
                if cooled {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    drop(inner);
                    Err(self.rejection())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    Err(self.rejection())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn rejection(&self) -> Error {
        record_circuit_rejection(&self.name);
        Error::CircuitOpen {
            dependency: self.name.clone(),
        }
    }

    fn on_success(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, CircuitState::Closed);
        }
        Ok(())
    }

    fn on_failure(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) =>
            {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_neutral(&self) -> Result<()> {
        self.lock()?.probe_in_flight = false;
        Ok(())
    }

    /// Runs `op` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without invoking `op` while the breaker
    /// is open, otherwise the operation's own error.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success()?,
            Err(err) if err.is_retryable() => self.on_failure()?,
            Err(_) => self.on_neutral()?,
        }
        result
    }

    /// Returns the current state, applying no transitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<BreakerSnapshot> {
        let inner = self.lock()?;
        Ok(BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: match inner.state {
                CircuitState::Open => inner.opened_at.map(|at| at.elapsed()),
                _ => None,
            },
        })
    }

    /// Forces the breaker closed and clears its failure count.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        Ok(())
    }
}
