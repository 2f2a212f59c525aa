//! Named breakers and bulkheads shared by one application instance.
//!
//! The registry is created once by the application context and passed to
//! whatever needs guarded calls; there is no process-wide instance.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use huddle_core::Result;
use huddle_core::error::poison_err;

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::dead_letter::DeadLetterQueue;
use crate::executor::GuardedExecutor;
use crate::retry::RetryPolicy;

/// Owner of per-dependency resilience state.
#[derive(Debug)]
pub struct ResilienceRegistry {
    breaker_config: BreakerConfig,
    bulkhead_config: BulkheadConfig,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
    bulkheads: RwLock<BTreeMap<String, Arc<Bulkhead>>>,
    dead_letters: Arc<DeadLetterQueue>,
}

impl ResilienceRegistry {
    /// Creates a registry whose breakers and bulkheads use the given defaults.
    #[must_use]
    pub fn new(
        breaker_config: BreakerConfig,
        bulkhead_config: BulkheadConfig,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            breaker_config,
            bulkhead_config,
            breakers: RwLock::new(BTreeMap::new()),
            bulkheads: RwLock::new(BTreeMap::new()),
            dead_letters,
        }
    }

    /// Returns the breaker for `dependency`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn breaker(&self, dependency: &str) -> Result<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.read().map_err(poison_err)?.get(dependency) {
            return Ok(Arc::clone(existing));
        }
        let mut breakers = self.breakers.write().map_err(poison_err)?;
        let breaker = breakers.entry(dependency.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(dependency, self.breaker_config.clone()))
        });
        Ok(Arc::clone(breaker))
    }

    /// Returns the bulkhead for `resource`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn bulkhead(&self, resource: &str) -> Result<Arc<Bulkhead>> {
        if let Some(existing) = self.bulkheads.read().map_err(poison_err)?.get(resource) {
            return Ok(Arc::clone(existing));
        }
        let mut bulkheads = self.bulkheads.write().map_err(poison_err)?;
        let bulkhead = bulkheads
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::from_config(resource, &self.bulkhead_config)));
        Ok(Arc::clone(bulkhead))
    }

    /// Builds an executor for `dependency` sharing the registry's breaker,
    /// bulkhead and dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn executor(
        &self,
        dependency: &str,
        retry: RetryPolicy,
        timeout: Option<Duration>,
    ) -> Result<GuardedExecutor> {
        let mut executor = GuardedExecutor::new(self.breaker(dependency)?, retry)
            .with_bulkhead(self.bulkhead(dependency)?)
            .with_dead_letters(Arc::clone(&self.dead_letters));
        if let Some(timeout) = timeout {
            executor = executor.with_timeout(timeout);
        }
        Ok(executor)
    }

    /// Returns the shared dead-letter queue.
    #[must_use]
    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    /// Returns a snapshot of every breaker, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if a lock is poisoned.
    pub fn breaker_snapshots(&self) -> Result<Vec<BreakerSnapshot>> {
        self.breakers
            .read()
            .map_err(poison_err)?
            .values()
            .map(|b| b.snapshot())
            .collect()
    }

    /// Returns occupancy of every bulkhead, keyed by resource name.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn bulkhead_stats(&self) -> Result<BTreeMap<String, BulkheadStats>> {
        Ok(self
            .bulkheads
            .read()
            .map_err(poison_err)?
            .iter()
            .map(|(name, b)| (name.clone(), b.stats()))
            .collect())
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(
            BreakerConfig::default(),
            BulkheadConfig::default(),
            Arc::new(DeadLetterQueue::default()),
        )
    }
}
