//! Provider gateway and cost governor.
//!
//! Workers never name a provider. They ask the gateway for the provider
//! currently enabled for a task kind, then call `invoke`, which wraps the
//! provider call with:
//! - a pre-flight check that the worst-case cost of the call still fits
//!   under the task's ceiling
//! - a hard timeout
//! - a running cost check at every progress callback, halting the call as
//!   soon as measured usage would push the task over its ceiling
//! - the final cost from the provider's rates applied to measured usage

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::domain::{CostRates, TaskKind, TaskPayload, Usage};
use crate::error::{GatewayError, Halt, ProviderError};
use crate::ports::{ProgressCallback, Provider, ProviderProgress};

/// Spend already charged to a task, and the most it may ever reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostBudget {
    pub accrued: Decimal,
    pub ceiling: Decimal,
}

impl CostBudget {
    pub fn new(accrued: Decimal, ceiling: Decimal) -> Self {
        Self { accrued, ceiling }
    }

    fn charge(&self, rates: &CostRates, usage: Usage) -> Result<Decimal, Halt> {
        let total = self.accrued + rates.cost_of(usage);
        if total > self.ceiling {
            return Err(Halt::CostLimitExceeded {
                attempted: total,
                ceiling: self.ceiling,
            });
        }
        Ok(total)
    }
}

/// Receives progress that passed the cost check.
///
/// `accrued_cost` is the task's running total including this call so far.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(
        &self,
        progress: u8,
        step: String,
        accrued_cost: Decimal,
    ) -> Result<(), Halt>;
}

/// A successful, fully charged provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernedOutput {
    pub result: serde_json::Value,
    pub usage: Usage,
    /// Cost of this call alone.
    pub call_cost: Decimal,
    /// Task total after this call.
    pub accrued_cost: Decimal,
}

struct GovernedCallback<'a> {
    rates: CostRates,
    budget: CostBudget,
    sink: &'a dyn ProgressSink,
}

#[async_trait]
impl ProgressCallback for GovernedCallback<'_> {
    async fn report(&self, update: ProviderProgress) -> Result<(), Halt> {
        let accrued = self.budget.charge(&self.rates, update.usage)?;
        self.sink
            .on_progress(update.progress, update.step, accrued)
            .await
    }
}

pub struct ProviderGateway {
    providers: HashMap<String, Arc<dyn Provider>>,
    enabled: RwLock<HashMap<TaskKind, String>>,
    call_timeout: Duration,
}

impl ProviderGateway {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            enabled: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<(), GatewayError> {
        let name = provider.descriptor().name.clone();
        if self.providers.contains_key(&name) {
            return Err(GatewayError::DuplicateProvider(name));
        }
        self.providers.insert(name, provider);
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// Switch the provider used for `kind`. Takes effect for the next claim.
    pub fn enable(&self, kind: TaskKind, name: &str) -> Result<(), GatewayError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| GatewayError::UnknownProvider(name.to_string()))?;
        if !provider.kind_supported(kind) {
            return Err(GatewayError::KindNotSupported {
                provider: name.to_string(),
                kind,
            });
        }
        let previous = self
            .enabled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, name.to_string());
        info!(kind = %kind, provider = name, previous = ?previous, "provider enabled");
        Ok(())
    }

    /// For kinds without an explicit choice, enable the first registered
    /// provider (by name) that supports them.
    pub fn enable_defaults(&self, kinds: &[TaskKind]) {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        let mut enabled = self.enabled.write().unwrap_or_else(|e| e.into_inner());
        for kind in kinds {
            if enabled.contains_key(kind) {
                continue;
            }
            if let Some(name) = names
                .iter()
                .find(|n| self.providers[n.as_str()].kind_supported(*kind))
            {
                enabled.insert(*kind, (*name).clone());
            }
        }
    }

    /// Kinds out of `kinds` with no usable provider.
    pub fn unconfigured(&self, kinds: &[TaskKind]) -> Vec<TaskKind> {
        kinds
            .iter()
            .copied()
            .filter(|kind| self.enabled_for(*kind).is_err())
            .collect()
    }

    /// The provider currently enabled for `kind`.
    pub fn enabled_for(&self, kind: TaskKind) -> Result<Arc<dyn Provider>, GatewayError> {
        let enabled = self.enabled.read().unwrap_or_else(|e| e.into_inner());
        let name = enabled
            .get(&kind)
            .ok_or(GatewayError::NoProviderEnabled(kind))?;
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| GatewayError::UnknownProvider(name.clone()))?;
        if !provider.kind_supported(kind) {
            return Err(GatewayError::KindNotSupported {
                provider: name.clone(),
                kind,
            });
        }
        Ok(Arc::clone(provider))
    }

    /// Run one governed provider call.
    pub async fn invoke(
        &self,
        provider: &dyn Provider,
        payload: &TaskPayload,
        budget: CostBudget,
        sink: &dyn ProgressSink,
    ) -> Result<GovernedOutput, ProviderError> {
        let descriptor = provider.descriptor();
        let input_units = payload.input_units();
        if input_units > descriptor.max_input_units {
            return Err(ProviderError::InputTooLarge {
                size: input_units,
                limit: descriptor.max_input_units,
            });
        }

        let estimate = provider.estimate_cost(payload);
        let worst_case = budget.accrued + estimate.max;
        if worst_case > budget.ceiling {
            warn!(
                provider = %descriptor.name,
                worst_case = %worst_case,
                ceiling = %budget.ceiling,
                "pre-flight cost check failed"
            );
            return Err(ProviderError::CostLimitExceeded {
                attempted: worst_case,
                ceiling: budget.ceiling,
            });
        }

        let callback = GovernedCallback {
            rates: descriptor.rates,
            budget,
            sink,
        };
        let output =
            match tokio::time::timeout(self.call_timeout, provider.execute(payload, &callback))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(ProviderError::Timeout(self.call_timeout)),
            };

        let accrued_cost = budget.charge(&descriptor.rates, output.usage)?;
        Ok(GovernedOutput {
            result: output.result,
            usage: output.usage,
            call_cost: accrued_cost - budget.accrued,
            accrued_cost,
        })
    }
}
