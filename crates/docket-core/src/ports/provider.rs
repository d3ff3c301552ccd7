//! Provider port - 外部実行プロバイダのプラグイン契約
//!
//! `execute(payload, progress) -> result`, `estimate_cost(payload) -> {min, max}`,
//! `kind_supported(kind) -> bool`。コスト上限・タイムアウトは Gateway 側で被せるので、
//! プロバイダ自身は自分の使用量を正直に報告するだけでよい。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CostEstimate, CostRates, ProviderBinding, TaskKind, TaskPayload, Usage};
use crate::error::{Halt, ProviderError};

/// What a provider declares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub model: String,
    pub max_input_units: u64,
    pub max_output_units: u64,
    pub rates: CostRates,
}

impl ProviderDescriptor {
    pub fn binding(&self) -> ProviderBinding {
        ProviderBinding {
            provider: self.name.clone(),
            model: self.model.clone(),
            rates: self.rates,
        }
    }
}

/// An intermediate update from a running provider call.
///
/// `usage` is cumulative for the call so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProgress {
    pub progress: u8,
    pub step: String,
    pub usage: Usage,
}

impl ProviderProgress {
    pub fn new(progress: u8, step: impl Into<String>, usage: Usage) -> Self {
        Self {
            progress,
            step: step.into(),
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub result: serde_json::Value,
    pub usage: Usage,
}

/// Receives progress from a provider call.
///
/// Returning `Err` tells the provider to stop at this boundary; the
/// provider should return the `Halt` to its caller as `ProviderError`.
#[async_trait]
pub trait ProgressCallback: Send + Sync {
    async fn report(&self, update: ProviderProgress) -> Result<(), Halt>;
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn kind_supported(&self, kind: TaskKind) -> bool;

    /// Cost bounds for running `payload`, from the declared rates.
    fn estimate_cost(&self, payload: &TaskPayload) -> CostEstimate {
        let d = self.descriptor();
        let input = payload.input_units();
        CostEstimate::new(
            d.rates.cost_of(Usage::new(input, 0)),
            d.rates.cost_of(Usage::new(input, d.max_output_units)),
        )
    }

    async fn execute(
        &self,
        payload: &TaskPayload,
        progress: &dyn ProgressCallback,
    ) -> Result<ProviderOutput, ProviderError>;
}
