//! Deterministic provider for local runs and tests.
//!
//! Replays a fixed list of progress steps, reporting usage that grows
//! linearly with progress, and can be told to fail or stall on upcoming
//! calls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::domain::{CostRates, TaskKind, TaskPayload, Usage};
use crate::error::ProviderError;
use crate::ports::{ProgressCallback, Provider, ProviderDescriptor, ProviderOutput, ProviderProgress};

/// A failure to inject into an upcoming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient(String),
    Permanent(String),
    /// Sleep this long before doing anything (to trip timeouts).
    Stall(Duration),
}

pub struct ScriptedProvider {
    descriptor: ProviderDescriptor,
    kinds: Vec<TaskKind>,
    steps: Vec<(u8, String)>,
    output_units: u64,
    step_delay: Duration,
    queued: Mutex<VecDeque<ScriptedFailure>>,
    always: Option<ScriptedFailure>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                name: name.into(),
                model: model.into(),
                max_input_units: 1_000_000,
                max_output_units: 4_000,
                rates: CostRates::default(),
            },
            kinds: TaskKind::ALL.to_vec(),
            steps: vec![
                (10, "reading input".to_string()),
                (45, "analyzing".to_string()),
                (80, "drafting result".to_string()),
            ],
            output_units: 1_000,
            step_delay: Duration::ZERO,
            queued: Mutex::new(VecDeque::new()),
            always: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_rates(mut self, rates: CostRates) -> Self {
        self.descriptor.rates = rates;
        self
    }

    /// Declared limits (what the gateway's pre-flight check sees).
    pub fn with_limits(mut self, max_input_units: u64, max_output_units: u64) -> Self {
        self.descriptor.max_input_units = max_input_units;
        self.descriptor.max_output_units = max_output_units;
        self
    }

    /// Output units actually produced by a full run.
    pub fn with_output_units(mut self, output_units: u64) -> Self {
        self.output_units = output_units;
        self
    }

    pub fn supporting(mut self, kinds: &[TaskKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn with_steps<S: Into<String>>(mut self, steps: impl IntoIterator<Item = (u8, S)>) -> Self {
        self.steps = steps.into_iter().map(|(p, s)| (p, s.into())).collect();
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn failing_always(mut self, failure: ScriptedFailure) -> Self {
        self.always = Some(failure);
        self
    }

    /// Fail the next call (calls queue up in order).
    pub fn fail_next(&self, failure: ScriptedFailure) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(failure);
    }

    /// Number of times `execute` was entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn usage_at(&self, payload: &TaskPayload, progress: u8) -> Usage {
        Usage::new(
            payload.input_units(),
            self.output_units * u64::from(progress.min(100)) / 100,
        )
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn kind_supported(&self, kind: TaskKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn execute(
        &self,
        payload: &TaskPayload,
        progress: &dyn ProgressCallback,
    ) -> Result<ProviderOutput, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let injected = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| self.always.clone());
        debug!(provider = %self.descriptor.name, call, kind = %payload.kind(), "scripted call");

        match injected {
            Some(ScriptedFailure::Transient(msg)) => return Err(ProviderError::Transient(msg)),
            Some(ScriptedFailure::Permanent(msg)) => return Err(ProviderError::Permanent(msg)),
            Some(ScriptedFailure::Stall(d)) => tokio::time::sleep(d).await,
            None => {}
        }

        for (pct, step) in &self.steps {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            progress
                .report(ProviderProgress::new(
                    *pct,
                    step.clone(),
                    self.usage_at(payload, *pct),
                ))
                .await?;
        }

        Ok(ProviderOutput {
            result: json!({
                "kind": payload.kind(),
                "provider": self.descriptor.name,
                "model": self.descriptor.model,
                "input_units": payload.input_units(),
            }),
            usage: self.usage_at(payload, 100),
        })
    }
}
