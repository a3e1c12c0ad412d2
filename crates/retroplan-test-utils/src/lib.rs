//! Testing utilities for the retroplan workspace
//!
//! Scripted capabilities, recording notifiers, flaky retrospect checks and
//! small plan fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use retroplan_core::{
    Ack, Agent, AgentResponse, CapabilityFailure, CapabilityResponse, CustomCheck,
    EscalationPayload, ExecutionContext, Notifier, NotifyError, RetroContext, Tool,
};
use retroplan_model::{
    ActionContract, Binding, Candidate, CheckResult, Outputs, Severity, TaskBrief,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Build outputs from key/value pairs
pub fn outputs<const N: usize>(pairs: [(&str, Value); N]) -> Outputs {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Ok(Outputs),
    Fail { message: String, retryable: bool },
}

#[derive(Debug, Default)]
struct ScriptState {
    script: VecDeque<Scripted>,
    last: Option<Scripted>,
    calls: Vec<Outputs>,
}

/// Tool that plays back scripted results, then repeats the last one
///
/// With an empty script it echoes its inputs. Clones share the script and
/// the call log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTool {
    state: Arc<Mutex<ScriptState>>,
    cost: f64,
    delay_ms: u64,
    version: String,
}

impl ScriptedTool {
    pub fn echo() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then_ok(self, outputs: Outputs) -> Self {
        self.state.lock().script.push_back(Scripted::Ok(outputs));
        self
    }

    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.state.lock().script.push_back(Scripted::Fail {
            message: message.to_string(),
            retryable: true,
        });
        self
    }

    #[must_use]
    pub fn then_fail_permanent(self, message: &str) -> Self {
        self.state.lock().script.push_back(Scripted::Fail {
            message: message.to_string(),
            retryable: false,
        });
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Inputs of every invocation, in order
    pub fn inputs(&self) -> Vec<Outputs> {
        self.state.lock().calls.clone()
    }

    fn next(&self, inputs: &Outputs) -> Option<Scripted> {
        let mut state = self.state.lock();
        state.calls.push(inputs.clone());
        match state.script.pop_front() {
            Some(step) => {
                state.last = Some(step.clone());
                Some(step)
            }
            None => state.last.clone(),
        }
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn version(&self) -> &str {
        &self.version
    }

    async fn invoke(
        &self,
        inputs: &Outputs,
        _ctx: &ExecutionContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let step = self.next(inputs);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        match step {
            None => Ok(CapabilityResponse::new(inputs.clone()).with_cost(self.cost)),
            Some(Scripted::Ok(outputs)) => Ok(CapabilityResponse::new(outputs).with_cost(self.cost)),
            Some(Scripted::Fail { message, retryable }) => {
                let mut failure = if retryable {
                    CapabilityFailure::new(message)
                } else {
                    CapabilityFailure::permanent(message)
                };
                failure.cost = self.cost;
                Err(failure)
            }
        }
    }
}

/// Agent echoing its inputs with a scripted confidence per call
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    confidences: Arc<Mutex<VecDeque<f64>>>,
    last: Arc<Mutex<f64>>,
}

impl ScriptedAgent {
    pub fn new(confidences: &[f64]) -> Self {
        Self {
            confidences: Arc::new(Mutex::new(confidences.iter().copied().collect())),
            last: Arc::new(Mutex::new(1.0)),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run(
        &self,
        inputs: &Outputs,
        _ctx: &ExecutionContext,
    ) -> Result<AgentResponse, CapabilityFailure> {
        let confidence = {
            let mut last = self.last.lock();
            if let Some(next) = self.confidences.lock().pop_front() {
                *last = next;
            }
            *last
        };
        Ok(AgentResponse {
            response: CapabilityResponse::new(inputs.clone()),
            confidence,
        })
    }
}

/// Notifier that keeps every delivery, or rejects them all
#[derive(Debug, Clone)]
pub struct RecordingNotifier {
    name: String,
    reject: bool,
    seen: Arc<Mutex<Vec<(Severity, EscalationPayload)>>>,
}

impl RecordingNotifier {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reject: false,
            seen: Arc::default(),
        }
    }

    pub fn rejecting(name: &str) -> Self {
        Self {
            reject: true,
            ..Self::new(name)
        }
    }

    pub fn received(&self) -> Vec<(Severity, EscalationPayload)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(
        &self,
        severity: Severity,
        payload: &EscalationPayload,
    ) -> Result<Ack, NotifyError> {
        self.seen.lock().push((severity, payload.clone()));
        if self.reject {
            return Err(NotifyError::Rejected {
                channel: self.name.clone(),
                reason: "scripted rejection".into(),
            });
        }
        Ok(Ack::now(&self.name))
    }
}

/// Custom retrospect check that fails its first `failures` runs
#[derive(Debug, Clone, Default)]
pub struct FlakyCheck {
    failures: u32,
    delay_ms: u64,
    calls: Arc<Mutex<u32>>,
}

impl FlakyCheck {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl CustomCheck for FlakyCheck {
    async fn check(&self, ctx: &RetroContext<'_>, _params: &Value) -> CheckResult {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        let name = format!("flaky({})", ctx.job.step_id);
        if call <= self.failures {
            CheckResult::fail(name, format!("scripted failure {call}"))
        } else {
            CheckResult::pass(name)
        }
    }
}

/// Brief with a `seed` input
pub fn brief(objective: &str) -> TaskBrief {
    TaskBrief::new(objective).with_input("seed", json!("seed"))
}

/// A step producing `value`, derived from the previous step or the seed
///
/// `s1` yields `"seed/s1"`, `s2` after it yields `"seed/s1/s2"` and so on
/// when the capability echoes.
pub fn chain_step(id: &str, prev: Option<&str>, capability: &str) -> ActionContract {
    let source = prev.map_or_else(|| "input.seed".to_string(), |p| format!("{p}.value"));
    ActionContract::new(id, format!("derive {id}"), capability)
        .bind("value", Binding::template(format!("{{{{ {source} }}}}/{id}")))
        .produces(["value"])
}

/// Candidate of sequential [`chain_step`]s sharing one capability
pub fn chain(name: &str, ids: &[&str], capability: &str) -> Candidate {
    let mut candidate = Candidate::new(name, 0.9);
    let mut prev: Option<&str> = None;
    for id in ids {
        let deps: Vec<&str> = prev.into_iter().collect();
        candidate = candidate.step(chain_step(id, prev, capability), &deps);
        prev = Some(id);
    }
    candidate
}
