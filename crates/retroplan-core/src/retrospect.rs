//! Out-of-band retrospect jobs
//!
//! Each scheduled job runs as its own tokio task, bounded by a semaphore
//! sized from policy. Job state lives in a per-job table entry; finished
//! jobs are sent to the coordinator over a channel so the execution path
//! never waits on them.

use crate::events::{EventSink, RunEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use retroplan_model::{
    CheckResult, ContentHash, JobId, JobStatus, Outputs, PolicyConfig, RetroCheck, RetrospectJob,
    RunId, Scope, StepId,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The committed values a job checks
#[derive(Debug, Clone, Default)]
pub struct RetroSnapshot {
    pub run_id: RunId,
    pub inputs: Outputs,
    /// Committed outputs of every step at scheduling time
    pub steps: BTreeMap<StepId, Outputs>,
    /// Outputs of the checkpoint under test
    pub outputs: Outputs,
}

impl RetroSnapshot {
    #[must_use]
    pub fn scope(&self) -> Scope<'_> {
        Scope::new(&self.inputs, &self.steps).with_local(&self.outputs)
    }
}

/// What a custom check gets to look at
#[derive(Debug, Clone, Copy)]
pub struct RetroContext<'a> {
    pub job: &'a RetrospectJob,
    pub snapshot: &'a RetroSnapshot,
}

/// A pluggable retrospect check, referenced by name from plan documents
#[async_trait]
pub trait CustomCheck: Send + Sync {
    async fn check(&self, ctx: &RetroContext<'_>, params: &Value) -> CheckResult;
}

struct JobEntry {
    job: RetrospectJob,
    cancel: CancellationToken,
}

/// Schedules and tracks retrospect jobs
pub struct RetrospectRunner {
    policy: Arc<PolicyConfig>,
    events: Arc<dyn EventSink>,
    custom: Arc<HashMap<String, Arc<dyn CustomCheck>>>,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    permits: Arc<Semaphore>,
    results: mpsc::UnboundedSender<RetrospectJob>,
}

impl std::fmt::Debug for RetrospectRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrospectRunner")
            .field("jobs", &self.jobs.len())
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl RetrospectRunner {
    /// Create a runner and the receiver for finished jobs
    #[must_use]
    pub fn new(
        policy: Arc<PolicyConfig>,
        events: Arc<dyn EventSink>,
        custom: HashMap<String, Arc<dyn CustomCheck>>,
    ) -> (Self, mpsc::UnboundedReceiver<RetrospectJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(policy.retrospect.max_concurrent.max(1)));
        let runner = Self {
            policy,
            events,
            custom: Arc::new(custom),
            jobs: Arc::new(DashMap::new()),
            permits,
            results: tx,
        };
        (runner, rx)
    }

    /// Default deadline for jobs whose spec declares none
    #[must_use]
    pub fn default_timeout_ms(&self) -> u64 {
        self.policy.timeouts.retrospect_ms
    }

    /// Start a job in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, job: RetrospectJob, snapshot: RetroSnapshot) -> JobId {
        let id = job.id;
        let cancel = CancellationToken::new();
        emit_transition(self.events.as_ref(), snapshot.run_id, &job, None);
        info!(
            job_id = %id,
            step_id = %job.step_id,
            name = %job.name,
            checks = job.checks.len(),
            "retrospect scheduled"
        );
        self.jobs.insert(
            id,
            JobEntry {
                job,
                cancel: cancel.clone(),
            },
        );

        let task = JobTask {
            id,
            snapshot,
            cancel,
            jobs: Arc::clone(&self.jobs),
            events: Arc::clone(&self.events),
            custom: Arc::clone(&self.custom),
            permits: Arc::clone(&self.permits),
            results: self.results.clone(),
        };
        tokio::spawn(task.run());
        id
    }

    /// Cancel every unfinished job whose artifact is in `artifacts`
    pub fn cancel_for(&self, artifacts: &BTreeSet<ContentHash>) -> Vec<JobId> {
        self.cancel_where(|job| artifacts.contains(&job.artifact))
    }

    /// Cancel every unfinished job
    pub fn cancel_all(&self) -> Vec<JobId> {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&self, pred: impl Fn(&RetrospectJob) -> bool) -> Vec<JobId> {
        let mut cancelled = Vec::new();
        for entry in self.jobs.iter() {
            if !entry.job.status.is_terminal() && pred(&entry.job) {
                entry.cancel.cancel();
                cancelled.push(entry.job.id);
            }
        }
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "retrospects cancelled");
        }
        cancelled
    }

    #[must_use]
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|e| e.job.status)
    }

    #[must_use]
    pub fn job(&self, id: &JobId) -> Option<RetrospectJob> {
        self.jobs.get(id).map(|e| e.job.clone())
    }

    /// Every job ever scheduled, oldest first
    #[must_use]
    pub fn jobs(&self) -> Vec<RetrospectJob> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Jobs checking a specific artifact
    #[must_use]
    pub fn jobs_for_artifact(&self, artifact: &ContentHash) -> Vec<RetrospectJob> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|e| &e.job.artifact == artifact)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Whether any job is still pending or running
    #[must_use]
    pub fn has_active(&self) -> bool {
        self.jobs.iter().any(|e| !e.job.status.is_terminal())
    }
}

struct JobTask {
    id: JobId,
    snapshot: RetroSnapshot,
    cancel: CancellationToken,
    jobs: Arc<DashMap<JobId, JobEntry>>,
    events: Arc<dyn EventSink>,
    custom: Arc<HashMap<String, Arc<dyn CustomCheck>>>,
    permits: Arc<Semaphore>,
    results: mpsc::UnboundedSender<RetrospectJob>,
}

enum Verdict {
    Passed,
    Failed(Vec<CheckResult>),
    TimedOut,
    Cancelled,
}

impl JobTask {
    async fn run(self) {
        let permit = tokio::select! {
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.finish(Verdict::Cancelled, Vec::new());
            return;
        };

        let Some(job) = self.advance(JobStatus::Running, Vec::new()) else {
            return;
        };

        let deadline = Duration::from_millis(job.timeout_ms);
        let ctx = RetroContext {
            job: &job,
            snapshot: &self.snapshot,
        };
        let verdict = tokio::select! {
            () = self.cancel.cancelled() => Verdict::Cancelled,
            outcome = tokio::time::timeout(deadline, run_checks(&ctx, &self.custom)) => match outcome {
                Ok(results) => {
                    let failures: Vec<_> = results.into_iter().filter(|r| !r.passed).collect();
                    if failures.is_empty() {
                        Verdict::Passed
                    } else {
                        Verdict::Failed(failures)
                    }
                }
                Err(_) => Verdict::TimedOut,
            },
        };

        let failures = match &verdict {
            Verdict::Failed(failures) => failures.clone(),
            Verdict::TimedOut => vec![CheckResult::fail(
                "deadline",
                format!("no verdict within {} ms", job.timeout_ms),
            )],
            Verdict::Passed | Verdict::Cancelled => Vec::new(),
        };
        self.finish(verdict, failures);
    }

    fn finish(&self, verdict: Verdict, failures: Vec<CheckResult>) {
        let to = match verdict {
            Verdict::Passed => JobStatus::Ok,
            Verdict::Failed(_) => JobStatus::Fail,
            Verdict::TimedOut => JobStatus::Timeout,
            Verdict::Cancelled => JobStatus::Cancelled,
        };
        if let Some(job) = self.advance(to, failures) {
            match to {
                JobStatus::Fail | JobStatus::Timeout => warn!(
                    job_id = %job.id,
                    step_id = %job.step_id,
                    status = %to,
                    failures = job.failures.len(),
                    "retrospect failed"
                ),
                _ => debug!(job_id = %job.id, status = %to, "retrospect finished"),
            }
            // receiver gone means the run is over
            let _ = self.results.send(job);
        }
    }

    /// Transition the job in its table entry and emit the change
    fn advance(&self, to: JobStatus, failures: Vec<CheckResult>) -> Option<RetrospectJob> {
        let (from, job) = {
            let mut entry = self.jobs.get_mut(&self.id)?;
            let from = entry.job.status;
            if !entry.job.transition(to) {
                return None;
            }
            entry.job.failures = failures;
            (from, entry.job.clone())
        };
        emit_transition(self.events.as_ref(), self.snapshot.run_id, &job, Some(from));
        Some(job)
    }
}

fn emit_transition(
    events: &dyn EventSink,
    run_id: RunId,
    job: &RetrospectJob,
    from: Option<JobStatus>,
) {
    events.emit(&RunEvent::RetrospectTransition {
        run_id,
        job_id: job.id,
        step_id: job.step_id.clone(),
        name: job.name.clone(),
        from,
        to: job.status,
    });
}

async fn run_checks(
    ctx: &RetroContext<'_>,
    custom: &HashMap<String, Arc<dyn CustomCheck>>,
) -> Vec<CheckResult> {
    let scope = ctx.snapshot.scope();
    let mut results = Vec::with_capacity(ctx.job.checks.len());
    for check in &ctx.job.checks {
        let result = match check {
            RetroCheck::Custom { name, params } => match custom.get(name) {
                Some(handler) => handler.check(ctx, params).await,
                None => CheckResult::fail(name, "no custom check registered under this name"),
            },
            builtin => run_builtin(builtin, &scope),
        };
        results.push(result);
    }
    results
}

fn run_builtin(check: &RetroCheck, scope: &Scope<'_>) -> CheckResult {
    match check {
        RetroCheck::Schema { required } => {
            let problems: Vec<String> = required
                .iter()
                .filter_map(|(key, ty)| match scope.lookup(key) {
                    Some(value) if ty.matches(value) => None,
                    Some(value) => Some(format!("`{key}` is not {ty:?}: {value}")),
                    None => Some(format!("`{key}` is missing")),
                })
                .collect();
            if problems.is_empty() {
                CheckResult::pass("schema")
            } else {
                CheckResult::fail("schema", problems.join("; "))
            }
        }
        RetroCheck::NoDuplicates { key, by } => {
            let name = format!("no_duplicates({key})");
            let Some(Value::Array(items)) = scope.lookup(key) else {
                return CheckResult::fail(name, format!("`{key}` is not an array"));
            };
            let mut seen = BTreeSet::new();
            let mut dupes = BTreeSet::new();
            for item in items {
                let field = match by {
                    Some(path) => path.split('.').try_fold(item, |v, seg| v.get(seg)),
                    None => Some(item),
                };
                let Some(field) = field else { continue };
                let rendered = field.to_string();
                if !seen.insert(rendered.clone()) {
                    dupes.insert(rendered);
                }
            }
            if dupes.is_empty() {
                CheckResult::pass(name)
            } else {
                let listed: Vec<_> = dupes.into_iter().collect();
                CheckResult::fail(name, format!("duplicated: {}", listed.join(", ")))
            }
        }
        RetroCheck::Consistency {
            key,
            other_step,
            other_key,
        } => {
            let name = format!("consistency({key} = {other_step}.{other_key})");
            let other_path = format!("{other_step}.{other_key}");
            match (scope.lookup(key), scope.lookup(&other_path)) {
                (Some(a), Some(b)) if a == b => CheckResult::pass(name),
                (Some(a), Some(b)) => CheckResult::fail(name, format!("{a} != {b}")),
                (None, _) => CheckResult::fail(name, format!("`{key}` is missing")),
                (_, None) => CheckResult::fail(name, format!("`{other_path}` is missing")),
            }
        }
        RetroCheck::Assert { assertion } => match assertion.check(scope) {
            Ok(()) => CheckResult::pass("assert"),
            Err(failure) => CheckResult::fail("assert", failure.detail),
        },
        RetroCheck::Custom { name, .. } => {
            CheckResult::fail(name, "custom checks need the async path")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuditLog;
    use retroplan_model::{Assertion, CheckpointId, RetrospectSpec, ValueType};
    use serde_json::json;

    fn job(checks: Vec<RetroCheck>, timeout_ms: u64) -> RetrospectJob {
        let artifact = ContentHash::compute(b"artifact");
        RetrospectJob::from_spec(
            &RetrospectSpec::new("audit", checks),
            StepId::new("s2"),
            CheckpointId(ContentHash::compute(b"ckpt")),
            artifact,
            timeout_ms,
        )
    }

    fn snapshot(outputs: Value) -> RetroSnapshot {
        RetroSnapshot {
            run_id: RunId::new(),
            inputs: Outputs::new(),
            steps: BTreeMap::from([(
                StepId::new("s1"),
                serde_json::from_value(json!({"count": 2})).unwrap(),
            )]),
            outputs: serde_json::from_value(outputs).unwrap(),
        }
    }

    fn runner(
        custom: HashMap<String, Arc<dyn CustomCheck>>,
    ) -> (RetrospectRunner, mpsc::UnboundedReceiver<RetrospectJob>, Arc<AuditLog>) {
        let log = Arc::new(AuditLog::new());
        let (runner, rx) =
            RetrospectRunner::new(Arc::new(PolicyConfig::default()), log.clone(), custom);
        (runner, rx, log)
    }

    struct Slow;

    #[async_trait]
    impl CustomCheck for Slow {
        async fn check(&self, _ctx: &RetroContext<'_>, _params: &Value) -> CheckResult {
            tokio::time::sleep(Duration::from_secs(600)).await;
            CheckResult::pass("slow")
        }
    }

    #[tokio::test]
    async fn builtin_checks_pass_and_fail() {
        let (runner, mut rx, log) = runner(HashMap::new());
        let checks = vec![
            RetroCheck::Schema {
                required: BTreeMap::from([("items".to_string(), ValueType::Array)]),
            },
            RetroCheck::NoDuplicates {
                key: "items".into(),
                by: Some("id".into()),
            },
            RetroCheck::Consistency {
                key: "count".into(),
                other_step: "s1".into(),
                other_key: "count".into(),
            },
            RetroCheck::Assert {
                assertion: Assertion::NonEmpty { key: "items".into() },
            },
        ];
        runner.schedule(
            job(checks.clone(), 1_000),
            snapshot(json!({"items": [{"id": 1}, {"id": 2}], "count": 2})),
        );
        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, JobStatus::Ok);

        runner.schedule(
            job(checks, 1_000),
            snapshot(json!({"items": [{"id": 1}, {"id": 1}], "count": 3})),
        );
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.status, JobStatus::Fail);
        let names: Vec<_> = failed.failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["no_duplicates(items)", "consistency(count = s1.count)"]
        );
        // pending, running, terminal for each job
        assert_eq!(log.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_timeout() {
        let custom: HashMap<String, Arc<dyn CustomCheck>> =
            HashMap::from([("slow".to_string(), Arc::new(Slow) as Arc<dyn CustomCheck>)]);
        let (runner, mut rx, _) = runner(custom);
        runner.schedule(
            job(
                vec![RetroCheck::Custom {
                    name: "slow".into(),
                    params: Value::Null,
                }],
                50,
            ),
            snapshot(json!({})),
        );
        let done = rx.recv().await.unwrap();
        assert_eq!(done.status, JobStatus::Timeout);
        assert!(done.status.is_failure());
    }

    #[tokio::test]
    async fn cancel_for_only_touches_matching_artifacts() {
        let custom: HashMap<String, Arc<dyn CustomCheck>> =
            HashMap::from([("slow".to_string(), Arc::new(Slow) as Arc<dyn CustomCheck>)]);
        let (runner, mut rx, _) = runner(custom);
        let slow = vec![RetroCheck::Custom {
            name: "slow".into(),
            params: Value::Null,
        }];
        let target = runner.schedule(job(slow.clone(), 60_000), snapshot(json!({})));
        let mut other = job(slow, 60_000);
        other.artifact = ContentHash::compute(b"elsewhere");
        let other = runner.schedule(other, snapshot(json!({})));

        let cancelled = runner.cancel_for(&BTreeSet::from([ContentHash::compute(b"artifact")]));
        assert_eq!(cancelled, vec![target]);
        let done = rx.recv().await.unwrap();
        assert_eq!(done.id, target);
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(!runner.status(&other).unwrap().is_terminal());
        runner.cancel_all();
    }

    #[tokio::test]
    async fn unknown_custom_check_fails() {
        let (runner, mut rx, _) = runner(HashMap::new());
        runner.schedule(
            job(
                vec![RetroCheck::Custom {
                    name: "nope".into(),
                    params: Value::Null,
                }],
                1_000,
            ),
            snapshot(json!({})),
        );
        assert_eq!(rx.recv().await.unwrap().status, JobStatus::Fail);
    }
}
