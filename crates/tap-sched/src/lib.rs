//! Job registry + scheduler.
//!
//! Persisted `JobDefinition`s are the source of truth across restarts; the
//! in-memory registry only binds handler code to job names and tracks which
//! timers are armed. Each active job runs one timer loop; executions are
//! guarded so a job never overlaps itself, and handler panics, errors, and
//! overruns all land in the same failure accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use tap_core::{InvalidRecurrence, JobDefinition, Recurrence};
use tap_store::{Store, StoreError};

pub const CRATE_NAME: &str = "tap-sched";

/// Consecutive failures tolerated before a job is deactivated.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error(transparent)]
    InvalidRecurrence(#[from] InvalidRecurrence),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Work bound to a job name. The summary string ends up in logs and the
/// job's run bookkeeping.
#[async_trait]
pub trait JobHandler<C>: Send + Sync {
    async fn execute(&self, ctx: &C) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub description: String,
    pub recurrence: Recurrence,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    /// The previous execution of the same job was still running.
    Skipped,
}

/// Persisted counters merged with the registry's armed/running flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: String,
    pub description: String,
    pub recurrence: String,
    pub active: bool,
    pub armed: bool,
    pub running: bool,
    pub timeout_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub error_count: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

struct RegisteredJob<C> {
    handler: Arc<dyn JobHandler<C>>,
    busy: Arc<Mutex<()>>,
    /// Set for the duration of an execution. Status reads this flag, never
    /// the `busy` lock, so polling cannot make a concurrent tick skip.
    running: Arc<AtomicBool>,
    timer: Option<AbortHandle>,
}

/// Clears the running flag however the execution ends, cancellation included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct SchedInner<C> {
    jobs: HashMap<String, RegisteredJob<C>>,
}

pub struct Scheduler<C> {
    store: Arc<dyn Store>,
    ctx: Arc<C>,
    max_consecutive_failures: u32,
    inner: Arc<Mutex<SchedInner<C>>>,
}

impl<C> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ctx: self.ctx.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> Scheduler<C> {
    pub fn new(store: Arc<dyn Store>, ctx: Arc<C>, max_consecutive_failures: u32) -> Self {
        Self {
            store,
            ctx,
            max_consecutive_failures: max_consecutive_failures.max(1),
            inner: Arc::new(Mutex::new(SchedInner {
                jobs: HashMap::new(),
            })),
        }
    }

    /// Idempotent: a repeat registration refreshes the handler, description,
    /// recurrence, and timeout, and never touches counters.
    pub async fn register(
        &self,
        spec: JobSpec,
        handler: impl JobHandler<C> + 'static,
    ) -> Result<(), SchedError> {
        spec.recurrence.validate()?;
        let now = Utc::now();
        let definition = match self.store.get_job(&spec.name).await? {
            Some(mut existing) => {
                existing.description = spec.description.clone();
                existing.recurrence = spec.recurrence;
                existing.timeout_secs = spec.timeout_secs;
                existing.updated_at = now;
                existing
            }
            None => JobDefinition::new(
                &spec.name,
                &spec.description,
                spec.recurrence,
                spec.timeout_secs,
                now,
            ),
        };
        self.store.put_job(&definition).await?;

        let handler: Arc<dyn JobHandler<C>> = Arc::new(handler);
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&spec.name) {
            Some(job) => job.handler = handler,
            None => {
                inner.jobs.insert(
                    spec.name.clone(),
                    RegisteredJob {
                        handler,
                        busy: Arc::new(Mutex::new(())),
                        running: Arc::new(AtomicBool::new(false)),
                        timer: None,
                    },
                );
            }
        }
        info!(
            job = %spec.name,
            recurrence = %definition.recurrence.describe(),
            "registered job"
        );
        Ok(())
    }

    /// Arm every registered job whose persisted definition is active.
    pub async fn start_all(&self) -> Result<(), SchedError> {
        let names = self.registered_names().await;
        for name in names {
            let def = self.load_job(&name).await?;
            if def.active {
                self.arm(&name).await?;
            }
        }
        Ok(())
    }

    /// Re-arm a stopped or auto-disabled job. Clears the consecutive-failure
    /// counter (re-arming must not instantly re-disable), leaves the
    /// lifetime counters alone.
    pub async fn start(&self, name: &str) -> Result<(), SchedError> {
        let mut def = self.load_job(name).await?;
        def.active = true;
        def.consecutive_failures = 0;
        def.updated_at = Utc::now();
        self.store.put_job(&def).await?;
        self.arm(name).await?;
        info!(job = %name, "job started");
        Ok(())
    }

    /// Mark inactive and cancel future firings. An in-flight execution is
    /// left to finish; its loop exits on the inactive flag afterwards.
    pub async fn stop(&self, name: &str) -> Result<(), SchedError> {
        let mut def = self.load_job(name).await?;
        def.active = false;
        def.next_run = None;
        def.updated_at = Utc::now();
        self.store.put_job(&def).await?;

        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(name)
            .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;
        if !job.running.load(Ordering::SeqCst) {
            if let Some(timer) = job.timer.take() {
                timer.abort();
            }
        }
        info!(job = %name, "job stopped");
        Ok(())
    }

    /// Run once right now, bypassing the active flag. Does not rearm timers
    /// and obeys the overlap guard, so a busy job reports `Skipped`.
    pub async fn trigger(&self, name: &str) -> Result<ExecutionOutcome, SchedError> {
        self.execute_once(name, true).await
    }

    pub async fn status(&self, name: &str) -> Result<JobStatus, SchedError> {
        let def = self.load_job(name).await?;
        let (armed, running) = {
            let inner = self.inner.lock().await;
            let job = inner
                .jobs
                .get(name)
                .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;
            let armed = job.timer.as_ref().is_some_and(|t| !t.is_finished());
            let running = job.running.load(Ordering::SeqCst);
            (armed, running)
        };
        Ok(JobStatus {
            name: def.name,
            description: def.description,
            recurrence: def.recurrence.describe(),
            active: def.active,
            armed,
            running,
            timeout_secs: def.timeout_secs,
            last_run: def.last_run,
            next_run: def.next_run,
            run_count: def.run_count,
            error_count: def.error_count,
            consecutive_failures: def.consecutive_failures,
            last_error: def.last_error,
        })
    }

    pub async fn status_all(&self) -> Result<Vec<JobStatus>, SchedError> {
        let mut names = self.registered_names().await;
        names.sort();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.status(&name).await?);
        }
        Ok(out)
    }

    /// Abort every armed timer. Called on process shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for job in inner.jobs.values_mut() {
            if let Some(timer) = job.timer.take() {
                timer.abort();
            }
        }
        info!("scheduler timers cancelled");
    }

    async fn registered_names(&self) -> Vec<String> {
        self.inner.lock().await.jobs.keys().cloned().collect()
    }

    async fn load_job(&self, name: &str) -> Result<JobDefinition, SchedError> {
        {
            let inner = self.inner.lock().await;
            if !inner.jobs.contains_key(name) {
                return Err(SchedError::UnknownJob(name.to_string()));
            }
        }
        self.store
            .get_job(name)
            .await?
            .ok_or_else(|| SchedError::UnknownJob(name.to_string()))
    }

    async fn arm(&self, name: &str) -> Result<(), SchedError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(name)
            .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;
        if job.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let scheduler = self.clone();
        let job_name = name.to_string();
        let handle = tokio::spawn(async move { scheduler.run_loop(job_name).await });
        job.timer = Some(handle.abort_handle());
        Ok(())
    }

    /// One iteration per firing: persist the next fire time, sleep, check
    /// the job is still wanted, execute, rearm. An execution that overruns
    /// the next nominal tick just skips it (the next fire is computed from
    /// the current time), never runs in parallel with itself.
    async fn run_loop(&self, name: String) {
        loop {
            let mut def = match self.store.get_job(&name).await {
                Ok(Some(def)) => def,
                Ok(None) => {
                    warn!(job = %name, "job definition missing; disarming");
                    return;
                }
                Err(err) => {
                    error!(job = %name, error = %err, "loading job definition failed");
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    continue;
                }
            };
            if !def.active {
                info!(job = %name, "job inactive; disarming");
                return;
            }

            let now = Utc::now();
            let next = def.recurrence.next_fire_after(now);
            def.next_run = Some(next);
            def.updated_at = now;
            if let Err(err) = self.store.put_job(&def).await {
                error!(job = %name, error = %err, "persisting next run failed");
            }

            let sleep_for = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(sleep_for).await;

            match self.store.get_job(&name).await {
                Ok(Some(def)) if def.active => {}
                _ => return,
            }

            if let Err(err) = self.execute_once(&name, false).await {
                error!(job = %name, error = %err, "scheduled execution could not run");
            }
        }
    }

    async fn execute_once(
        &self,
        name: &str,
        manual: bool,
    ) -> Result<ExecutionOutcome, SchedError> {
        let (handler, busy, running) = {
            let inner = self.inner.lock().await;
            let job = inner
                .jobs
                .get(name)
                .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;
            (job.handler.clone(), job.busy.clone(), job.running.clone())
        };

        let Ok(_guard) = busy.try_lock() else {
            warn!(job = %name, manual, "previous execution still running; skipping");
            return Ok(ExecutionOutcome::Skipped);
        };
        running.store(true, Ordering::SeqCst);
        let _running = RunningGuard(running);

        let mut def = self
            .store
            .get_job(name)
            .await?
            .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;

        let started = Utc::now();
        def.last_run = Some(started);
        def.run_count += 1;
        def.updated_at = started;
        self.store.put_job(&def).await?;
        info!(job = %name, manual, "job execution started");

        let timeout = Duration::from_secs(def.timeout_secs.max(1));
        let ctx = self.ctx.clone();
        let task = tokio::spawn(async move { handler.execute(ctx.as_ref()).await });
        let abort = task.abort_handle();

        let verdict: Result<String, String> = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(summary))) => Ok(summary),
            Ok(Ok(Err(err))) => Err(format!("{err:#}")),
            Ok(Err(join_err)) if join_err.is_panic() => Err("handler panicked".to_string()),
            Ok(Err(_)) => Err("handler task cancelled".to_string()),
            Err(_) => {
                abort.abort();
                Err(format!("timed out after {}s", def.timeout_secs))
            }
        };

        let finished = Utc::now();
        // Reload: stop() may have flipped the active flag while we ran.
        let mut def = self
            .store
            .get_job(name)
            .await?
            .ok_or_else(|| SchedError::UnknownJob(name.to_string()))?;
        def.updated_at = finished;

        match verdict {
            Ok(summary) => {
                def.consecutive_failures = 0;
                def.last_error = None;
                self.store.put_job(&def).await?;
                info!(
                    job = %name,
                    elapsed_ms = (finished - started).num_milliseconds(),
                    %summary,
                    "job execution succeeded"
                );
                Ok(ExecutionOutcome::Succeeded)
            }
            Err(message) => {
                def.error_count += 1;
                def.consecutive_failures += 1;
                def.last_error = Some(message.clone());
                let disable = def.consecutive_failures >= self.max_consecutive_failures;
                if disable {
                    def.active = false;
                    def.next_run = None;
                }
                self.store.put_job(&def).await?;
                error!(
                    job = %name,
                    error = %message,
                    consecutive = def.consecutive_failures,
                    "job execution failed"
                );
                if disable {
                    warn!(
                        job = %name,
                        failures = def.consecutive_failures,
                        "auto-disabling job after repeated failures"
                    );
                    self.disarm(name).await;
                }
                Ok(ExecutionOutcome::Failed)
            }
        }
    }

    async fn disarm(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.jobs.get_mut(name) {
            if let Some(timer) = job.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Object-safe control facade so callers (the web surface, the CLI) stay
/// independent of the scheduler's context type.
#[async_trait]
pub trait JobControl: Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<JobStatus>, SchedError>;
    async fn job_status(&self, name: &str) -> Result<JobStatus, SchedError>;
    async fn start_job(&self, name: &str) -> Result<(), SchedError>;
    async fn stop_job(&self, name: &str) -> Result<(), SchedError>;
    async fn trigger_job(&self, name: &str) -> Result<ExecutionOutcome, SchedError>;
}

#[async_trait]
impl<C: Send + Sync + 'static> JobControl for Scheduler<C> {
    async fn list_jobs(&self) -> Result<Vec<JobStatus>, SchedError> {
        self.status_all().await
    }

    async fn job_status(&self, name: &str) -> Result<JobStatus, SchedError> {
        self.status(name).await
    }

    async fn start_job(&self, name: &str) -> Result<(), SchedError> {
        self.start(name).await
    }

    async fn stop_job(&self, name: &str) -> Result<(), SchedError> {
        self.stop(name).await
    }

    async fn trigger_job(&self, name: &str) -> Result<ExecutionOutcome, SchedError> {
        self.trigger(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tap_store::MemoryStore;
    use tokio::sync::Notify;

    struct NoCtx;

    struct ScriptedHandler {
        script: Mutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<Result<String, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }

        fn always_failing() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl JobHandler<NoCtx> for ScriptedHandler {
        async fn execute(&self, _ctx: &NoCtx) -> anyhow::Result<String> {
            match self.script.lock().await.pop_front() {
                Some(Ok(summary)) => Ok(summary),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("scripted failure")),
            }
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler<NoCtx> for PanickingHandler {
        async fn execute(&self, _ctx: &NoCtx) -> anyhow::Result<String> {
            panic!("boom");
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler<NoCtx> for SlowHandler {
        async fn execute(&self, _ctx: &NoCtx) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("slept".to_string())
        }
    }

    struct GatedHandler {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler<NoCtx> for GatedHandler {
        async fn execute(&self, _ctx: &NoCtx) -> anyhow::Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("released".to_string())
        }
    }

    fn spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            description: format!("test job {name}"),
            recurrence: Recurrence::Every { minutes: 60 },
            timeout_secs: 300,
        }
    }

    fn scheduler(store: Arc<dyn Store>) -> Scheduler<NoCtx> {
        Scheduler::new(store, Arc::new(NoCtx), DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }

    #[tokio::test]
    async fn five_consecutive_failures_deactivate_the_job() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched
            .register(spec("flaky"), ScriptedHandler::always_failing())
            .await
            .unwrap();

        for _ in 0..5 {
            assert_eq!(
                sched.trigger("flaky").await.unwrap(),
                ExecutionOutcome::Failed
            );
        }

        let def = store.get_job("flaky").await.unwrap().unwrap();
        assert!(!def.active);
        assert_eq!(def.consecutive_failures, 5);
        assert_eq!(def.error_count, 5);
        assert_eq!(def.run_count, 5);

        // A disabled job still honors a manual trigger, once, without
        // rearming anything.
        assert_eq!(
            sched.trigger("flaky").await.unwrap(),
            ExecutionOutcome::Failed
        );
        let def = store.get_job("flaky").await.unwrap().unwrap();
        assert!(!def.active);
        assert_eq!(def.run_count, 6);
        let status = sched.status("flaky").await.unwrap();
        assert!(!status.armed);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_driven_failures_disable_and_disarm_the_job() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        let mut relapsing = spec("relapsing");
        relapsing.recurrence = Recurrence::Every { minutes: 1 };
        sched
            .register(relapsing, ScriptedHandler::always_failing())
            .await
            .unwrap();
        sched.start("relapsing").await.unwrap();

        // The loop persists the next fire time before sleeping on it.
        let horizon = tokio::time::Instant::now() + Duration::from_secs(600);
        loop {
            let def = store.get_job("relapsing").await.unwrap().unwrap();
            if def.next_run.is_some() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < horizon,
                "next_run was never persisted"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(sched.status("relapsing").await.unwrap().armed);

        // The paused clock fast-forwards across the fire times; the fifth
        // scheduled failure deactivates the job and its timer with it.
        loop {
            let def = store.get_job("relapsing").await.unwrap().unwrap();
            if !def.active {
                break;
            }
            assert!(
                tokio::time::Instant::now() < horizon,
                "job was never auto-disabled"
            );
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let def = store.get_job("relapsing").await.unwrap().unwrap();
        assert_eq!(def.run_count, 5);
        assert_eq!(def.error_count, 5);
        assert_eq!(def.consecutive_failures, 5);
        assert!(def.next_run.is_none());
        assert_eq!(def.last_error.as_deref(), Some("scripted failure"));

        let status = sched.status("relapsing").await.unwrap();
        assert!(!status.armed);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn a_success_resets_the_consecutive_failure_counter() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched
            .register(
                spec("mixed"),
                ScriptedHandler::new(vec![
                    Err("first".to_string()),
                    Err("second".to_string()),
                    Ok("recovered".to_string()),
                    Err("third".to_string()),
                ]),
            )
            .await
            .unwrap();

        for _ in 0..4 {
            sched.trigger("mixed").await.unwrap();
        }

        let def = store.get_job("mixed").await.unwrap().unwrap();
        assert!(def.active);
        assert_eq!(def.consecutive_failures, 1);
        assert_eq!(def.error_count, 3);
        assert_eq!(def.last_error.as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn a_busy_job_skips_instead_of_overlapping() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        sched
            .register(
                spec("gated"),
                GatedHandler {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )
            .await
            .unwrap();

        let background = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.trigger("gated").await })
        };
        entered.notified().await;

        assert_eq!(
            sched.trigger("gated").await.unwrap(),
            ExecutionOutcome::Skipped
        );

        release.notify_one();
        assert_eq!(
            background.await.unwrap().unwrap(),
            ExecutionOutcome::Succeeded
        );

        // The skipped attempt never counted as a run.
        let def = store.get_job("gated").await.unwrap().unwrap();
        assert_eq!(def.run_count, 1);
        assert_eq!(def.error_count, 0);
    }

    #[tokio::test]
    async fn status_polling_never_disturbs_a_running_job() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        sched
            .register(
                spec("watched"),
                GatedHandler {
                    entered: entered.clone(),
                    release: release.clone(),
                },
            )
            .await
            .unwrap();

        assert!(!sched.status("watched").await.unwrap().running);

        let background = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.trigger("watched").await })
        };
        entered.notified().await;

        // Polling is read-only: repeated polls keep seeing the run, and the
        // overlap guard still reports busy afterwards.
        for _ in 0..3 {
            assert!(sched.status("watched").await.unwrap().running);
        }
        assert_eq!(
            sched.trigger("watched").await.unwrap(),
            ExecutionOutcome::Skipped
        );

        release.notify_one();
        assert_eq!(
            background.await.unwrap().unwrap(),
            ExecutionOutcome::Succeeded
        );
        assert!(!sched.status("watched").await.unwrap().running);
    }

    #[tokio::test]
    async fn overruns_are_aborted_and_recorded_as_failures() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        let mut slow_spec = spec("slow");
        slow_spec.timeout_secs = 1;
        sched.register(slow_spec, SlowHandler).await.unwrap();

        assert_eq!(
            sched.trigger("slow").await.unwrap(),
            ExecutionOutcome::Failed
        );
        let def = store.get_job("slow").await.unwrap().unwrap();
        assert_eq!(def.consecutive_failures, 1);
        assert!(def.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn handler_panics_are_contained_as_failures() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched.register(spec("panicky"), PanickingHandler).await.unwrap();

        assert_eq!(
            sched.trigger("panicky").await.unwrap(),
            ExecutionOutcome::Failed
        );
        let def = store.get_job("panicky").await.unwrap().unwrap();
        assert_eq!(def.error_count, 1);
        assert_eq!(def.last_error.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn re_registration_updates_metadata_but_keeps_counters() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched
            .register(spec("steady"), ScriptedHandler::always_failing())
            .await
            .unwrap();
        sched.trigger("steady").await.unwrap();

        let mut updated = spec("steady");
        updated.description = "updated description".to_string();
        updated.recurrence = Recurrence::Daily { hour: 2, minute: 0 };
        sched
            .register(updated, ScriptedHandler::always_failing())
            .await
            .unwrap();

        let def = store.get_job("steady").await.unwrap().unwrap();
        assert_eq!(def.description, "updated description");
        assert_eq!(def.recurrence, Recurrence::Daily { hour: 2, minute: 0 });
        assert_eq!(def.run_count, 1);
        assert_eq!(def.error_count, 1);

        // A fresh scheduler over the same store keeps seeing the counters.
        let rebooted = scheduler(store.clone());
        rebooted
            .register(spec("steady"), ScriptedHandler::always_failing())
            .await
            .unwrap();
        let def = store.get_job("steady").await.unwrap().unwrap();
        assert_eq!(def.run_count, 1);
        assert_eq!(def.error_count, 1);
    }

    #[tokio::test]
    async fn stopped_jobs_still_run_on_manual_trigger() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched
            .register(spec("paused"), ScriptedHandler::new(vec![Ok("ran".to_string())]))
            .await
            .unwrap();

        sched.stop("paused").await.unwrap();
        let def = store.get_job("paused").await.unwrap().unwrap();
        assert!(!def.active);

        assert_eq!(
            sched.trigger("paused").await.unwrap(),
            ExecutionOutcome::Succeeded
        );
        let def = store.get_job("paused").await.unwrap().unwrap();
        assert!(!def.active);
        assert_eq!(def.run_count, 1);
        let status = sched.status("paused").await.unwrap();
        assert!(!status.armed);
    }

    #[tokio::test]
    async fn start_rearms_and_clears_only_the_consecutive_counter() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store.clone());
        sched
            .register(spec("revived"), ScriptedHandler::always_failing())
            .await
            .unwrap();

        for _ in 0..5 {
            sched.trigger("revived").await.unwrap();
        }
        assert!(!store.get_job("revived").await.unwrap().unwrap().active);

        sched.start("revived").await.unwrap();
        let def = store.get_job("revived").await.unwrap().unwrap();
        assert!(def.active);
        assert_eq!(def.consecutive_failures, 0);
        assert_eq!(def.error_count, 5);

        let status = sched.status("revived").await.unwrap();
        assert!(status.armed);

        sched.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_names_are_reported() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sched = scheduler(store);
        assert!(matches!(
            sched.trigger("nope").await,
            Err(SchedError::UnknownJob(_))
        ));
        assert!(matches!(
            sched.status("nope").await,
            Err(SchedError::UnknownJob(_))
        ));
    }
}
