//! Macro executor: walks a macro's steps in order, applies skip paths and
//! the per-step `on_fail` policy, recurses into nested macros with a depth
//! ceiling, and reports progress and audit records for every run.

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditSink};
use crate::devices::DeviceBackend;
use crate::dispatcher::{Dispatcher, NestedRunner, StepOutcome};
use crate::error::{GatewayError, MAX_DEPTH};
use crate::macros::{MacroDefinition, OnFail, Step, StepKind};
use crate::progress::{GatewayEvent, MacroProgress, MacroStatus, ProgressBroadcaster};
use crate::registry::MacroRegistry;

/// Audit action recorded for every macro run.
pub const AUDIT_ACTION: &str = "macro:execute";

/// Who asked, and which steps they want left out.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Tablet id or `Schedule:<name>`.
    pub actor: String,
    /// Step paths to skip (`"2"`, `"2.1"`).
    pub skip_paths: HashSet<String>,
}

impl ExecutionContext {
    /// Context with no skip paths.
    pub fn new(actor: impl Into<String>) -> Self {
        Self { actor: actor.into(), skip_paths: HashSet::new() }
    }

    /// Add skip paths.
    pub fn skipping<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths.extend(paths.into_iter().map(Into::into));
        self
    }
}

/// Outcome of one macro run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    /// Every step succeeded or was skipped.
    pub success: bool,
    /// Macro key.
    #[serde(rename = "macro")]
    pub macro_key: String,
    /// Macro label.
    pub label: String,
    /// Steps finished (skipped ones count).
    pub steps_completed: usize,
    /// Top-level steps in the macro.
    pub steps_total: usize,
    /// Abort reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Path of the step that aborted the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Wall time, 0.1 ms resolution.
    pub latency_ms: f64,
}

impl ExecutionResult {
    /// `Err(StepFailed)` carrying the abort reason when the run failed.
    pub fn into_result(self) -> Result<Self, GatewayError> {
        if self.success {
            return Ok(self);
        }
        let msg = self
            .error
            .unwrap_or_else(|| format!("{} failed after {}/{} steps", self.macro_key, self.steps_completed, self.steps_total));
        Err(GatewayError::StepFailed(msg))
    }
}

/// Runs macros from a [`MacroRegistry`] against a device back end.
pub struct MacroExecutor {
    registry: Arc<MacroRegistry>,
    dispatcher: Dispatcher,
    progress: ProgressBroadcaster,
    audit: Arc<dyn AuditSink>,
    retry_backoff: Duration,
}

impl MacroExecutor {
    /// Executor with the default one-second retry backoff.
    pub fn new(
        registry: Arc<MacroRegistry>,
        devices: Arc<dyn DeviceBackend>,
        progress: ProgressBroadcaster,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let dispatcher = Dispatcher::new(devices, progress.clone());
        Self { registry, dispatcher, progress, audit, retry_backoff: Duration::from_secs(1) }
    }

    /// Pause between retry attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Catalog this executor runs from.
    pub fn registry(&self) -> &MacroRegistry { &self.registry }

    /// Progress channel events are published on.
    pub fn progress(&self) -> &ProgressBroadcaster { &self.progress }

    /// Audit log runs are recorded in.
    pub fn audit(&self) -> &Arc<dyn AuditSink> { &self.audit }

    /// Run `key` as a top-level macro.
    ///
    /// `Err` only for structural problems (unknown key, nesting too deep).
    /// When one surfaces from a nested macro the error is
    /// [`GatewayError::Aborted`], carrying this run's report. Step failures
    /// come back as `Ok` with `success == false`.
    pub async fn execute(&self, key: &str, ctx: &ExecutionContext) -> Result<ExecutionResult, GatewayError> {
        self.execute_at(key, ctx, "", 0).await
    }

    /// Run `key` at `depth`, addressing its steps as `prefix` + index.
    pub fn execute_at<'a>(
        &'a self,
        key: &'a str,
        ctx: &'a ExecutionContext,
        prefix: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<ExecutionResult, GatewayError>> {
        async move {
            if depth > MAX_DEPTH {
                warn!(macro_key = key, depth, "nesting too deep");
                return Err(GatewayError::RecursionLimitExceeded(key.to_string()));
            }
            let m = self
                .registry
                .get(key)
                .ok_or_else(|| GatewayError::UnknownMacro(key.to_string()))?;
            let total = m.steps.len();
            if total == 0 {
                return Ok(ExecutionResult {
                    success: true,
                    macro_key: key.to_string(),
                    label: m.label.clone(),
                    steps_completed: 0,
                    steps_total: 0,
                    error: None,
                    failed_step: None,
                    latency_ms: 0.0,
                });
            }

            let run = Run { m, ctx, started: Instant::now() };
            info!(macro_key = key, actor = %ctx.actor, depth, steps = total, "macro started");
            self.emit(&run, MacroStatus::Started, 0, None, None);

            let mut completed = 0;
            for (i, step) in m.steps.iter().enumerate() {
                let path = format!("{prefix}{i}");
                if ctx.skip_paths.contains(&path) {
                    info!(macro_key = key, %path, "step skipped by caller");
                    completed += 1;
                    continue;
                }
                let current = step
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Step {}: {}", i + 1, step.kind.name()));
                self.emit(&run, MacroStatus::InProgress, completed, Some(current), None);

                let outcome = match self.run_with_policy(step, ctx, &path, depth).await {
                    Ok(o) => o,
                    Err(e) => {
                        let failed_at = e.partial_result().and_then(|r| r.failed_step.clone()).unwrap_or(path);
                        let result = self.abort(&run, completed, i, e.to_string(), failed_at).await;
                        return Err(e.abort_with(result));
                    }
                };
                if outcome.success {
                    completed += 1;
                    continue;
                }
                let error = step
                    .message
                    .clone()
                    .or(outcome.error)
                    .unwrap_or_else(|| format!("Step {} ({}) failed", i + 1, step.kind.name()));
                let failed_at = outcome.failed_path.unwrap_or(path);
                return Ok(self.abort(&run, completed, i, error, failed_at).await);
            }

            let latency_ms = run.latency_ms();
            info!(macro_key = key, actor = %ctx.actor, latency_ms, "macro completed");
            self.emit(&run, MacroStatus::Completed, completed, None, None);
            self.record(&run, format!("OK {completed}/{total} steps"), latency_ms).await;
            Ok(ExecutionResult {
                success: true,
                macro_key: key.to_string(),
                label: m.label.clone(),
                steps_completed: completed,
                steps_total: total,
                error: None,
                failed_step: None,
                latency_ms,
            })
        }
        .boxed()
    }

    /// One step plus its `on_fail` policy. A `skip`ped failure reads as success.
    async fn run_with_policy(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        path: &str,
        depth: usize,
    ) -> Result<StepOutcome, GatewayError> {
        let mut outcome = self.run_step(step, ctx, path, depth).await?;
        if outcome.success {
            return Ok(outcome);
        }
        match step.on_fail {
            OnFail::Abort => {}
            OnFail::Skip => {
                warn!(%path, error = ?outcome.error, "step failed, skipping");
                return Ok(StepOutcome::ok());
            }
            OnFail::Retry(n) => {
                for attempt in 1..=n {
                    warn!(%path, attempt, of = n, error = ?outcome.error, "step failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                    outcome = self.run_step(step, ctx, path, depth).await?;
                    if outcome.success {
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        path: &str,
        depth: usize,
    ) -> Result<StepOutcome, GatewayError> {
        if let StepKind::Macro { key } = &step.kind {
            let child_prefix = format!("{path}.");
            let child = self.execute_at(key, ctx, &child_prefix, depth + 1).await?;
            return Ok(StepOutcome {
                success: child.success,
                error: child.error,
                failed_path: child.failed_step,
            });
        }
        Ok(self.dispatcher.dispatch(step, &ctx.actor, depth, self).await)
    }

    async fn abort(&self, run: &Run<'_>, completed: usize, index: usize, error: String, path: String) -> ExecutionResult {
        let latency_ms = run.latency_ms();
        warn!(macro_key = %run.m.key, actor = %run.ctx.actor, step = %path, %error, "macro failed");
        self.emit(run, MacroStatus::Failed, completed, None, Some(error.clone()));
        self.record(run, format!("FAILED at step {}: {error}", index + 1), latency_ms).await;
        ExecutionResult {
            success: false,
            macro_key: run.m.key.clone(),
            label: run.m.label.clone(),
            steps_completed: completed,
            steps_total: run.m.steps.len(),
            error: Some(error),
            failed_step: Some(path),
            latency_ms,
        }
    }

    fn emit(
        &self,
        run: &Run<'_>,
        status: MacroStatus,
        completed: usize,
        current_step: Option<String>,
        error: Option<String>,
    ) {
        self.progress.publish(GatewayEvent::Progress(MacroProgress {
            macro_key: run.m.key.clone(),
            label: run.m.label.clone(),
            status,
            actor: run.ctx.actor.clone(),
            steps_total: run.m.steps.len(),
            steps_completed: completed,
            current_step,
            error,
        }));
    }

    /// Audit writes may touch disk, so they run on the blocking pool.
    async fn record(&self, run: &Run<'_>, result: String, latency_ms: f64) {
        let request = json!({ "label": run.m.label, "steps": run.m.steps.len() }).to_string();
        let entry = AuditEntry::now(&run.ctx.actor, AUDIT_ACTION, &run.m.key, request, result, latency_ms);
        let audit = self.audit.clone();
        match tokio::task::spawn_blocking(move || audit.record(entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(macro_key = %run.m.key, "audit write failed: {e:#}"),
            Err(e) => warn!(macro_key = %run.m.key, "audit writer panicked: {e}"),
        }
    }
}

impl NestedRunner for MacroExecutor {
    fn run_nested<'a>(
        &'a self,
        key: &'a str,
        actor: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<StepOutcome, GatewayError>> {
        async move {
            debug!(macro_key = key, depth, "nested macro from condition");
            let ctx = ExecutionContext::new(actor);
            let r = self.execute_at(key, &ctx, "", depth).await?;
            Ok(StepOutcome { success: r.success, error: r.error, failed_path: None })
        }
        .boxed()
    }
}

struct Run<'a> {
    m: &'a MacroDefinition,
    ctx: &'a ExecutionContext,
    started: Instant,
}

impl Run<'_> {
    fn latency_ms(&self) -> f64 {
        (self.started.elapsed().as_secs_f64() * 10_000.0).round() / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::KvAudit;
    use crate::devices::{DeviceOp, DeviceReply};
    use crate::macros::OnOff;
    use crate::store::MemKv;
    use crate::testkit::{BrokenAudit, FakeDevices};
    use anyhow::anyhow;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::sync::broadcast::Receiver;

    const CATALOG: &str = r#"
macros:
  empty:
    label: Nothing
    steps: []
  three:
    label: Three scenes
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: mixer_scene, scene: 2 }
      - { type: mixer_scene, scene: 3 }
  flaky:
    steps:
      - { type: mixer_scene, scene: 7, on_fail: "retry:3" }
      - { type: mixer_scene, scene: 8 }
  tolerant:
    steps:
      - { type: mixer_scene, scene: 7, on_fail: skip }
      - { type: mixer_scene, scene: 8 }
  worded:
    steps:
      - { type: mixer_scene, scene: 7, message: "Recalling lobby scene" }
  parent:
    label: Parent
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: mixer_scene, scene: 2 }
      - { type: macro, macro: child }
  child:
    label: Child
    steps:
      - { type: mixer_mute, channel: 1, state: on }
      - { type: mixer_mute, channel: 2, state: on }
  bad_parent:
    steps:
      - { type: macro, macro: bad_child }
  bad_child:
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: mixer_scene, scene: 7 }
  orphan:
    steps:
      - { type: macro, macro: ghost, on_fail: skip }
      - { type: mixer_scene, scene: 1 }
  half_built:
    steps:
      - { type: mixer_scene, scene: 1 }
      - { type: mixer_scene, scene: 2 }
      - { type: macro, macro: ghost }
      - { type: mixer_scene, scene: 3 }
  teleporter:
    steps:
      - { type: teleport }
  d0: { steps: [ { type: macro, macro: d1 } ] }
  d1: { steps: [ { type: macro, macro: d2 } ] }
  d2: { steps: [ { type: macro, macro: d3 } ] }
  d3: { steps: [ { type: macro, macro: d4 } ] }
  d4: { steps: [ { type: macro, macro: d5 } ] }
  d5: { steps: [ { type: macro, macro: d6 } ] }
  d6: { steps: [ { type: mixer_scene, scene: 6 } ] }
  sunday_start:
    label: Sunday Start
    steps:
      - { type: projector_power_all, state: on }
      - { type: delay, seconds: 5 }
      - { type: mixer_scene, scene: 3 }
  sunday_full:
    label: Sunday Full
    steps:
      - { type: ha_check, entity: switch.main_power, expect: "on", message: "Power is off", on_fail: abort }
      - { type: projector_power_all, state: on }
      - { type: delay, seconds: 5 }
      - { type: switch_route, tx: "1", rx: "2" }
  guarded:
    steps:
      - type: condition
        if: { type: ha_check, entity: switch.hall, expect: "on" }
        then:
          - { type: macro, macro: child }
        else:
          - { type: mixer_scene, scene: 4 }
"#;

    fn scene(n: u32) -> DeviceOp { DeviceOp::MixerScene { scene: n } }

    fn executor(devices: Arc<FakeDevices>) -> MacroExecutor {
        let registry = Arc::new(MacroRegistry::parse(CATALOG).unwrap());
        MacroExecutor::new(registry, devices, ProgressBroadcaster::new(64), Arc::new(KvAudit::new(MemKv::new())))
            .with_retry_backoff(Duration::ZERO)
    }

    /// Scene 7 always fails; everything else succeeds; entities read "on".
    fn scene7_broken() -> Arc<FakeDevices> {
        FakeDevices::scripted(|op, _| match op {
            DeviceOp::MixerScene { scene: 7 } => Ok(DeviceReply::failed(500, "scene 7 missing")),
            DeviceOp::HaState { .. } => Ok(DeviceReply::with_state("on")),
            _ => Ok(DeviceReply::ok()),
        })
    }

    fn drain(rx: &mut Receiver<GatewayEvent>) -> Vec<MacroProgress> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let GatewayEvent::Progress(p) = ev {
                out.push(p);
            }
        }
        out
    }

    fn tablet() -> ExecutionContext { ExecutionContext::new("TabletA") }

    #[tokio::test]
    async fn empty_macro_succeeds_silently() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());
        let mut rx = ex.progress().subscribe();

        let r = ex.execute("empty", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!((r.steps_completed, r.steps_total), (0, 0));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(devices.calls().is_empty());
        assert!(ex.audit().recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_and_audit_follow_the_run() {
        let ex = executor(FakeDevices::ok());
        let mut rx = ex.progress().subscribe();

        let r = ex.execute("three", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!((r.steps_completed, r.steps_total), (3, 3));

        let events = drain(&mut rx);
        let statuses: Vec<_> = events.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![
                MacroStatus::Started,
                MacroStatus::InProgress,
                MacroStatus::InProgress,
                MacroStatus::InProgress,
                MacroStatus::Completed
            ]
        );
        assert_eq!(events[2].current_step.as_deref(), Some("Step 2: mixer_scene"));
        assert_eq!(events[2].steps_completed, 1);
        assert_eq!(events[4].steps_completed, 3);
        assert!(events.iter().all(|p| p.actor == "TabletA" && p.label == "Three scenes"));

        let audit = ex.audit().recent(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AUDIT_ACTION);
        assert_eq!(audit[0].target, "three");
        assert_eq!(audit[0].result, "OK 3/3 steps");
        let req: serde_json::Value = serde_json::from_str(&audit[0].request).unwrap();
        assert_eq!(req["steps"], 3);
    }

    #[tokio::test]
    async fn skip_paths_bypass_top_level_steps() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());

        let r = ex.execute("three", &tablet().skipping(["0", "2"])).await.unwrap();
        assert!(r.success);
        assert_eq!(r.steps_completed, 3);
        assert_eq!(devices.calls(), vec![scene(2)]);
    }

    #[tokio::test]
    async fn nested_skip_path_addresses_child_step() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());

        let r = ex.execute("parent", &tablet().skipping(["2.1"])).await.unwrap();
        assert!(r.success);
        assert_eq!(r.steps_completed, 3);
        assert_eq!(
            devices.calls(),
            vec![
                scene(1),
                scene(2),
                DeviceOp::MixerMute { channel: 1, state: OnOff::On },
            ]
        );
    }

    #[tokio::test]
    async fn retry_exhausts_then_aborts() {
        let devices = scene7_broken();
        let ex = executor(devices.clone());
        let mut rx = ex.progress().subscribe();

        let r = ex.execute("flaky", &tablet()).await.unwrap();
        assert!(!r.success);
        assert_eq!(devices.count(&scene(7)), 4);
        assert_eq!(devices.count(&scene(8)), 0);
        assert_eq!(r.steps_completed, 0);
        assert_eq!(r.failed_step.as_deref(), Some("0"));
        assert_eq!(r.error.as_deref(), Some("mixer_scene failed: scene 7 missing"));

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.status, MacroStatus::Failed);
        assert_eq!(last.error, r.error);
        let audit = ex.audit().recent(1).unwrap();
        assert_eq!(audit[0].result, "FAILED at step 1: mixer_scene failed: scene 7 missing");
    }

    #[tokio::test]
    async fn retry_recovers_on_a_later_attempt() {
        let devices = FakeDevices::scripted(|op, n| match op {
            DeviceOp::MixerScene { scene: 7 } if n < 3 => Ok(DeviceReply::failed(500, "busy")),
            _ => Ok(DeviceReply::ok()),
        });
        let ex = executor(devices.clone());

        let r = ex.execute("flaky", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!(devices.count(&scene(7)), 3);
        assert_eq!(devices.count(&scene(8)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_the_backoff() {
        let devices = scene7_broken();
        let registry = Arc::new(MacroRegistry::parse(CATALOG).unwrap());
        let ex = MacroExecutor::new(registry, devices, ProgressBroadcaster::default(), Arc::new(BrokenAudit));

        let before = tokio::time::Instant::now();
        let r = ex.execute("flaky", &tablet()).await.unwrap();
        assert!(!r.success);
        assert!(before.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn failed_run_converts_to_step_failed() {
        let ex = executor(scene7_broken());
        let err = ex.execute("worded", &tablet()).await.unwrap().into_result().unwrap_err();
        assert!(matches!(err, GatewayError::StepFailed(ref m) if m == "Recalling lobby scene"));
        assert!(!err.is_structural());
        assert!(ex.execute("three", &tablet()).await.unwrap().into_result().is_ok());
    }

    #[tokio::test]
    async fn skip_policy_continues() {
        let devices = scene7_broken();
        let ex = executor(devices.clone());

        let r = ex.execute("tolerant", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!(r.steps_completed, 2);
        assert_eq!(devices.count(&scene(7)), 1);
        assert_eq!(devices.count(&scene(8)), 1);
    }

    #[tokio::test]
    async fn step_message_overrides_device_error() {
        let ex = executor(scene7_broken());
        let r = ex.execute("worded", &tablet()).await.unwrap();
        assert_eq!(r.error.as_deref(), Some("Recalling lobby scene"));
    }

    #[tokio::test]
    async fn transport_error_aborts_with_its_text() {
        let devices = FakeDevices::scripted(|_, _| Err(anyhow!("mixer unreachable")));
        let ex = executor(devices);
        let r = ex.execute("three", &tablet()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("mixer unreachable"));
        assert_eq!(r.steps_completed, 0);
    }

    #[tokio::test]
    async fn nested_failure_reports_child_path() {
        let ex = executor(scene7_broken());
        let mut rx = ex.progress().subscribe();

        let r = ex.execute("bad_parent", &tablet()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.failed_step.as_deref(), Some("0.1"));
        assert_eq!(r.error.as_deref(), Some("mixer_scene failed: scene 7 missing"));

        let failed: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|p| p.status == MacroStatus::Failed)
            .map(|p| p.macro_key)
            .collect();
        assert_eq!(failed, vec!["bad_child".to_string(), "bad_parent".to_string()]);
        assert_eq!(ex.audit().recent(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn depth_five_runs_depth_six_is_refused() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());

        let r = ex.execute("d1", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!(devices.calls(), vec![scene(6)]);

        let err = ex.execute("d0", &tablet()).await.unwrap_err();
        assert!(matches!(err.root_cause(), GatewayError::RecursionLimitExceeded(k) if k == "d6"));
        assert_eq!(err.to_string(), "Max nesting depth (5) exceeded at macro d6");
        assert_eq!(devices.calls().len(), 1);

        let report = err.partial_result().unwrap();
        assert_eq!(report.macro_key, "d0");
        assert_eq!(report.failed_step.as_deref(), Some("0.0.0.0.0.0"));
        assert_eq!(report.steps_completed, 0);
    }

    #[tokio::test]
    async fn too_deep_fails_before_any_side_effect() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());
        let mut rx = ex.progress().subscribe();

        let err = ex.execute_at("three", &tablet(), "", MAX_DEPTH + 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::RecursionLimitExceeded(_)));
        assert!(devices.calls().is_empty());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn unknown_macro_is_structural() {
        let ex = executor(FakeDevices::ok());
        let err = ex.execute("nope", &tablet()).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownMacro(ref k) if k == "nope"));
        assert!(err.is_structural());
    }

    #[tokio::test]
    async fn dangling_child_ignores_skip_policy() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());
        let err = ex.execute("orphan", &tablet()).await.unwrap_err();
        assert!(matches!(err.root_cause(), GatewayError::UnknownMacro(k) if k == "ghost"));
        assert!(err.is_structural());
        assert!(devices.calls().is_empty());
        let audit = ex.audit().recent(1).unwrap();
        assert_eq!(audit[0].result, "FAILED at step 1: Unknown macro: ghost");
    }

    #[tokio::test]
    async fn dangling_child_reports_progress_so_far() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());
        let mut rx = ex.progress().subscribe();

        let err = ex.execute("half_built", &tablet()).await.unwrap_err();
        assert!(matches!(err.root_cause(), GatewayError::UnknownMacro(k) if k == "ghost"));
        assert_eq!(devices.calls(), vec![scene(1), scene(2)]);

        let report = err.partial_result().unwrap();
        assert!(!report.success);
        assert_eq!((report.steps_completed, report.steps_total), (2, 4));
        assert_eq!(report.failed_step.as_deref(), Some("2"));
        assert_eq!(report.error.as_deref(), Some("Unknown macro: ghost"));

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!((last.status, last.steps_completed), (MacroStatus::Failed, 2));
        assert_eq!(ex.audit().recent(1).unwrap()[0].result, "FAILED at step 3: Unknown macro: ghost");
    }

    #[tokio::test]
    async fn unknown_step_kind_aborts() {
        let ex = executor(FakeDevices::ok());
        let r = ex.execute("teleporter", &tablet()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Unknown step type: teleport"));
    }

    #[tokio::test]
    async fn condition_runs_nested_macro_from_branch() {
        let devices = FakeDevices::scripted(|op, _| match op {
            DeviceOp::HaState { .. } => Ok(DeviceReply::with_state("on")),
            _ => Ok(DeviceReply::ok()),
        });
        let ex = executor(devices.clone());

        let r = ex.execute("guarded", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!(devices.count(&DeviceOp::MixerMute { channel: 2, state: OnOff::On }), 1);
        assert_eq!(devices.count(&scene(4)), 0);
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_outcome() {
        let registry = Arc::new(MacroRegistry::parse(CATALOG).unwrap());
        let ex = MacroExecutor::new(registry, FakeDevices::ok(), ProgressBroadcaster::default(), Arc::new(BrokenAudit));
        let r = ex.execute("three", &tablet()).await.unwrap();
        assert!(r.success);
    }

    #[tokio::test(start_paused = true)]
    async fn sunday_start_resumes_past_projector_step() {
        let devices = FakeDevices::ok();
        let ex = executor(devices.clone());

        let before = tokio::time::Instant::now();
        let r = ex.execute("sunday_start", &tablet().skipping(["0"])).await.unwrap();
        assert!(r.success);
        assert_eq!((r.steps_completed, r.steps_total), (3, 3));
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert_eq!(devices.calls(), vec![scene(3)]);
        assert_eq!(devices.count(&DeviceOp::ProjectorPowerAll { state: OnOff::On }), 0);

        let audit = ex.audit().recent(1).unwrap();
        assert_eq!((audit[0].actor.as_str(), audit[0].result.as_str()), ("TabletA", "OK 3/3 steps"));
    }

    #[tokio::test(start_paused = true)]
    async fn sunday_full_runs_in_order_with_delay() {
        let devices = FakeDevices::scripted(|op, _| match op {
            DeviceOp::HaState { .. } => Ok(DeviceReply::with_state("on")),
            _ => Ok(DeviceReply::ok()),
        });
        let ex = executor(devices.clone());
        let mut rx = ex.progress().subscribe();

        let before = tokio::time::Instant::now();
        let r = ex.execute("sunday_full", &tablet()).await.unwrap();
        assert!(r.success);
        assert_eq!((r.steps_completed, r.steps_total), (4, 4));
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            devices.calls(),
            vec![
                DeviceOp::HaState { entity: "switch.main_power".into() },
                DeviceOp::ProjectorPowerAll { state: OnOff::On },
                DeviceOp::MatrixSwitch { tx: "1".into(), rx: "2".into() },
            ]
        );
        let events = drain(&mut rx);
        assert_eq!(events.len(), 6);
        assert_eq!(events[1].current_step.as_deref(), Some("Power is off"));
    }

    #[tokio::test]
    async fn sunday_full_aborts_when_power_is_off() {
        let devices = FakeDevices::scripted(|op, _| match op {
            DeviceOp::HaState { .. } => Ok(DeviceReply::with_state("off")),
            _ => Ok(DeviceReply::ok()),
        });
        let ex = executor(devices.clone());

        let r = ex.execute("sunday_full", &tablet()).await.unwrap();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("Power is off"));
        assert_eq!(r.steps_completed, 0);
        assert_eq!(devices.calls().len(), 1);
    }
}
