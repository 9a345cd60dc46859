//! Operation dispatcher: runs one step against the device back end and
//! normalizes whatever happens into a [`StepOutcome`].

use futures::future::{BoxFuture, FutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::devices::{DeviceBackend, DeviceOp, DeviceReply};
use crate::error::GatewayError;
use crate::macros::{Step, StepKind};
use crate::progress::{GatewayEvent, ProgressBroadcaster};

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Did the step do what it was asked?
    pub success: bool,
    /// Failure reason.
    pub error: Option<String>,
    /// Deepest step path that failed (nested macros report their own).
    pub failed_path: Option<String>,
}

impl StepOutcome {
    /// Success.
    pub fn ok() -> Self { Self { success: true, error: None, failed_path: None } }

    /// Failure with a reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), failed_path: None }
    }
}

/// Runs a macro by key from inside the dispatcher (a `macro` step inside a
/// condition branch). Implemented by the executor.
pub trait NestedRunner: Send + Sync {
    /// Run `key` at `depth` for `actor` with no skip paths.
    fn run_nested<'a>(
        &'a self,
        key: &'a str,
        actor: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<StepOutcome, GatewayError>>;
}

/// Maps steps to device operations.
#[derive(Clone)]
pub struct Dispatcher {
    devices: Arc<dyn DeviceBackend>,
    progress: ProgressBroadcaster,
}

impl Dispatcher {
    /// Dispatcher over `devices`; `notify` steps publish on `progress`.
    pub fn new(devices: Arc<dyn DeviceBackend>, progress: ProgressBroadcaster) -> Self {
        Self { devices, progress }
    }

    /// Run one step. Never fails: every fault becomes `success == false`.
    pub fn dispatch<'a>(
        &'a self,
        step: &'a Step,
        actor: &'a str,
        depth: usize,
        nested: &'a dyn NestedRunner,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            debug!(kind = step.kind.name(), actor, depth, "dispatch");
            match &step.kind {
                StepKind::Delay { seconds } => {
                    let pause = Duration::try_from_secs_f64(*seconds).unwrap_or(Duration::ZERO);
                    tokio::time::sleep(pause).await;
                    StepOutcome::ok()
                }
                StepKind::Notify {} => {
                    let message = step.message.clone().unwrap_or_default();
                    self.progress.publish(GatewayEvent::Notification { message });
                    StepOutcome::ok()
                }
                StepKind::Condition { check, then, otherwise } => {
                    let matched = self.dispatch(check, actor, depth, nested).await.success;
                    let branch = if matched { then } else { otherwise };
                    debug!(matched, steps = branch.len(), "condition branch");
                    for sub in branch {
                        let r = self.dispatch(sub, actor, depth, nested).await;
                        if !r.success {
                            return r;
                        }
                    }
                    StepOutcome::ok()
                }
                StepKind::Macro { key } => match nested.run_nested(key, actor, depth + 1).await {
                    Ok(outcome) => outcome,
                    Err(e) => StepOutcome::failed(e.to_string()),
                },
                StepKind::Unknown { name } => {
                    StepOutcome::failed(GatewayError::UnknownStep(name.clone()).to_string())
                }
                kind => match device_op(kind) {
                    Some(op) => self.call(op, kind).await,
                    None => StepOutcome::failed(GatewayError::UnknownStep(kind.name().to_string()).to_string()),
                },
            }
        }
        .boxed()
    }

    async fn call(&self, op: DeviceOp, kind: &StepKind) -> StepOutcome {
        let performed = AssertUnwindSafe(self.devices.perform(&op)).catch_unwind().await;
        let reply = match performed {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(family = op.family(), "device call failed: {e:#}");
                return StepOutcome::failed(format!("{e:#}"));
            }
            Err(_) => {
                warn!(family = op.family(), "device call panicked");
                return StepOutcome::failed(format!("{} call failed unexpectedly", op.family()));
            }
        };
        judge(kind, &reply)
    }
}

fn judge(kind: &StepKind, reply: &DeviceReply) -> StepOutcome {
    if !reply.is_success() {
        let detail = reply.error.clone().unwrap_or_else(|| format!("status={}", reply.status));
        return StepOutcome::failed(format!("{} failed: {detail}", kind.name()));
    }
    if let StepKind::HaCheck { entity, expect } = kind {
        let actual = reply.state.as_deref().unwrap_or("");
        if actual != expect {
            return StepOutcome::failed(format!("{entity} is '{actual}', expected '{expect}'"));
        }
    }
    StepOutcome::ok()
}

/// Device operation for a device-backed step kind.
pub fn device_op(kind: &StepKind) -> Option<DeviceOp> {
    Some(match kind {
        StepKind::HaCheck { entity, .. } => DeviceOp::HaState { entity: entity.clone() },
        StepKind::HaService { domain, service, data } => DeviceOp::HaService {
            domain: domain.clone(),
            service: service.clone(),
            data: data.clone(),
        },
        StepKind::SwitchRoute { tx, rx } => DeviceOp::MatrixSwitch { tx: tx.clone(), rx: rx.clone() },
        StepKind::IrCommand { receiver, code } => DeviceOp::MatrixIr {
            receiver: receiver.clone(),
            code: code.clone(),
        },
        StepKind::ProjectorPower { projector, state } => DeviceOp::ProjectorPower {
            projector: projector.clone(),
            state: *state,
        },
        StepKind::ProjectorPowerAll { state } => DeviceOp::ProjectorPowerAll { state: *state },
        StepKind::MixerScene { scene } => DeviceOp::MixerScene { scene: *scene },
        StepKind::MixerMute { channel, state } => DeviceOp::MixerMute { channel: *channel, state: *state },
        StepKind::StreamingAction { action, data } => DeviceOp::Streaming {
            action: action.clone(),
            data: data.clone(),
        },
        StepKind::CameraPreset { camera, preset } => DeviceOp::CameraPreset {
            camera: camera.clone(),
            preset: *preset,
        },
        StepKind::Delay { .. }
        | StepKind::Macro { .. }
        | StepKind::Condition { .. }
        | StepKind::Notify {}
        | StepKind::Unknown { .. } => return None,
    })
}
