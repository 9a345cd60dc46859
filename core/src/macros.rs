//! Macro catalog model: definitions, steps, failure policy and button layouts,
//! plus the YAML loader that turns `macros.yaml` into an immutable snapshot.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Parsed `macros.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MacroCatalog {
    /// Macro key -> definition.
    #[serde(default)]
    pub macros: BTreeMap<String, MacroDefinition>,
    /// Page -> button sections.
    #[serde(default)]
    pub buttons: BTreeMap<String, Vec<ButtonSection>>,
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct MacroDefinition {
    /// Catalog key (filled from the map key on load).
    #[serde(skip)]
    pub key: String,
    /// Human label; defaults to the key.
    #[serde(default)]
    pub label: String,
    /// Icon name for the button.
    #[serde(default)]
    pub icon: Option<String>,
    /// Longer description for preview screens.
    #[serde(default)]
    pub description: Option<String>,
    /// Prompt shown before running.
    #[serde(default)]
    pub confirm: Option<String>,
    /// Steps, run in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One entry of a macro: the operation plus its display message and failure policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// What to do.
    pub kind: StepKind,
    /// Text shown while the step runs and used as the error when it aborts.
    pub message: Option<String>,
    /// What to do when the step fails.
    pub on_fail: OnFail,
}

/// Operation carried by a [`Step`], tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Require a home-automation entity to be in `expect` state.
    HaCheck {
        /// Entity id, e.g. `switch.sanctuary_lights`.
        entity: String,
        /// Required state, compared as text.
        #[serde(deserialize_with = "text")]
        expect: String,
    },
    /// Call a home-automation service.
    HaService {
        /// Service domain, e.g. `light`.
        domain: String,
        /// Service name, e.g. `turn_on`.
        service: String,
        /// Service payload.
        #[serde(default)]
        data: Value,
    },
    /// Route a matrix transmitter to a receiver.
    SwitchRoute {
        /// Transmitter (source).
        #[serde(deserialize_with = "text")]
        tx: String,
        /// Receiver (display).
        #[serde(deserialize_with = "text")]
        rx: String,
    },
    /// Send an IR code out of a matrix receiver.
    IrCommand {
        /// Receiver whose IR port is used.
        #[serde(deserialize_with = "text")]
        receiver: String,
        /// Code name understood by the matrix middleware.
        code: String,
    },
    /// Power one projector.
    ProjectorPower {
        /// Projector key from the device config.
        projector: String,
        /// Target power state.
        #[serde(default)]
        state: OnOff,
    },
    /// Power every configured projector.
    ProjectorPowerAll {
        /// Target power state.
        #[serde(default)]
        state: OnOff,
    },
    /// Recall a mixer scene.
    MixerScene {
        /// Scene number.
        scene: u32,
    },
    /// Mute/unmute a mixer channel (`on` = muted).
    MixerMute {
        /// Channel number.
        channel: u32,
        /// `on` mutes, `off` unmutes.
        #[serde(default)]
        state: OnOff,
    },
    /// Send a request to the streaming encoder.
    StreamingAction {
        /// Request type, e.g. `StartStream`.
        action: String,
        /// Request payload.
        #[serde(default)]
        data: Option<Value>,
    },
    /// Recall a camera preset.
    CameraPreset {
        /// Camera key from the device config.
        camera: String,
        /// Preset number.
        preset: u32,
    },
    /// Pause.
    Delay {
        /// Seconds to wait.
        #[serde(default = "one_second")]
        seconds: f64,
    },
    /// Run another macro in place.
    Macro {
        /// Child macro key.
        #[serde(rename = "macro")]
        key: String,
    },
    /// Branch on the outcome of a check step.
    Condition {
        /// Check to evaluate; success selects `then`.
        #[serde(rename = "if")]
        check: Box<Step>,
        /// Steps run when the check succeeds.
        #[serde(default)]
        then: Vec<Step>,
        /// Steps run when the check fails.
        #[serde(default, rename = "else")]
        otherwise: Vec<Step>,
    },
    /// Broadcast the step's message to all panels.
    Notify {},
    /// A `type` this build does not recognize; fails when dispatched.
    #[serde(skip)]
    Unknown {
        /// The unrecognized `type` value.
        name: String,
    },
}

/// Names of every recognized step `type`.
pub const STEP_KINDS: &[&str] = &[
    "ha_check",
    "ha_service",
    "switch_route",
    "ir_command",
    "projector_power",
    "projector_power_all",
    "mixer_scene",
    "mixer_mute",
    "streaming_action",
    "camera_preset",
    "delay",
    "macro",
    "condition",
    "notify",
];

impl StepKind {
    /// The `type` string this step was declared with.
    pub fn name(&self) -> &str {
        match self {
            StepKind::HaCheck { .. } => "ha_check",
            StepKind::HaService { .. } => "ha_service",
            StepKind::SwitchRoute { .. } => "switch_route",
            StepKind::IrCommand { .. } => "ir_command",
            StepKind::ProjectorPower { .. } => "projector_power",
            StepKind::ProjectorPowerAll { .. } => "projector_power_all",
            StepKind::MixerScene { .. } => "mixer_scene",
            StepKind::MixerMute { .. } => "mixer_mute",
            StepKind::StreamingAction { .. } => "streaming_action",
            StepKind::CameraPreset { .. } => "camera_preset",
            StepKind::Delay { .. } => "delay",
            StepKind::Macro { .. } => "macro",
            StepKind::Condition { .. } => "condition",
            StepKind::Notify {} => "notify",
            StepKind::Unknown { name } => name,
        }
    }
}

fn one_second() -> f64 { 1.0 }

/// Accept strings or bare numbers for text fields (`tx: 3`).
fn text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!("expected text, got {other}"))),
    }
}

#[derive(Deserialize)]
struct StepRepr {
    #[serde(flatten)]
    kind: StepKind,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    on_fail: OnFail,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;
        let raw = Value::deserialize(d)?;
        let kind_name = raw.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        if !STEP_KINDS.contains(&kind_name.as_str()) {
            let message = raw.get("message").and_then(Value::as_str).map(str::to_string);
            let on_fail = match raw.get("on_fail") {
                Some(v) => OnFail::deserialize(v).map_err(D::Error::custom)?,
                None => OnFail::default(),
            };
            return Ok(Step { kind: StepKind::Unknown { name: kind_name }, message, on_fail });
        }
        let repr: StepRepr = serde_json::from_value(raw)
            .map_err(|e| D::Error::custom(format!("step `{kind_name}`: {e}")))?;
        Ok(Step { kind: repr.kind, message: repr.message, on_fail: repr.on_fail })
    }
}

/// Binary device state used by power and mute steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnOff {
    /// Powered / muted.
    #[default]
    On,
    /// Standby / unmuted.
    Off,
}

impl fmt::Display for OnOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { OnOff::On => "on", OnOff::Off => "off" })
    }
}

/// Per-step failure policy: `abort`, `skip` or `retry:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OnFail {
    /// Stop the macro.
    #[default]
    Abort,
    /// Swallow the failure and continue.
    Skip,
    /// Re-run up to N more times, then abort.
    Retry(u32),
}

impl TryFrom<String> for OnFail {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        match s.trim() {
            "abort" => Ok(OnFail::Abort),
            "skip" => Ok(OnFail::Skip),
            other => {
                let n = other
                    .strip_prefix("retry:")
                    .and_then(|n| n.trim().parse::<u32>().ok())
                    .ok_or_else(|| format!("invalid on_fail `{other}` (abort | skip | retry:N)"))?;
                if n == 0 {
                    return Err("retry count must be at least 1".to_string());
                }
                Ok(OnFail::Retry(n))
            }
        }
    }
}

impl From<OnFail> for String {
    fn from(p: OnFail) -> String {
        match p {
            OnFail::Abort => "abort".to_string(),
            OnFail::Skip => "skip".to_string(),
            OnFail::Retry(n) => format!("retry:{n}"),
        }
    }
}

/// A titled group of buttons on a panel page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonSection {
    /// Section title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Buttons in display order.
    #[serde(default)]
    pub items: Vec<ButtonItem>,
    /// Layout keys the gateway passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One button.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonItem {
    /// Caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Prompt that overrides the macro's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm: Option<String>,
    /// What pressing the button does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ButtonAction>,
    /// State/badge/style bindings, passed through.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Button press target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonAction {
    /// `macro`, `navigate`, ...
    #[serde(rename = "type")]
    pub kind: String,
    /// Macro key when `kind == "macro"`.
    #[serde(rename = "macro", default, skip_serializing_if = "Option::is_none")]
    pub macro_key: Option<String>,
    /// Remaining action parameters.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Read and parse a catalog file.
pub fn load_catalog(path: &Path) -> Result<MacroCatalog> {
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_catalog(&txt).with_context(|| format!("parse {}", path.display()))
}

/// Parse catalog YAML. Boolean mapping keys are restored to `"on"`/`"off"`
/// before typed deserialization, so registry keys are always the strings the
/// author wrote.
pub fn parse_catalog(text: &str) -> Result<MacroCatalog> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
    let raw = match normalize_keys(raw) {
        serde_yaml::Value::Null => return Ok(MacroCatalog::default()),
        v @ serde_yaml::Value::Mapping(_) => v,
        _ => bail!("catalog root must be a mapping"),
    };
    let mut catalog: MacroCatalog = serde_yaml::from_value(raw)?;
    for (key, def) in catalog.macros.iter_mut() {
        def.key = key.clone();
        if def.label.is_empty() {
            def.label = key.clone();
        }
    }
    Ok(catalog)
}

fn normalize_keys(v: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value as Y;
    match v {
        Y::Mapping(m) => Y::Mapping(
            m.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Y::Bool(true) => Y::String("on".to_string()),
                        Y::Bool(false) => Y::String("off".to_string()),
                        other => other,
                    };
                    (k, normalize_keys(v))
                })
                .collect(),
        ),
        Y::Sequence(s) => Y::Sequence(s.into_iter().map(normalize_keys).collect()),
        Y::Tagged(mut t) => {
            t.value = normalize_keys(std::mem::take(&mut t.value));
            Y::Tagged(t)
        }
        other => other,
    }
}
