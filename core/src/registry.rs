//! Macro registry: read-only lookup over the loaded catalog, listing for
//! catalog screens, load-time validation, and the descriptive `expand` tree
//! used to preview a button before confirming it.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{GatewayError, MAX_DEPTH};
use crate::macros::{self, ButtonSection, MacroCatalog, MacroDefinition, Step, StepKind};

/// Immutable macro + button catalog.
#[derive(Debug, Clone, Default)]
pub struct MacroRegistry {
    macros: BTreeMap<String, MacroDefinition>,
    buttons: BTreeMap<String, Vec<ButtonSection>>,
}

/// Catalog listing row.
#[derive(Debug, Clone, Serialize)]
pub struct MacroSummary {
    /// Label.
    pub label: String,
    /// Icon name or `""`.
    pub icon: String,
    /// Description or `""`.
    pub description: String,
    /// Confirmation prompt or `""`.
    pub confirm: String,
    /// Number of top-level steps.
    pub steps: usize,
}

/// Fully resolved step tree of one macro.
#[derive(Debug, Clone, Serialize)]
pub struct ExpandedMacro {
    /// Macro key.
    #[serde(rename = "macro")]
    pub macro_key: String,
    /// Label.
    pub label: String,
    /// Steps with nested macros inlined.
    pub steps: Vec<ExpandedStep>,
    /// Why this level could not be expanded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One node of an [`ExpandedMacro`].
#[derive(Debug, Clone, Serialize)]
pub struct ExpandedStep {
    /// Position within its macro.
    pub index: usize,
    /// Skip-path address (`"2"`, `"2.1"`).
    pub path: String,
    /// Step `type`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Step message, or a generated one-line summary.
    pub label: String,
    /// Failure policy.
    pub on_fail: String,
    /// Nested macro key (`macro` steps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_macro: Option<String>,
    /// Nested macro label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_label: Option<String>,
    /// Nested steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ExpandedStep>>,
    /// Why the nested macro could not be expanded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Problem found by [`MacroRegistry::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    /// `macro <key> step <path>` or `button <page>/<section>/<index>`.
    pub location: String,
    /// What is wrong.
    pub problem: String,
}

impl fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.problem)
    }
}

impl From<MacroCatalog> for MacroRegistry {
    fn from(c: MacroCatalog) -> Self {
        Self { macros: c.macros, buttons: c.buttons }
    }
}

impl MacroRegistry {
    /// Load `macros.yaml`.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(macros::load_catalog(path)?.into())
    }

    /// Parse catalog text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(macros::parse_catalog(text)?.into())
    }

    /// Definition for `key`.
    pub fn get(&self, key: &str) -> Option<&MacroDefinition> {
        self.macros.get(key)
    }

    /// `true` if `key` is defined.
    pub fn contains(&self, key: &str) -> bool {
        self.macros.contains_key(key)
    }

    /// Number of macros.
    pub fn len(&self) -> usize { self.macros.len() }

    /// `true` with no macros loaded.
    pub fn is_empty(&self) -> bool { self.macros.is_empty() }

    /// Catalog metadata keyed by macro key.
    pub fn catalog(&self) -> BTreeMap<String, MacroSummary> {
        self.macros
            .iter()
            .map(|(k, m)| {
                (k.clone(), MacroSummary {
                    label: m.label.clone(),
                    icon: m.icon.clone().unwrap_or_default(),
                    description: m.description.clone().unwrap_or_default(),
                    confirm: m.confirm.clone().unwrap_or_default(),
                    steps: m.steps.len(),
                })
            })
            .collect()
    }

    /// Button sections for `page`.
    pub fn buttons(&self, page: &str) -> &[ButtonSection] {
        self.buttons.get(page).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every page's button sections.
    pub fn all_buttons(&self) -> &BTreeMap<String, Vec<ButtonSection>> {
        &self.buttons
    }

    /// Dangling macro references (steps, condition branches, buttons) and
    /// unknown step kinds. Empty means the catalog is consistent.
    pub fn validate(&self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();
        for (key, m) in &self.macros {
            for (i, step) in m.steps.iter().enumerate() {
                self.check_step(key, &i.to_string(), step, &mut issues);
            }
        }
        for (page, sections) in &self.buttons {
            for section in sections {
                for (i, item) in section.items.iter().enumerate() {
                    let Some(action) = &item.action else { continue };
                    if action.kind != "macro" {
                        continue;
                    }
                    let location = format!(
                        "button {page}/{}/{i}",
                        section.section.as_deref().unwrap_or("")
                    );
                    match action.macro_key.as_deref() {
                        Some(k) if self.contains(k) => {}
                        Some(k) => issues.push(CatalogIssue {
                            location,
                            problem: format!("references unknown macro `{k}`"),
                        }),
                        None => issues.push(CatalogIssue {
                            location,
                            problem: "macro action without a `macro` key".to_string(),
                        }),
                    }
                }
            }
        }
        issues
    }

    fn check_step(&self, key: &str, path: &str, step: &Step, issues: &mut Vec<CatalogIssue>) {
        let location = format!("macro {key} step {path}");
        match &step.kind {
            StepKind::Macro { key: child } if !self.contains(child) => issues.push(CatalogIssue {
                location,
                problem: format!("references unknown macro `{child}`"),
            }),
            StepKind::Unknown { name } => issues.push(CatalogIssue {
                location,
                problem: format!("unknown step type `{name}`"),
            }),
            StepKind::Condition { check, then, otherwise } => {
                self.check_step(key, &format!("{path}.if"), check, issues);
                for (i, s) in then.iter().enumerate() {
                    self.check_step(key, &format!("{path}.then.{i}"), s, issues);
                }
                for (i, s) in otherwise.iter().enumerate() {
                    self.check_step(key, &format!("{path}.else.{i}"), s, issues);
                }
            }
            _ => {}
        }
    }

    /// Step tree of `key` with nested macros resolved inline, down to
    /// [`MAX_DEPTH`]. Purely descriptive.
    pub fn expand(&self, key: &str) -> Result<ExpandedMacro, GatewayError> {
        if !self.contains(key) {
            return Err(GatewayError::UnknownMacro(key.to_string()));
        }
        Ok(self.expand_at(key, "", 0))
    }

    fn expand_at(&self, key: &str, prefix: &str, depth: usize) -> ExpandedMacro {
        if depth > MAX_DEPTH {
            return ExpandedMacro {
                macro_key: key.to_string(),
                label: key.to_string(),
                steps: Vec::new(),
                error: Some(GatewayError::RecursionLimitExceeded(key.to_string()).to_string()),
            };
        }
        let Some(m) = self.get(key) else {
            return ExpandedMacro {
                macro_key: key.to_string(),
                label: key.to_string(),
                steps: Vec::new(),
                error: Some(GatewayError::UnknownMacro(key.to_string()).to_string()),
            };
        };

        let steps = m
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let path = format!("{prefix}{i}");
                let mut node = ExpandedStep {
                    index: i,
                    path: path.clone(),
                    kind: step.kind.name().to_string(),
                    label: step.message.clone().unwrap_or_else(|| summarize(step)),
                    on_fail: step.on_fail.into(),
                    child_macro: None,
                    child_label: None,
                    children: None,
                    error: None,
                };
                if let StepKind::Macro { key: child } = &step.kind {
                    let sub = self.expand_at(child, &format!("{path}."), depth + 1);
                    node.child_macro = Some(child.clone());
                    node.child_label = Some(sub.label);
                    node.children = Some(sub.steps);
                    node.error = sub.error;
                }
                node
            })
            .collect();

        ExpandedMacro { macro_key: key.to_string(), label: m.label.clone(), steps, error: None }
    }
}

/// One-line human summary of a step, by kind.
pub fn summarize(step: &Step) -> String {
    match &step.kind {
        StepKind::HaCheck { entity, expect } => format!("Check {entity} == {expect}"),
        StepKind::HaService { domain, service, data } => {
            match data.get("entity_id").and_then(|v| v.as_str()) {
                Some(entity) => format!("HA {domain}.{service} ({entity})"),
                None => format!("HA {domain}.{service}"),
            }
        }
        StepKind::SwitchRoute { tx, rx } => format!("Switch TX {tx} → RX {rx}"),
        StepKind::IrCommand { receiver, code } => format!("IR {code} → RX {receiver}"),
        StepKind::ProjectorPower { projector, state } => format!("Projector {projector} {state}"),
        StepKind::ProjectorPowerAll { state } => format!("All projectors {state}"),
        StepKind::MixerScene { scene } => format!("Mixer scene {scene}"),
        StepKind::MixerMute { channel, state } => format!("Mixer mute ch{channel} {state}"),
        StepKind::StreamingAction { action, .. } => format!("Streaming {action}"),
        StepKind::CameraPreset { camera, preset } => format!("Camera {camera} preset {preset}"),
        StepKind::Delay { seconds } => format!("Wait {seconds}s"),
        StepKind::Macro { key } => format!("Run macro {key}"),
        StepKind::Condition { check, .. } => format!("If {}", summarize(check)),
        StepKind::Notify {} => format!("Notify: {}", step.message.as_deref().unwrap_or("")),
        StepKind::Unknown { name } => name.clone(),
    }
}
