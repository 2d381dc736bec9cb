// Scenario model module
//
// A scenario is an ordered list of steps shared read-only by every dialog.
// Loop and branch targets are labels resolved once into step indices, so
// back-edges are plain integers into the step array.

pub mod media;
pub mod template;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SipFlowError;
use crate::sip::message::SipMessage;

/// Category of a scenario definition error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnknownLabel,
    MalformedStep,
    EmptySequence,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseErrorKind::UnknownLabel => "unknown label",
            ParseErrorKind::MalformedStep => "malformed step",
            ParseErrorKind::EmptySequence => "empty sequence",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Scenario parse error ({kind}): {message}")]
pub struct ScenarioParseError {
    pub kind: ParseErrorKind,
    pub message: String,
}

impl ScenarioParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn malformed(index: usize, message: impl fmt::Display) -> Self {
        Self::new(
            ParseErrorKind::MalformedStep,
            format!("step {}: {}", index, message),
        )
    }
}

/// What an inbound message must look like to satisfy an `ExpectRecv` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Response { status: Vec<u16> },
    Request { method: String },
}

impl MatchRule {
    pub fn matches(&self, message: &SipMessage) -> bool {
        match (self, message) {
            (MatchRule::Response { status }, SipMessage::Response(resp)) => {
                status.contains(&resp.status_code)
            }
            (MatchRule::Request { method }, SipMessage::Request(req)) => {
                req.method.as_str() == method
            }
            _ => false,
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            MatchRule::Response { status } => {
                if status.is_empty() {
                    return Err("response match needs at least one status code".to_string());
                }
                if let Some(bad) = status.iter().find(|c| !(100..=699).contains(*c)) {
                    return Err(format!("status code {} is outside 100..=699", bad));
                }
                Ok(())
            }
            MatchRule::Request { method } => {
                if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
                    return Err(format!("request method '{}' must be an uppercase token", method));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::Response { status } => {
                let codes: Vec<String> = status.iter().map(|c| c.to_string()).collect();
                write!(f, "response {}", codes.join("|"))
            }
            MatchRule::Request { method } => write!(f, "request {}", method),
        }
    }
}

/// Condition evaluated by a `Branch` step against the dialog's row and loop counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchCondition {
    #[default]
    Always,
    FieldEquals { field: usize, value: String },
    FieldNotEquals { field: usize, value: String },
    /// True while the named loop marker has been passed fewer than `limit` times.
    CounterBelow { label: String, limit: u32 },
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStep {
    Send {
        template: String,
    },
    ExpectRecv {
        #[serde(rename = "match")]
        rule: MatchRule,
        timeout_ms: u64,
        #[serde(default, skip_serializing_if = "is_false")]
        optional: bool,
    },
    Pause {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    LoopMarker {
        label: String,
    },
    Branch {
        #[serde(default)]
        condition: BranchCondition,
        target: String,
    },
    PlayMedia {
        asset: String,
    },
}

impl ScenarioStep {
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioStep::Send { .. } => "send",
            ScenarioStep::ExpectRecv { .. } => "expect_recv",
            ScenarioStep::Pause { .. } => "pause",
            ScenarioStep::LoopMarker { .. } => "loop_marker",
            ScenarioStep::Branch { .. } => "branch",
            ScenarioStep::PlayMedia { .. } => "play_media",
        }
    }
}

/// On-disk shape of a scenario; `ScenarioModel` is its validated form.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioDefinition {
    #[serde(default)]
    name: String,
    steps: Vec<ScenarioStep>,
}

/// Parsed, validated, immutable call flow.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioModel {
    name: String,
    steps: Vec<ScenarioStep>,
    labels: HashMap<String, usize>,
}

impl ScenarioModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[ScenarioStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&ScenarioStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.get(label).copied()
    }

    /// Number of row fields the scenario reads: one past the highest
    /// `[fieldN]` or branch field index, 0 when no step reads the row.
    pub fn fields_required(&self) -> usize {
        self.steps
            .iter()
            .filter_map(|step| match step {
                ScenarioStep::Send { template: text } => template::max_field_index(text),
                ScenarioStep::Branch {
                    condition:
                        BranchCondition::FieldEquals { field, .. }
                        | BranchCondition::FieldNotEquals { field, .. },
                    ..
                } => Some(*field),
                _ => None,
            })
            .max()
            .map_or(0, |n| n + 1)
    }

    /// Emit the JSON definition this model was parsed from (modulo formatting).
    pub fn serialize(&self) -> serde_json::Result<String> {
        let def = ScenarioDefinition {
            name: self.name.clone(),
            steps: self.steps.clone(),
        };
        serde_json::to_string_pretty(&def)
    }
}

/// Parse and validate a JSON scenario definition.
pub fn parse(definition: &str) -> Result<ScenarioModel, ScenarioParseError> {
    let def: ScenarioDefinition = serde_json::from_str(definition).map_err(|e| {
        ScenarioParseError::new(ParseErrorKind::MalformedStep, format!("invalid definition: {}", e))
    })?;
    build_model(def)
}

/// Read a scenario file and parse it.
pub fn load_from_file(path: &Path) -> Result<ScenarioModel, SipFlowError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SipFlowError::ConfigError(format!(
            "Failed to read scenario file '{}': {}",
            path.display(),
            e
        ))
    })?;
    Ok(parse(&content)?)
}

fn build_model(def: ScenarioDefinition) -> Result<ScenarioModel, ScenarioParseError> {
    if def.steps.is_empty() {
        return Err(ScenarioParseError::new(
            ParseErrorKind::EmptySequence,
            "scenario has no steps",
        ));
    }

    let mut labels = HashMap::new();
    for (index, step) in def.steps.iter().enumerate() {
        if let ScenarioStep::LoopMarker { label } = step {
            if label.is_empty() {
                return Err(ScenarioParseError::malformed(index, "loop marker label is empty"));
            }
            if labels.insert(label.clone(), index).is_some() {
                return Err(ScenarioParseError::malformed(
                    index,
                    format!("duplicate label '{}'", label),
                ));
            }
        }
    }

    for (index, step) in def.steps.iter().enumerate() {
        check_step(index, step, &labels)?;
    }

    let unreachable = unreachable_steps(&def.steps, &labels);
    if let Some(&first) = unreachable.first() {
        return Err(ScenarioParseError::malformed(
            first,
            "step is unreachable from the start of the scenario",
        ));
    }

    Ok(ScenarioModel {
        name: def.name,
        steps: def.steps,
        labels,
    })
}

fn check_step(
    index: usize,
    step: &ScenarioStep,
    labels: &HashMap<String, usize>,
) -> Result<(), ScenarioParseError> {
    match step {
        ScenarioStep::Send { template: text } => {
            if text.trim().is_empty() {
                return Err(ScenarioParseError::malformed(index, "send template is empty"));
            }
            template::validate(text).map_err(|e| ScenarioParseError::malformed(index, e))
        }
        ScenarioStep::ExpectRecv {
            rule, timeout_ms, ..
        } => {
            rule.check().map_err(|e| ScenarioParseError::malformed(index, e))?;
            if *timeout_ms == 0 {
                return Err(ScenarioParseError::malformed(index, "timeout_ms must be greater than 0"));
            }
            Ok(())
        }
        ScenarioStep::Branch { condition, target } => {
            if !labels.contains_key(target) {
                return Err(ScenarioParseError::new(
                    ParseErrorKind::UnknownLabel,
                    format!("step {}: branch target '{}' does not exist", index, target),
                ));
            }
            if let BranchCondition::CounterBelow { label, .. } = condition {
                if !labels.contains_key(label) {
                    return Err(ScenarioParseError::new(
                        ParseErrorKind::UnknownLabel,
                        format!("step {}: counter label '{}' does not exist", index, label),
                    ));
                }
            }
            Ok(())
        }
        ScenarioStep::PlayMedia { asset } if asset.is_empty() => {
            Err(ScenarioParseError::malformed(index, "media asset name is empty"))
        }
        _ => Ok(()),
    }
}

/// Indices of steps that no path from step 0 reaches.
fn unreachable_steps(steps: &[ScenarioStep], labels: &HashMap<String, usize>) -> Vec<usize> {
    let mut seen = vec![false; steps.len()];
    let mut queue = VecDeque::from([0usize]);
    seen[0] = true;

    while let Some(index) = queue.pop_front() {
        let mut next = Vec::with_capacity(2);
        match &steps[index] {
            ScenarioStep::Branch { condition, target } => {
                if let Some(&t) = labels.get(target) {
                    next.push(t);
                }
                if *condition != BranchCondition::Always {
                    next.push(index + 1);
                }
            }
            _ => next.push(index + 1),
        }
        for n in next {
            if n < steps.len() && !seen[n] {
                seen[n] = true;
                queue.push_back(n);
            }
        }
    }

    seen.iter()
        .enumerate()
        .filter(|(_, reached)| !**reached)
        .map(|(i, _)| i)
        .collect()
}
