use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OracleError, Result};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// The declarative description of one oracle run.
#[derive(Debug, Clone, Deserialize)]
pub struct Spec {
    pub base_url: String,
    pub initial_path: String,
    pub steps: Vec<StepInput>,
    pub capture: CaptureInput,
    #[serde(default)]
    pub timeout_ms: Option<Value>,
    #[serde(default)]
    pub prevent_submit_default: Option<Value>,
}

impl Spec {
    /// Effective wait/navigation timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        positive_millis(self.timeout_ms.as_ref()).unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Longest wait the capture stage may make: its own override when set,
    /// otherwise the run timeout.
    pub fn capture_timeout_ms(&self) -> u64 {
        let override_ms = match &self.capture {
            CaptureInput::Known(
                Capture::SelectorText { timeout_ms, .. } | Capture::CurrentPath { timeout_ms, .. },
            ) => positive_millis(timeout_ms.as_ref()),
            _ => None,
        };
        override_ms.unwrap_or_else(|| self.timeout_ms())
    }

    /// Accepted for compatibility and only logged: the submission observer
    /// cancels navigation on every submit regardless.
    pub fn prevent_submit_default(&self) -> bool {
        matches!(self.prevent_submit_default, Some(Value::Bool(true)))
            || matches!(self.capture, CaptureInput::Known(Capture::SubmitResult {}))
    }
}

/// A step as it appeared in the input. Unrecognised steps are kept so the
/// failure can be attributed to their position when the interpreter gets there.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StepInput {
    Known(Step),
    Unknown(Value),
}

const STEP_OPS: [&str; 8] = [
    "within",
    "fill_in",
    "check",
    "choose",
    "uncheck",
    "select",
    "click_button",
    "submit",
];

impl StepInput {
    /// Op name as recorded in the trace.
    pub fn op(&self) -> String {
        match self {
            StepInput::Known(step) => step.op().to_string(),
            StepInput::Unknown(raw) => match raw.get("op") {
                None | Some(Value::Null) => "unknown".to_string(),
                Some(op) => js_string(Some(op)),
            },
        }
    }

    pub fn decode(&self) -> Result<&Step> {
        match self {
            StepInput::Known(step) => Ok(step),
            StepInput::Unknown(raw) => {
                let op = js_string(raw.get("op"));
                if STEP_OPS.contains(&op.as_str()) {
                    let reason = serde_json::from_value::<Step>(raw.clone())
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "malformed step".to_string());
                    Err(OracleError::SpecValidation(format!(
                        "Invalid {} step: {}",
                        op, reason
                    )))
                } else {
                    Err(OracleError::UnsupportedOperation(format!(
                        "Unsupported op: {}",
                        op
                    )))
                }
            }
        }
    }
}

/// A single semantic UI interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Within {
        mode: String,
        #[serde(default)]
        selector: Option<String>,
    },
    FillIn {
        label: String,
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        exact: Option<bool>,
    },
    Check(ToggleStep),
    Choose(ToggleStep),
    Uncheck(ToggleStep),
    Select {
        from: String,
        option: Value,
        #[serde(default)]
        exact_option: Option<bool>,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        exact: Option<bool>,
    },
    ClickButton {
        text: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        exact: Option<bool>,
    },
    Submit {
        #[serde(default)]
        form_selector: Option<String>,
        #[serde(default)]
        submitter_selector: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleStep {
    pub label: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub exact: Option<bool>,
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Within { .. } => "within",
            Step::FillIn { .. } => "fill_in",
            Step::Check(_) => "check",
            Step::Choose(_) => "choose",
            Step::Uncheck(_) => "uncheck",
            Step::Select { .. } => "select",
            Step::ClickButton { .. } => "click_button",
            Step::Submit { .. } => "submit",
        }
    }
}

/// Matching defaults to exact unless a step explicitly opts out.
pub fn exact(flag: Option<bool>) -> bool {
    flag != Some(false)
}

/// What to extract once all steps have run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Capture {
    FormSnapshot {
        #[serde(default)]
        form_selector: Option<String>,
    },
    SubmitResult {},
    SelectorText {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        wait_for_text: Option<String>,
        #[serde(default)]
        trim: Option<bool>,
        #[serde(default)]
        timeout_ms: Option<Value>,
    },
    CurrentPath {
        #[serde(default)]
        wait_for_contains: Option<String>,
        #[serde(default)]
        timeout_ms: Option<Value>,
    },
}

const CAPTURE_TYPES: [&str; 4] = ["form_snapshot", "submit_result", "selector_text", "current_path"];

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CaptureInput {
    Known(Capture),
    Unknown(Value),
}

impl CaptureInput {
    pub fn decode(&self) -> Result<&Capture> {
        match self {
            CaptureInput::Known(capture) => Ok(capture),
            CaptureInput::Unknown(raw) => {
                let kind = js_string(raw.get("type"));
                if CAPTURE_TYPES.contains(&kind.as_str()) {
                    let reason = serde_json::from_value::<Capture>(raw.clone())
                        .err()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "malformed capture".to_string());
                    Err(OracleError::Capture(format!(
                        "Invalid {} capture: {}",
                        kind, reason
                    )))
                } else {
                    Err(OracleError::UnsupportedOperation(format!(
                        "Unsupported capture type: {}",
                        kind
                    )))
                }
            }
        }
    }
}

/// Interpret a timeout the way a loosely-typed caller would write it:
/// numbers and numeric strings count when finite and positive.
pub fn positive_millis(value: Option<&Value>) -> Option<u64> {
    let millis = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (millis.is_finite() && millis > 0.0).then(|| millis.ceil() as u64)
}

/// String conversion matching how the page would stringify a JSON value.
pub fn js_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(js_number).unwrap_or_default()
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => js_string(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

/// `String(number)` for a finite float. f64 Display already drops a trailing
/// ".0"; outside [1e-6, 1e21) the page switches to exponent form.
fn js_number(f: f64) -> String {
    if f == 0.0 {
        return "0".to_string();
    }
    let magnitude = f.abs();
    if (1e-6..1e21).contains(&magnitude) {
        return f.to_string();
    }
    let formatted = format!("{:e}", f);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{}e+{}", mantissa, exponent)
        }
        _ => formatted,
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub op: String,
    pub scope_depth: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Console output and uncaught errors observed on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageEvent {
    #[serde(rename = "console")]
    Console { level: String, text: String },
    #[serde(rename = "pageerror")]
    PageError { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Step(StepRecord),
    Page(PageEvent),
}

/// Append-only audit log of a run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.entries.push(TraceEntry::Step(record));
    }

    pub fn record_events(&mut self, events: impl IntoIterator<Item = PageEvent>) {
        self.entries.extend(events.into_iter().map(TraceEntry::Page));
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            TraceEntry::Step(record) => Some(record),
            TraceEntry::Page(_) => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Submission and capture payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitterInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitTarget {
    pub effective_method: String,
    pub effective_action: String,
    pub form_selector: Option<String>,
}

/// Ground truth for one intercepted form submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResult {
    pub submitted: bool,
    pub submitter: Option<SubmitterInfo>,
    pub entries: Vec<(String, String)>,
    #[serde(flatten)]
    pub target: Option<SubmitTarget>,
}

impl SubmitResult {
    /// The result reported when nothing was submitted.
    pub fn empty() -> Self {
        Self {
            submitted: false,
            submitter: None,
            entries: Vec::new(),
            target: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSummary {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub disabled: bool,
    pub form_owner_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormSnapshot {
    pub form_selector: Option<String>,
    pub method_attr: Option<String>,
    pub action_attr: Option<String>,
    pub effective_method: String,
    pub effective_action: String,
    pub entries: Vec<(String, String)>,
    pub controls: Vec<ControlSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectorText {
    pub selector: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentPath {
    pub current_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CaptureOutput {
    FormSnapshot(FormSnapshot),
    SubmitResult(SubmitResult),
    SelectorText(SelectorText),
    CurrentPath(CurrentPath),
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Launch,
    Navigation,
    Steps,
    Capture,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub kind: String,
    pub stage: Stage,
    pub detail: String,
}

/// The single document emitted per run.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OracleResult {
    Success {
        ok: bool,
        trace: Trace,
        capture: CaptureOutput,
    },
    Failure {
        ok: bool,
        trace: Trace,
        failed_step_index: Option<usize>,
        failed_op: Option<String>,
        error_message: String,
        diagnostic: Diagnostic,
    },
}

impl OracleResult {
    pub fn success(trace: Trace, capture: CaptureOutput) -> Self {
        OracleResult::Success {
            ok: true,
            trace,
            capture,
        }
    }

    pub fn failure(trace: Trace, error: &OracleError, stage: Stage) -> Self {
        OracleResult::Failure {
            ok: false,
            trace,
            failed_step_index: error.step_index(),
            failed_op: error.step_op().map(String::from),
            error_message: error.to_string(),
            diagnostic: Diagnostic {
                kind: error.kind().to_string(),
                stage,
                detail: error.detail(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, OracleResult::Success { .. })
    }

    pub fn trace(&self) -> &Trace {
        match self {
            OracleResult::Success { trace, .. } | OracleResult::Failure { trace, .. } => trace,
        }
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_ok() { 0 } else { 1 }
    }
}
