//! Oracle session controller: validate, launch, navigate, interpret, capture,
//! and always tear the browser down.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::capture::run_capture;
use crate::config::OracleConfig;
use crate::driver::PageDriver;
use crate::error::{OracleError, Result};
use crate::hands::BrowserSession;
use crate::interpreter::{Interpreter, RunState};
use crate::types::{CaptureOutput, OracleResult, Spec, Stage, StepRecord, StepStatus, Trace};

/// Check the spec shape and decode it. Nothing touches a browser before this passes.
pub fn validate(raw: &Value) -> Result<Spec> {
    let invalid = |message: &str| OracleError::SpecValidation(message.to_string());

    let object = raw
        .as_object()
        .ok_or_else(|| invalid("Spec must be a JSON object"))?;

    let non_empty = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    };
    if !non_empty("base_url") || !non_empty("initial_path") {
        return Err(invalid("Spec must include base_url and initial_path"));
    }
    if !object.get("steps").is_some_and(Value::is_array) {
        return Err(invalid("Spec must include a steps array"));
    }
    if !object.get("capture").is_some_and(Value::is_object) {
        return Err(invalid("Spec must include capture"));
    }

    serde_json::from_value(raw.clone())
        .map_err(|e| OracleError::SpecValidation(format!("Invalid spec: {}", e)))
}

/// `initial_path` resolved against `base_url`.
pub fn target_url(spec: &Spec) -> Result<Url> {
    Url::parse(&spec.base_url)
        .and_then(|base| base.join(&spec.initial_path))
        .map_err(|e| {
            OracleError::Navigation(format!(
                "invalid URL {:?} + {:?}: {}",
                spec.base_url, spec.initial_path, e
            ))
        })
}

/// Whole-run budget for `spec`: the configured one, or one derived from the
/// step timeout and the capture's own wait.
pub fn run_budget(spec: &Spec, config: &OracleConfig) -> Duration {
    config.run_budget(
        Duration::from_millis(spec.timeout_ms()),
        spec.steps.len(),
        Duration::from_millis(spec.capture_timeout_ms()),
    )
}

async fn drive<D: PageDriver + ?Sized>(
    driver: &D,
    spec: &Spec,
    trace: &mut Trace,
    stage: &mut Stage,
) -> Result<CaptureOutput> {
    let mut state = RunState::for_spec(spec);
    debug!(
        prevent_submit_default = spec.prevent_submit_default(),
        "submissions are always intercepted"
    );

    *stage = Stage::Navigation;
    let url = target_url(spec)?;
    driver.goto(url.as_str(), state.timeout).await?;
    trace.record_events(driver.drain_events());

    *stage = Stage::Steps;
    Interpreter::new(driver, state.timeout)
        .run(&spec.steps, trace, &mut state)
        .await?;

    *stage = Stage::Capture;
    let captured = run_capture(driver, &spec.capture, &state).await;
    trace.record_events(driver.drain_events());
    captured
}

/// Run a validated spec against an already-open page, bounded by `budget`.
pub async fn run_with_driver<D: PageDriver + ?Sized>(
    driver: &D,
    spec: &Spec,
    budget: Duration,
) -> OracleResult {
    let mut trace = Trace::new();
    let mut stage = Stage::Navigation;

    let outcome = tokio::time::timeout(budget, drive(driver, spec, &mut trace, &mut stage)).await;
    trace.record_events(driver.drain_events());

    match outcome {
        Ok(Ok(capture)) => {
            debug!(entries = trace.entries().len(), "run succeeded");
            OracleResult::success(trace, capture)
        }
        Ok(Err(err)) => {
            info!(stage = ?stage, error = %err.detail(), "run failed");
            OracleResult::failure(trace, &err, stage)
        }
        Err(_) => {
            let mut err = OracleError::Timeout(format!(
                "Run exceeded its {}ms budget",
                budget.as_millis()
            ));
            // The step that was in flight never got to record itself.
            if stage == Stage::Steps {
                let index = trace.steps().count();
                if let Some(op) = spec.steps.get(index).map(|step| step.op()) {
                    trace.record_step(StepRecord {
                        index,
                        op: op.clone(),
                        scope_depth: trace.steps().last().map_or(0, |r| r.scope_depth),
                        status: StepStatus::Error,
                        message: Some(err.to_string()),
                    });
                    err = err.at_step(index, op);
                }
            }
            warn!(stage = ?stage, budget_ms = budget.as_millis() as u64, "run budget exhausted");
            OracleResult::failure(trace, &err, stage)
        }
    }
}

/// Validate `raw`, run it in a fresh browser and shut the browser down.
/// Always produces exactly one result.
pub async fn run(raw: Value, config: &OracleConfig) -> OracleResult {
    let spec = match validate(&raw) {
        Ok(spec) => spec,
        Err(err) => {
            info!(error = %err, "spec rejected");
            return OracleResult::failure(Trace::new(), &err, Stage::Validation);
        }
    };

    let timeout = Duration::from_millis(spec.timeout_ms());
    let budget = run_budget(&spec, config);

    let session = match BrowserSession::launch(config, timeout).await {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "browser launch failed");
            return OracleResult::failure(Trace::new(), &err, Stage::Launch);
        }
    };

    let result = run_with_driver(&session, &spec, budget).await;
    session.shutdown(config.shutdown_grace).await;
    result
}
