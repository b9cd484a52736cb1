//! Capture engine: extracts the one requested snapshot once the steps are done.

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::dom::PageLocation;
use crate::driver::{PageDriver, PageScript};
use crate::error::{OracleError, Result};
use crate::interpreter::RunState;
use crate::observer::{SubmissionObserver, form_selector_for, normalize_action, normalize_method};
use crate::types::{
    Capture, CaptureInput, CaptureOutput, ControlSummary, CurrentPath, FormSnapshot,
    SelectorText, SubmitResult, positive_millis,
};
use crate::wait::poll_until;

/// Form state as the page reports it, before normalisation.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    form_id: Option<String>,
    method_attr: Option<String>,
    action_attr: Option<String>,
    base_uri: String,
    location: String,
    #[serde(default)]
    entries: Vec<(String, String)>,
    #[serde(default)]
    controls: Vec<ControlSummary>,
}

pub async fn run_capture<D: PageDriver + ?Sized>(
    driver: &D,
    input: &CaptureInput,
    state: &RunState,
) -> Result<CaptureOutput> {
    let capture = input.decode()?;
    debug!(?capture, "capturing");

    match capture {
        Capture::FormSnapshot { form_selector } => {
            form_snapshot(driver, form_selector.as_deref()).await.map(CaptureOutput::FormSnapshot)
        }
        Capture::SubmitResult {} => submit_result(driver, state).await.map(CaptureOutput::SubmitResult),
        Capture::SelectorText {
            selector,
            wait_for_text,
            trim,
            timeout_ms,
        } => {
            let selector = selector.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
                OracleError::Capture("selector_text capture requires a non-empty selector".to_string())
            })?;
            let timeout = capture_timeout(timeout_ms.as_ref(), state);
            let text = selector_text(driver, selector, wait_for_text.as_deref(), timeout).await?;
            Ok(CaptureOutput::SelectorText(SelectorText {
                selector: selector.to_string(),
                text: if *trim == Some(false) {
                    text
                } else {
                    text.trim().to_string()
                },
            }))
        }
        Capture::CurrentPath {
            wait_for_contains,
            timeout_ms,
        } => {
            let timeout = capture_timeout(timeout_ms.as_ref(), state);
            current_path(driver, wait_for_contains.as_deref(), timeout)
                .await
                .map(|current_path| CaptureOutput::CurrentPath(CurrentPath { current_path }))
        }
    }
}

fn capture_timeout(override_ms: Option<&serde_json::Value>, state: &RunState) -> Duration {
    positive_millis(override_ms)
        .map(Duration::from_millis)
        .unwrap_or(state.timeout)
}

async fn form_snapshot<D: PageDriver + ?Sized>(
    driver: &D,
    form_selector: Option<&str>,
) -> Result<FormSnapshot> {
    let raw = driver
        .run(&PageScript::FormSnapshot {
            form_selector: form_selector.map(str::to_string),
        })
        .await?;
    let raw: RawSnapshot = serde_json::from_value(raw)?;

    Ok(FormSnapshot {
        form_selector: form_selector
            .map(str::to_string)
            .or_else(|| form_selector_for(raw.form_id.as_deref())),
        effective_method: normalize_method(raw.method_attr.as_deref()),
        effective_action: normalize_action(raw.action_attr.as_deref(), &raw.base_uri, &raw.location),
        method_attr: raw.method_attr,
        action_attr: raw.action_attr,
        entries: raw.entries,
        controls: raw.controls,
    })
}

async fn submit_result<D: PageDriver + ?Sized>(driver: &D, state: &RunState) -> Result<SubmitResult> {
    if let Some(submitted) = &state.last_submit {
        return Ok(submitted.clone());
    }
    let from_page = SubmissionObserver::new(driver).read().await?;
    Ok(from_page.unwrap_or_else(SubmitResult::empty))
}

async fn read_text<D: PageDriver + ?Sized>(driver: &D, selector: &str) -> Result<Option<String>> {
    let value = driver
        .run(&PageScript::SelectorText {
            selector: selector.to_string(),
        })
        .await?;
    Ok(value
        .get("text")
        .and_then(|text| text.as_str())
        .map(str::to_string))
}

async fn selector_text<D: PageDriver + ?Sized>(
    driver: &D,
    selector: &str,
    wait_for_text: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let what = format!("selector {:?}", selector);
    let text = poll_until(timeout, &what, || read_text(driver, selector)).await?;

    match wait_for_text.filter(|wanted| !wanted.is_empty()) {
        Some(wanted) if !text.contains(wanted) => {
            let what = format!("selector {:?} to contain {:?}", selector, wanted);
            poll_until(timeout, &what, || async move {
                Ok(read_text(driver, selector)
                    .await?
                    .filter(|text| text.contains(wanted)))
            })
            .await
        }
        _ => Ok(text),
    }
}

async fn read_location<D: PageDriver + ?Sized>(driver: &D) -> Result<PageLocation> {
    let value = driver.run(&PageScript::Location).await?;
    Ok(serde_json::from_value(value)?)
}

async fn current_path<D: PageDriver + ?Sized>(
    driver: &D,
    wait_for_contains: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    match wait_for_contains.filter(|wanted| !wanted.is_empty()) {
        Some(wanted) => {
            let what = format!("path to contain {:?}", wanted);
            poll_until(timeout, &what, || async move {
                let location = read_location(driver).await?;
                Ok(location.path.contains(wanted).then_some(location.path))
            })
            .await
        }
        None => Ok(read_location(driver).await?.path),
    }
}
