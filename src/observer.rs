//! Submission observer: intercepts native form submission on the page and
//! turns the raw record into a [`SubmitResult`].

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::driver::{PageDriver, PageScript};
use crate::error::Result;
use crate::types::{SubmitResult, SubmitTarget, SubmitterInfo};

/// What the page-side listener stores for the latest submission.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSubmission {
    pub submitter: Option<SubmitterInfo>,
    #[serde(default)]
    pub entries: Vec<(String, String)>,
    pub method_attr: Option<String>,
    pub action_attr: Option<String>,
    pub base_uri: String,
    pub location: String,
    pub form_id: Option<String>,
}

impl RawSubmission {
    pub fn into_result(self) -> SubmitResult {
        SubmitResult {
            submitted: true,
            submitter: self.submitter,
            entries: self.entries,
            target: Some(SubmitTarget {
                effective_method: normalize_method(self.method_attr.as_deref()),
                effective_action: normalize_action(
                    self.action_attr.as_deref(),
                    &self.base_uri,
                    &self.location,
                ),
                form_selector: form_selector_for(self.form_id.as_deref()),
            }),
        }
    }
}

/// Lower-cased method, `get` when absent or blank.
pub fn normalize_method(attr: Option<&str>) -> String {
    match attr.map(str::trim) {
        Some(method) if !method.is_empty() => method.to_lowercase(),
        _ => "get".to_string(),
    }
}

/// Path and query of `attr` resolved against `base_uri`. Falls back to the
/// current location when the attribute is absent, blank or unparsable, so
/// comparisons never depend on the origin the page was served from.
pub fn normalize_action(attr: Option<&str>, base_uri: &str, current: &str) -> String {
    let Some(action) = attr.filter(|a| !a.trim().is_empty()) else {
        return current.to_string();
    };

    match Url::parse(base_uri).and_then(|base| base.join(action)) {
        Ok(url) => path_and_query(&url),
        Err(_) => current.to_string(),
    }
}

pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{}", url.path(), query),
        _ => url.path().to_string(),
    }
}

pub fn form_selector_for(form_id: Option<&str>) -> Option<String> {
    form_id.filter(|id| !id.is_empty()).map(|id| format!("#{}", id))
}

/// Passive recorder installed on the page. The interpreter clears it before
/// any action that may submit and reads it right after.
pub struct SubmissionObserver<'a, D: PageDriver + ?Sized> {
    driver: &'a D,
}

impl<'a, D: PageDriver + ?Sized> SubmissionObserver<'a, D> {
    pub fn new(driver: &'a D) -> Self {
        Self { driver }
    }

    /// Idempotent; cheap when the listener is already present.
    pub async fn ensure_installed(&self) -> Result<()> {
        let installed = self.driver.run(&PageScript::InstallSubmitObserver).await?;
        if installed == Value::Bool(true) {
            debug!("submit observer installed on page");
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.driver.run(&PageScript::ClearSubmission).await?;
        Ok(())
    }

    /// The latest intercepted submission, if any.
    pub async fn read(&self) -> Result<Option<SubmitResult>> {
        let raw = self.driver.run(&PageScript::ReadSubmission).await?;
        if raw.is_null() {
            return Ok(None);
        }
        let raw: RawSubmission = serde_json::from_value(raw)?;
        Ok(Some(raw.into_result()))
    }
}
