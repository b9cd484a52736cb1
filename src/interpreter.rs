//! Step interpreter: runs the semantic steps of a spec against a scope stack.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::driver::{ElementHandle, Locator, OptionKey, PageDriver, PageScript, SelectOption};
use crate::error::{OracleError, Result};
use crate::observer::SubmissionObserver;
use crate::types::{
    Spec, Step, StepInput, StepRecord, StepStatus, SubmitResult, ToggleStep, Trace, exact,
    js_string,
};
use crate::wait::poll_until;

/// State threaded through every step and read by the capture stage.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Submission produced by the most recent submitting step.
    pub last_submit: Option<SubmitResult>,
    pub timeout: Duration,
}

impl RunState {
    pub fn for_spec(spec: &Spec) -> Self {
        Self {
            last_submit: None,
            timeout: Duration::from_millis(spec.timeout_ms()),
        }
    }
}

/// Nested element scopes; empty means the whole document.
#[derive(Debug, Default)]
pub struct ScopeStack {
    handles: Vec<ElementHandle>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ElementHandle) {
        self.handles.push(handle);
    }

    pub fn pop(&mut self) -> Result<ElementHandle> {
        self.handles.pop().ok_or_else(|| {
            OracleError::Resolution("within pop called with empty scope stack".to_string())
        })
    }

    pub fn current(&self) -> Option<ElementHandle> {
        self.handles.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.handles.len()
    }
}

pub struct Interpreter<'a, D: PageDriver + ?Sized> {
    driver: &'a D,
    observer: SubmissionObserver<'a, D>,
    scopes: ScopeStack,
    timeout: Duration,
}

impl<'a, D: PageDriver + ?Sized> Interpreter<'a, D> {
    pub fn new(driver: &'a D, timeout: Duration) -> Self {
        Self {
            driver,
            observer: SubmissionObserver::new(driver),
            scopes: ScopeStack::new(),
            timeout,
        }
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    /// Run every step in order. The first failure is recorded in the trace,
    /// attributed to its step and returned; later steps never run.
    pub async fn run(
        &mut self,
        steps: &[StepInput],
        trace: &mut Trace,
        state: &mut RunState,
    ) -> Result<()> {
        for (index, input) in steps.iter().enumerate() {
            let op = input.op();
            debug!(index, op = %op, depth = self.scopes.depth(), "executing step");

            trace.record_events(self.driver.drain_events());
            let outcome = self.run_one(input, state).await;
            trace.record_events(self.driver.drain_events());

            match outcome {
                Ok(()) => trace.record_step(StepRecord {
                    index,
                    op,
                    scope_depth: self.scopes.depth(),
                    status: StepStatus::Ok,
                    message: None,
                }),
                Err(error) => {
                    debug!(index, op = %op, %error, "step failed");
                    trace.record_step(StepRecord {
                        index,
                        op: op.clone(),
                        scope_depth: self.scopes.depth(),
                        status: StepStatus::Error,
                        message: Some(error.to_string()),
                    });
                    return Err(error.at_step(index, op));
                }
            }
        }

        self.observer.ensure_installed().await
    }

    async fn run_one(&mut self, input: &StepInput, state: &mut RunState) -> Result<()> {
        // A navigation or document replacement drops the listener, so check every time.
        self.observer.ensure_installed().await?;
        let step = input.decode()?;
        self.execute(step, state).await
    }

    async fn execute(&mut self, step: &Step, state: &mut RunState) -> Result<()> {
        match step {
            Step::Within { mode, selector } => match mode.as_str() {
                "push" => {
                    let selector = selector.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| {
                        OracleError::SpecValidation("within push requires selector".to_string())
                    })?;
                    let (handle, _) = self.wait_attached(&Locator::Css(selector.to_string())).await?;
                    self.scopes.push(handle);
                    Ok(())
                }
                "pop" => self.scopes.pop().map(|_| ()),
                other => Err(OracleError::UnsupportedOperation(format!(
                    "Unsupported within mode: {}",
                    other
                ))),
            },

            Step::FillIn {
                label,
                value,
                selector,
                exact: flag,
            } => {
                let control = self
                    .labeled_control(
                        label,
                        exact(*flag),
                        selector.as_deref(),
                        "fill_in selector does not match labeled control",
                    )
                    .await?;
                self.driver.fill(control, &js_string(value.as_ref())).await
            }

            Step::Check(toggle) | Step::Choose(toggle) => {
                self.toggle(toggle, true, "check selector does not match labeled control")
                    .await
            }

            Step::Uncheck(toggle) => {
                self.toggle(toggle, false, "uncheck selector does not match labeled control")
                    .await
            }

            Step::Select {
                from,
                option,
                exact_option,
                selector,
                exact: flag,
            } => {
                let control = self
                    .labeled_control(
                        from,
                        exact(*flag),
                        selector.as_deref(),
                        "select selector does not match labeled control",
                    )
                    .await?;

                if exact(*exact_option) {
                    self.driver
                        .select_options(control, OptionKey::Label, &option_items(option))
                        .await
                } else {
                    let options = self.driver.list_options(control).await?;
                    let values = resolve_partial_options(&options, option)?;
                    self.driver
                        .select_options(control, OptionKey::Value, &values)
                        .await
                }
            }

            Step::ClickButton {
                text,
                selector,
                exact: flag,
            } => {
                let locator = Locator::Role {
                    role: "button".to_string(),
                    name: text.clone(),
                    exact: exact(*flag),
                };
                let located = self.wait_attached(&locator).await?;
                let button = self
                    .single(
                        located,
                        &locator,
                        selector.as_deref(),
                        "click_button selector does not match button",
                    )
                    .await?;

                self.observer.clear().await?;
                self.driver.click(button).await?;
                state.last_submit = self.observer.read().await?;
                Ok(())
            }

            // Forms are page-level, so this deliberately ignores the scope stack.
            Step::Submit {
                form_selector,
                submitter_selector,
            } => {
                self.observer.clear().await?;
                self.driver
                    .run(&PageScript::RequestSubmit {
                        form_selector: form_selector.clone(),
                        submitter_selector: submitter_selector.clone(),
                    })
                    .await?;
                state.last_submit = self.observer.read().await?;
                Ok(())
            }
        }
    }

    async fn toggle(&self, toggle: &ToggleStep, checked: bool, mismatch: &str) -> Result<()> {
        let control = self
            .labeled_control(
                &toggle.label,
                exact(toggle.exact),
                toggle.selector.as_deref(),
                mismatch,
            )
            .await?;
        self.driver.set_checked(control, checked).await
    }

    async fn labeled_control(
        &self,
        label: &str,
        exact: bool,
        guard: Option<&str>,
        mismatch: &str,
    ) -> Result<ElementHandle> {
        let locator = Locator::Label {
            text: label.to_string(),
            exact,
        };
        let located = self.wait_attached(&locator).await?;
        self.single(located, &locator, guard, mismatch).await
    }

    /// Wait until `locator` has at least one match under the current scope.
    async fn wait_attached(&self, locator: &Locator) -> Result<(ElementHandle, usize)> {
        let scope = self.scopes.current();
        let driver = self.driver;
        poll_until(self.timeout, &locator.describe(), || async move {
            let located = driver.locate(scope, locator).await?;
            Ok(located.handle.map(|handle| (handle, located.count)))
        })
        .await
    }

    /// Apply the optional selector guard to the first match, then insist the
    /// locator was unambiguous before acting on it.
    async fn single(
        &self,
        (handle, count): (ElementHandle, usize),
        locator: &Locator,
        guard: Option<&str>,
        mismatch: &str,
    ) -> Result<ElementHandle> {
        if let Some(selector) = guard {
            if !self.driver.element_matches(handle, selector).await? {
                return Err(OracleError::Resolution(mismatch.to_string()));
            }
        }

        if count > 1 {
            return Err(OracleError::Resolution(format!(
                "strict mode violation: {} resolved to {} elements",
                locator.describe(),
                count
            )));
        }

        Ok(handle)
    }
}

/// The requested option(s) as strings, in order.
pub fn option_items(option: &Value) -> Vec<String> {
    match option {
        Value::Array(items) => items.iter().map(|item| js_string(Some(item))).collect(),
        other => vec![js_string(Some(other))],
    }
}

/// Resolve each requested option by case-insensitive substring against the
/// option label or value. The first matching option wins; any unmatched
/// request fails the whole selection.
pub fn resolve_partial_options(options: &[SelectOption], wanted: &Value) -> Result<Vec<String>> {
    option_items(wanted)
        .iter()
        .map(|item| {
            let needle = item.to_lowercase();
            options
                .iter()
                .find(|candidate| {
                    candidate.label.to_lowercase().contains(&needle)
                        || candidate.value.to_lowercase().contains(&needle)
                })
                .map(|candidate| candidate.value.clone())
                .ok_or_else(|| {
                    OracleError::Resolution(format!(
                        "Could not resolve option value for {}",
                        wanted
                    ))
                })
        })
        .collect()
}
