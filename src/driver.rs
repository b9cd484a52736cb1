//! The browser seam the oracle drives.
//!
//! Everything the interpreter and capture stages need from a real page goes
//! through [`PageDriver`]: navigation, element location inside a scope,
//! element actions, a closed set of page scripts and console/error events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;
use crate::types::PageEvent;

/// Opaque reference to an element resolved on the page. Stays valid for as
/// long as the element is attached; it is never re-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementHandle(pub u64);

/// How to find elements under a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    /// Controls associated with a label (`<label>`, `aria-label`, `aria-labelledby`).
    Label { text: String, exact: bool },
    /// Elements with an accessible role and name.
    Role { role: String, name: String, exact: bool },
}

impl Locator {
    pub fn describe(&self) -> String {
        match self {
            Locator::Css(selector) => format!("selector {:?}", selector),
            Locator::Label { text, .. } => format!("label {:?}", text),
            Locator::Role { role, name, .. } => format!("role {} named {:?}", role, name),
        }
    }
}

/// Outcome of one location attempt: how many elements matched and the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct Located {
    pub count: usize,
    pub handle: Option<ElementHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

/// Which option attribute a selection names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKey {
    Label,
    Value,
}

/// The page-level scripts the oracle evaluates. Results come back as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScript {
    /// Returns `true` when the listener was newly attached.
    InstallSubmitObserver,
    ClearSubmission,
    /// Returns the raw latest submission record or `null`.
    ReadSubmission,
    RequestSubmit {
        form_selector: Option<String>,
        submitter_selector: Option<String>,
    },
    FormSnapshot {
        form_selector: Option<String>,
    },
    /// Returns `{ text }` for the first match of `selector`, or `null`.
    SelectorText {
        selector: String,
    },
    /// Returns `{ path, ready_state }`.
    Location,
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait until the new document is past `loading`.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()>;

    /// One immediate location attempt under `scope` (the document when `None`).
    async fn locate(&self, scope: Option<ElementHandle>, locator: &Locator) -> Result<Located>;

    async fn element_matches(&self, element: ElementHandle, selector: &str) -> Result<bool>;

    async fn fill(&self, element: ElementHandle, value: &str) -> Result<()>;

    async fn set_checked(&self, element: ElementHandle, checked: bool) -> Result<()>;

    async fn list_options(&self, element: ElementHandle) -> Result<Vec<SelectOption>>;

    /// Select exactly `wanted` (matched by `key`), deselecting everything else.
    async fn select_options(
        &self,
        element: ElementHandle,
        key: OptionKey,
        wanted: &[String],
    ) -> Result<()>;

    async fn click(&self, element: ElementHandle) -> Result<()>;

    async fn run(&self, script: &PageScript) -> Result<Value>;

    /// Console messages and page errors seen since the last drain.
    fn drain_events(&self) -> Vec<PageEvent>;
}
