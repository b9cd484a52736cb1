//! In-memory page used by unit tests in place of a browser.
//!
//! The model is a flat list of elements in document order with parent links.
//! Selector support is deliberately small: `#id`, `.class`, `[name=x]` and a
//! bare tag name.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use url::Url;

use crate::driver::{
    ElementHandle, Located, Locator, OptionKey, PageDriver, PageScript, SelectOption,
};
use crate::error::{OracleError, Result};
use crate::observer::path_and_query;
use crate::types::PageEvent;

const ORIGIN: &str = "http://127.0.0.1:4000";

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub tag: String,
    pub kind: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub class: Option<String>,
    pub label: Option<String>,
    pub value: String,
    pub checked: bool,
    pub disabled: bool,
    pub multiple: bool,
    /// `(label, value)` pairs.
    pub options: Vec<(String, String)>,
    pub selected: Vec<usize>,
    pub text: String,
    pub attrs: Vec<(String, String)>,
    parent: Option<usize>,
    detached: bool,
}

impl FakeElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn input(kind: &str, id: &str, name: &str, label: &str) -> Self {
        Self::new("input").kind(kind).id(id).name(name).label(label)
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn options(mut self, options: &[(&str, &str)]) -> Self {
        self.options = options
            .iter()
            .map(|(label, value)| (label.to_string(), value.to_string()))
            .collect();
        if !self.multiple && !self.options.is_empty() {
            self.selected = vec![0];
        }
        self
    }

    fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn kind_or_text(&self) -> &str {
        self.kind.as_deref().unwrap_or("text")
    }

    fn is_button(&self) -> bool {
        self.tag == "button"
            || (self.tag == "input"
                && matches!(self.kind_or_text(), "submit" | "button" | "reset" | "image"))
    }

    fn is_submit_button(&self) -> bool {
        match self.tag.as_str() {
            "button" => matches!(self.kind.as_deref(), None | Some("submit")),
            "input" => matches!(self.kind_or_text(), "submit" | "image"),
            _ => false,
        }
    }

    fn accessible_name(&self) -> String {
        if self.tag == "input" {
            collapse(&self.value)
        } else {
            collapse(&self.text)
        }
    }

    fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        if let Some(id) = selector.strip_prefix('#') {
            return self.id.as_deref() == Some(id);
        }
        if let Some(class) = selector.strip_prefix('.') {
            return self.class.as_deref() == Some(class);
        }
        if let Some(name) = selector
            .strip_prefix("[name=")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            return self.name.as_deref() == Some(name.trim_matches('"'));
        }
        self.tag == selector
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn text_matches(candidate: &str, wanted: &str, exact: bool) -> bool {
    let have = collapse(candidate);
    let want = collapse(wanted);
    if exact {
        have == want
    } else {
        have.to_lowercase().contains(&want.to_lowercase())
    }
}

fn resolution(message: impl Into<String>) -> OracleError {
    OracleError::Resolution(message.into())
}

enum Change {
    Text { id: String, text: String },
    Path(String),
}

struct Pending {
    polls: usize,
    change: Change,
}

#[derive(Default)]
struct PageModel {
    elements: Vec<FakeElement>,
    path: String,
    observer_installed: bool,
    install_count: usize,
    clear_count: usize,
    last_submit: Option<Value>,
    pending: Vec<Pending>,
    visited: Vec<String>,
    hang_navigation: bool,
}

impl PageModel {
    fn index_of(&self, id: &str) -> Option<usize> {
        (0..self.elements.len())
            .find(|&i| self.attached(i) && self.elements[i].id.as_deref() == Some(id))
    }

    fn attached(&self, index: usize) -> bool {
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            if self.elements[i].detached {
                return false;
            }
            cursor = self.elements[i].parent;
        }
        true
    }

    fn contains(&self, ancestor: usize, index: usize) -> bool {
        let mut cursor = self.elements[index].parent;
        while let Some(i) = cursor {
            if i == ancestor {
                return true;
            }
            cursor = self.elements[i].parent;
        }
        false
    }

    fn in_scope(&self, scope: Option<usize>, index: usize) -> bool {
        self.attached(index) && scope.is_none_or(|root| self.contains(root, index))
    }

    fn lookup(&self, handle: ElementHandle) -> Result<usize> {
        let index = handle.0 as usize;
        if index < self.elements.len() && self.attached(index) {
            Ok(index)
        } else {
            Err(resolution(format!(
                "Element handle {} is no longer attached to the document",
                handle.0
            )))
        }
    }

    fn query(&self, selector: &str) -> Option<usize> {
        (0..self.elements.len()).find(|&i| self.attached(i) && self.elements[i].matches(selector))
    }

    fn find_form(&self, selector: Option<&str>) -> Option<usize> {
        match selector {
            Some(selector) => self
                .query(selector)
                .filter(|&i| self.elements[i].tag == "form"),
            None => self.query("form"),
        }
    }

    fn form_of(&self, index: usize) -> Option<usize> {
        let mut cursor = self.elements[index].parent;
        while let Some(i) = cursor {
            if self.elements[i].tag == "form" {
                return Some(i);
            }
            cursor = self.elements[i].parent;
        }
        None
    }

    fn members(&self, form: usize) -> Vec<usize> {
        (0..self.elements.len())
            .filter(|&i| self.attached(i) && self.contains(form, i))
            .collect()
    }

    fn entries(&self, form: usize, submitter: Option<usize>) -> Vec<(String, String)> {
        let mut entries = Vec::new();
        for i in self.members(form) {
            let el = &self.elements[i];
            let Some(name) = el.name.clone() else { continue };
            if el.disabled {
                continue;
            }
            match el.tag.as_str() {
                "input" if matches!(el.kind_or_text(), "checkbox" | "radio") => {
                    if el.checked {
                        let value = if el.value.is_empty() { "on" } else { &el.value };
                        entries.push((name, value.to_string()));
                    }
                }
                "input" | "button" if el.is_button() => {
                    if submitter == Some(i) {
                        entries.push((name, el.value.clone()));
                    }
                }
                "input" | "textarea" => entries.push((name, el.value.clone())),
                "select" => {
                    for &option in &el.selected {
                        entries.push((name.clone(), el.options[option].1.clone()));
                    }
                }
                _ => {}
            }
        }
        entries
    }

    fn submit(&mut self, form: usize, submitter: Option<usize>) {
        if !self.observer_installed {
            return;
        }
        let form_el = &self.elements[form];
        let submitter_el = submitter.map(|i| &self.elements[i]);
        let override_attr =
            |name: &str| submitter_el.and_then(|el| el.get_attr(name)).map(str::to_string);

        let record = json!({
            "submitter": submitter_el.map(|el| json!({
                "tag": el.tag,
                "type": el.kind,
                "name": el.name,
                "value": (!el.value.is_empty()).then(|| el.value.clone()),
                "id": el.id,
            })),
            "entries": self.entries(form, submitter),
            "method_attr": override_attr("formmethod").or_else(|| form_el.get_attr("method").map(str::to_string)),
            "action_attr": override_attr("formaction").or_else(|| form_el.get_attr("action").map(str::to_string)),
            "base_uri": format!("{}{}", ORIGIN, self.path),
            "location": self.path,
            "form_id": form_el.id,
        });
        self.last_submit = Some(record);
    }

    fn snapshot(&self, form: usize) -> Value {
        let form_el = &self.elements[form];
        let controls: Vec<Value> = self
            .members(form)
            .into_iter()
            .map(|i| &self.elements[i])
            .filter(|el| matches!(el.tag.as_str(), "input" | "select" | "textarea" | "button" | "fieldset"))
            .map(|el| {
                let kind = el
                    .kind
                    .clone()
                    .or_else(|| (el.tag == "button").then(|| "submit".to_string()));
                json!({
                    "tag": el.tag,
                    "type": kind.map(|k| k.to_lowercase()),
                    "name": el.name,
                    "id": el.id,
                    "disabled": el.disabled,
                    "form_owner_id": form_el.id,
                })
            })
            .collect();

        json!({
            "form_id": form_el.id,
            "method_attr": form_el.get_attr("method"),
            "action_attr": form_el.get_attr("action"),
            "base_uri": format!("{}{}", ORIGIN, self.path),
            "location": self.path,
            "entries": self.entries(form, None),
            "controls": controls,
        })
    }

    fn tick(&mut self) {
        let mut due = Vec::new();
        self.pending.retain_mut(|pending| {
            pending.polls = pending.polls.saturating_sub(1);
            if pending.polls == 0 {
                due.push(std::mem::replace(&mut pending.change, Change::Path(String::new())));
                false
            } else {
                true
            }
        });
        for change in due {
            match change {
                Change::Text { id, text } => {
                    if let Some(i) = self.index_of(&id) {
                        self.elements[i].text = text;
                    }
                }
                Change::Path(path) => self.path = path,
            }
        }
    }
}

/// A scripted page implementing [`PageDriver`] without a browser.
pub struct FakePage {
    model: Mutex<PageModel>,
    events: Mutex<Vec<PageEvent>>,
}

impl FakePage {
    pub fn new(path: &str) -> Self {
        Self {
            model: Mutex::new(PageModel {
                path: path.to_string(),
                ..PageModel::default()
            }),
            events: Mutex::new(Vec::new()),
        }
    }

    /// A sign-up page with two scoped address blocks and a search form.
    pub fn signup() -> Self {
        let page = Self::new("/users/new");
        let form = page.add(
            None,
            FakeElement::new("form")
                .id("signup")
                .attr("method", "post")
                .attr("action", "/users"),
        );
        page.add(Some(form), FakeElement::input("email", "email", "email", "Email"));
        page.add(Some(form), FakeElement::input("text", "name", "name", "Name"));
        let billing = page.add(Some(form), FakeElement::new("fieldset").id("billing"));
        page.add(
            Some(billing),
            FakeElement::input("text", "billing_street", "billing_street", "Street"),
        );
        let shipping = page.add(Some(form), FakeElement::new("fieldset").id("shipping"));
        page.add(
            Some(shipping),
            FakeElement::input("text", "shipping_street", "shipping_street", "Street"),
        );
        page.add(
            Some(form),
            FakeElement::input("checkbox", "subscribe", "subscribe", "Subscribe").value("yes"),
        );
        page.add(
            Some(form),
            FakeElement::input("radio", "pay_card", "payment", "Card").value("card"),
        );
        page.add(
            Some(form),
            FakeElement::input("radio", "pay_cash", "payment", "Cash").value("cash"),
        );
        page.add(
            Some(form),
            FakeElement::new("select")
                .id("state")
                .name("state")
                .label("State")
                .options(&[
                    ("Choose a state", ""),
                    ("California", "CA"),
                    ("Colorado", "CO"),
                    ("New York", "NY"),
                ]),
        );
        page.add(
            Some(form),
            FakeElement::new("input")
                .kind("text")
                .name("referral")
                .label("Referral code")
                .disabled(),
        );
        page.add(Some(form), FakeElement::new("button").id("signup_button").text("Sign up"));
        page.add(
            Some(form),
            FakeElement::new("button")
                .name("intent")
                .value("draft")
                .attr("formmethod", "get")
                .attr("formaction", "/drafts")
                .text("Save draft"),
        );
        page.add(Some(form), FakeElement::new("button").kind("button").text("Preview"));

        let search = page.add(
            None,
            FakeElement::new("form").id("search").attr("action", "search?x=1"),
        );
        page.add(
            Some(search),
            FakeElement::input("search", "q", "q", "Query").value("rust"),
        );

        page.add(None, FakeElement::new("p").id("status").class("flash"));
        page
    }

    fn model(&self) -> MutexGuard<'_, PageModel> {
        self.model.lock().unwrap()
    }

    pub fn add(&self, parent: Option<usize>, mut element: FakeElement) -> usize {
        let mut model = self.model();
        element.parent = parent;
        model.elements.push(element);
        model.elements.len() - 1
    }

    fn element<T>(&self, id: &str, read: impl FnOnce(&FakeElement) -> T) -> Option<T> {
        let model = self.model();
        model.index_of(id).map(|i| read(&model.elements[i]))
    }

    pub fn value_of(&self, id: &str) -> Option<String> {
        self.element(id, |el| {
            if el.tag == "select" {
                el.selected
                    .first()
                    .map(|&i| el.options[i].1.clone())
                    .unwrap_or_default()
            } else {
                el.value.clone()
            }
        })
    }

    pub fn is_checked(&self, id: &str) -> bool {
        self.element(id, |el| el.checked).unwrap_or(false)
    }

    pub fn observer_installed(&self) -> bool {
        self.model().observer_installed
    }

    pub fn install_count(&self) -> usize {
        self.model().install_count
    }

    pub fn clear_count(&self) -> usize {
        self.model().clear_count
    }

    pub fn path(&self) -> String {
        self.model().path.clone()
    }

    pub fn visited(&self) -> Vec<String> {
        self.model().visited.clone()
    }

    pub fn set_text(&self, id: &str, text: &str) {
        let mut model = self.model();
        if let Some(i) = model.index_of(id) {
            model.elements[i].text = text.to_string();
        }
    }

    pub fn detach(&self, id: &str) {
        let mut model = self.model();
        if let Some(i) = model.index_of(id) {
            model.elements[i].detached = true;
        }
    }

    /// Change an element's text on the `polls`-th text or location read.
    pub fn change_text_after(&self, polls: usize, id: &str, text: &str) {
        self.model().pending.push(Pending {
            polls,
            change: Change::Text {
                id: id.to_string(),
                text: text.to_string(),
            },
        });
    }

    pub fn change_path_after(&self, polls: usize, path: &str) {
        self.model().pending.push(Pending {
            polls,
            change: Change::Path(path.to_string()),
        });
    }

    pub fn hang_navigation(&self) {
        self.model().hang_navigation = true;
    }

    /// Submit a form the way page script would, without going through a step.
    pub fn submit_form(&self, form_id: &str) {
        let mut model = self.model();
        if let Some(form) = model.index_of(form_id) {
            model.submit(form, None);
        }
    }

    pub fn emit_console(&self, level: &str, text: &str) {
        self.events.lock().unwrap().push(PageEvent::Console {
            level: level.to_string(),
            text: text.to_string(),
        });
    }

    pub fn emit_page_error(&self, message: &str) {
        self.events.lock().unwrap().push(PageEvent::PageError {
            message: message.to_string(),
        });
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<()> {
        let hang = self.model().hang_navigation;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let parsed = Url::parse(url).map_err(|e| OracleError::Navigation(e.to_string()))?;
        let mut model = self.model();
        model.path = path_and_query(&parsed);
        model.visited.push(url.to_string());
        model.observer_installed = false;
        model.last_submit = None;
        Ok(())
    }

    async fn locate(&self, scope: Option<ElementHandle>, locator: &Locator) -> Result<Located> {
        let model = self.model();
        let scope = scope.map(|handle| model.lookup(handle)).transpose()?;
        let found: Vec<usize> = (0..model.elements.len())
            .filter(|&i| model.in_scope(scope, i))
            .filter(|&i| {
                let el = &model.elements[i];
                match locator {
                    Locator::Css(selector) => el.matches(selector),
                    Locator::Label { text, exact } => el
                        .label
                        .as_deref()
                        .is_some_and(|label| text_matches(label, text, *exact)),
                    Locator::Role { role, name, exact } => {
                        role == "button"
                            && el.is_button()
                            && text_matches(&el.accessible_name(), name, *exact)
                    }
                }
            })
            .collect();

        Ok(Located {
            count: found.len(),
            handle: found.first().map(|&i| ElementHandle(i as u64)),
        })
    }

    async fn element_matches(&self, element: ElementHandle, selector: &str) -> Result<bool> {
        let model = self.model();
        let index = model.lookup(element)?;
        Ok(model.elements[index].matches(selector))
    }

    async fn fill(&self, element: ElementHandle, value: &str) -> Result<()> {
        let mut model = self.model();
        let index = model.lookup(element)?;
        let el = &mut model.elements[index];
        let fillable = match el.tag.as_str() {
            "input" => !matches!(
                el.kind_or_text(),
                "checkbox" | "radio" | "file" | "submit" | "button" | "reset" | "image" | "hidden"
            ),
            "textarea" => true,
            _ => false,
        };
        if !fillable {
            return Err(resolution(format!(
                "Input of type \"{}\" cannot be filled",
                el.kind_or_text()
            )));
        }
        if el.disabled {
            return Err(resolution("Element is not enabled"));
        }
        el.value = value.to_string();
        Ok(())
    }

    async fn set_checked(&self, element: ElementHandle, checked: bool) -> Result<()> {
        let mut model = self.model();
        let index = model.lookup(element)?;
        let el = &model.elements[index];
        let kind = el.kind_or_text().to_string();
        if el.tag != "input" || !matches!(kind.as_str(), "checkbox" | "radio") {
            return Err(resolution("Not a checkbox or radio button"));
        }
        if el.checked == checked {
            return Ok(());
        }
        if !checked && kind == "radio" {
            return Err(resolution("Cannot uncheck radio button"));
        }
        if kind == "radio" {
            let group = el.name.clone();
            for other in model.elements.iter_mut() {
                if other.kind.as_deref() == Some("radio") && other.name == group {
                    other.checked = false;
                }
            }
        }
        model.elements[index].checked = checked;
        Ok(())
    }

    async fn list_options(&self, element: ElementHandle) -> Result<Vec<SelectOption>> {
        let model = self.model();
        let el = &model.elements[model.lookup(element)?];
        if el.tag != "select" {
            return Err(resolution("Expected a <select> element"));
        }
        Ok(el
            .options
            .iter()
            .map(|(label, value)| SelectOption {
                label: label.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn select_options(
        &self,
        element: ElementHandle,
        key: OptionKey,
        wanted: &[String],
    ) -> Result<()> {
        let mut model = self.model();
        let index = model.lookup(element)?;
        let el = &mut model.elements[index];
        if el.tag != "select" {
            return Err(resolution("Element is not a <select> element"));
        }
        let picked = wanted
            .iter()
            .map(|item| {
                el.options
                    .iter()
                    .position(|(label, value)| match key {
                        OptionKey::Label => label == item,
                        OptionKey::Value => value == item,
                    })
                    .ok_or_else(|| {
                        resolution(format!("Did not find option {:?} by {:?}", item, key))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        if !el.multiple && picked.len() > 1 {
            return Err(resolution(
                "Target select element is not multi-select; cannot select multiple options",
            ));
        }
        el.selected = picked;
        Ok(())
    }

    async fn click(&self, element: ElementHandle) -> Result<()> {
        let mut model = self.model();
        let index = model.lookup(element)?;
        if model.elements[index].disabled {
            return Err(resolution("Element is not enabled"));
        }
        if model.elements[index].is_submit_button() {
            if let Some(form) = model.form_of(index) {
                model.submit(form, Some(index));
            }
        }
        Ok(())
    }

    async fn run(&self, script: &PageScript) -> Result<Value> {
        let mut model = self.model();
        match script {
            PageScript::InstallSubmitObserver => {
                if model.observer_installed {
                    return Ok(Value::Bool(false));
                }
                model.observer_installed = true;
                model.install_count += 1;
                model.last_submit = None;
                Ok(Value::Bool(true))
            }
            PageScript::ClearSubmission => {
                model.clear_count += 1;
                model.last_submit = None;
                Ok(Value::Null)
            }
            PageScript::ReadSubmission => Ok(model.last_submit.clone().unwrap_or(Value::Null)),
            PageScript::RequestSubmit {
                form_selector,
                submitter_selector,
            } => {
                let form = model.find_form(form_selector.as_deref()).ok_or_else(|| {
                    resolution(format!(
                        "Unable to find form for selector: {}",
                        form_selector.as_deref().unwrap_or("<first-form>")
                    ))
                })?;
                let submitter = match submitter_selector {
                    Some(selector) => Some(model.query(selector).ok_or_else(|| {
                        resolution(format!("Unable to find submitter for selector: {}", selector))
                    })?),
                    None => None,
                };
                model.submit(form, submitter);
                Ok(Value::Null)
            }
            PageScript::FormSnapshot { form_selector } => {
                let form = model.find_form(form_selector.as_deref()).ok_or_else(|| {
                    OracleError::Capture(format!(
                        "Unable to find form for selector: {}",
                        form_selector.as_deref().unwrap_or("<first-form>")
                    ))
                })?;
                Ok(model.snapshot(form))
            }
            PageScript::SelectorText { selector } => {
                model.tick();
                Ok(model
                    .query(selector)
                    .map(|i| json!({ "text": model.elements[i].text }))
                    .unwrap_or(Value::Null))
            }
            PageScript::Location => {
                model.tick();
                Ok(json!({ "path": model.path, "ready_state": "complete", "fresh": true }))
            }
        }
    }

    fn drain_events(&self) -> Vec<PageEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}
