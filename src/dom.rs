use serde::Deserialize;
use serde_json::{Value, json};

use crate::driver::PageScript;
use crate::error::{OracleError, Result};

/// Attribute used to hand a resolved element over to a native CDP click.
pub const CLICK_TARGET_ATTR: &str = "data-form-oracle-click";

/// Helpers shared by every page script. Element handles are indices into a
/// page-global registry, so a handle keeps pointing at the same node until the
/// document is replaced.
const PRELUDE: &str = r#"
  const registry = () => (window.__formOracleHandles = window.__formOracleHandles || []);
  const fail = (kind, message) => {
    const error = new Error(message);
    error.oracleKind = kind;
    throw error;
  };
  const remember = (element) => {
    const handles = registry();
    let id = handles.indexOf(element);
    if (id < 0) {
      id = handles.length;
      handles.push(element);
    }
    return id;
  };
  const lookup = (id) => {
    const element = registry()[id];
    if (!element || !element.isConnected) {
      fail("resolution", `Element handle ${id} is no longer attached to the document`);
    }
    return element;
  };
  const collapse = (text) => String(text || "").replace(/\s+/g, " ").trim();
  const textMatches = (candidate, wanted, exact) => {
    const have = collapse(candidate);
    const want = collapse(wanted);
    return exact ? have === want : have.toLowerCase().includes(want.toLowerCase());
  };
  const pathAndQuery = () => `${window.location.pathname}${window.location.search}`;
  const serializeValue = (value) => {
    if (typeof value === "string") return value;
    if (value && typeof value === "object" && "name" in value) return value.name;
    return String(value);
  };
  const documentOrder = (a, b) =>
    a === b ? 0 : a.compareDocumentPosition(b) & Node.DOCUMENT_POSITION_FOLLOWING ? -1 : 1;
  const idrefText = (element, attribute) =>
    (element.getAttribute(attribute) || "")
      .split(/\s+/)
      .map((id) => (id ? document.getElementById(id) : null))
      .filter(Boolean)
      .map((node) => node.textContent)
      .join(" ");
  const labelText = (label) => {
    let text = "";
    const walker = document.createTreeWalker(label, NodeFilter.SHOW_TEXT);
    while (walker.nextNode()) {
      const parent = walker.currentNode.parentElement;
      if (!parent || !parent.closest("select, textarea, button, option")) {
        text += walker.currentNode.textContent;
      }
    }
    return collapse(text);
  };
  const labeledControls = (text, exact) => {
    const found = new Set();
    for (const label of document.querySelectorAll("label")) {
      if (label.control && textMatches(labelText(label), text, exact)) found.add(label.control);
    }
    for (const element of document.querySelectorAll("[aria-label]")) {
      if (textMatches(element.getAttribute("aria-label"), text, exact)) found.add(element);
    }
    for (const element of document.querySelectorAll("[aria-labelledby]")) {
      if (textMatches(idrefText(element, "aria-labelledby"), text, exact)) found.add(element);
    }
    return Array.from(found).sort(documentOrder);
  };
  const IMPLICIT_ROLES = {
    button:
      'button, input[type="submit" i], input[type="button" i], input[type="reset" i], input[type="image" i]',
    checkbox: 'input[type="checkbox" i]',
    radio: 'input[type="radio" i]',
  };
  const elementsWithRole = (role) => {
    const implicit = IMPLICIT_ROLES[role];
    const query = implicit ? `${implicit}, [role]` : "[role]";
    return Array.from(document.querySelectorAll(query)).filter((element) => {
      const explicit = (element.getAttribute("role") || "").trim().split(/\s+/)[0];
      return explicit ? explicit === role : Boolean(implicit) && element.matches(implicit);
    });
  };
  const accessibleName = (element) => {
    const labelledBy = collapse(idrefText(element, "aria-labelledby"));
    if (labelledBy) return labelledBy;
    const ariaLabel = collapse(element.getAttribute("aria-label"));
    if (ariaLabel) return ariaLabel;
    if (element instanceof HTMLInputElement) {
      const type = element.type;
      if (type === "image") return collapse(element.alt || element.value || "Submit");
      if (type === "submit" || type === "reset" || type === "button") {
        if (element.hasAttribute("value")) return collapse(element.value);
        return type === "submit" ? "Submit" : type === "reset" ? "Reset" : "";
      }
      const labels = element.labels ? Array.from(element.labels).map(labelText).join(" ") : "";
      return collapse(labels || element.title);
    }
    return collapse(element.textContent) || collapse(element.getAttribute("title"));
  };
  const isRendered = (element) =>
    !element.closest("[hidden], [aria-hidden='true']") && element.getClientRects().length > 0;
  const dispatchEdit = (element) => {
    element.dispatchEvent(new Event("input", { bubbles: true }));
    element.dispatchEvent(new Event("change", { bubbles: true }));
  };
  const ensureEnabled = (element) => {
    if (element.matches(":disabled")) fail("resolution", "Element is not enabled");
  };
  const findForm = (selector) => {
    const form = selector ? document.querySelector(selector) : document.querySelector("form");
    return form instanceof HTMLFormElement ? form : null;
  };
"#;

/// Installs the submission observer once per document.
///
/// The listener:
///   1. Runs in the capture phase on `document`, so it sees every form.
///   2. Cancels the default action so the page (and its state) survives.
///   3. Records the submitter, the form data built with that submitter, the
///      submitter's formmethod/formaction overrides or the form's own
///      attributes, plus the base URI and location needed to normalise them.
///
/// Returns `true` when the listener was attached by this call.
const INSTALL_SUBMIT_OBSERVER: &str = r#"() => {
  if (window.__formOracleSubmitObserverInstalled) return false;
  window.__formOracleLastSubmit = null;
  document.addEventListener(
    "submit",
    (event) => {
      const form = event.target;
      if (!(form instanceof HTMLFormElement)) return;
      event.preventDefault();
      const submitter = event.submitter instanceof HTMLElement ? event.submitter : null;
      let formData;
      try {
        formData = submitter ? new FormData(form, submitter) : new FormData(form);
      } catch {
        formData = new FormData(form);
      }
      const override = (name) =>
        submitter && submitter.hasAttribute(name) ? submitter.getAttribute(name) : null;
      window.__formOracleLastSubmit = {
        submitter: submitter
          ? {
              tag: submitter.tagName.toLowerCase(),
              type: submitter.getAttribute("type") || null,
              name: submitter.getAttribute("name") || null,
              value: submitter.getAttribute("value") || null,
              id: submitter.id || null,
            }
          : null,
        entries: Array.from(formData.entries()).map(([name, value]) => [name, serializeValue(value)]),
        method_attr: override("formmethod") ?? form.getAttribute("method"),
        action_attr: override("formaction") ?? form.getAttribute("action"),
        base_uri: document.baseURI,
        location: pathAndQuery(),
        form_id: form.id || null,
      };
    },
    true,
  );
  window.__formOracleSubmitObserverInstalled = true;
  return true;
}"#;

const CLEAR_SUBMISSION: &str = r#"() => {
  window.__formOracleLastSubmit = null;
  return null;
}"#;

const READ_SUBMISSION: &str = r#"() => window.__formOracleLastSubmit ?? null"#;

const REQUEST_SUBMIT: &str = r#"({ form_selector, submitter_selector }) => {
  const form = findForm(form_selector);
  if (!form) {
    fail("resolution", `Unable to find form for selector: ${form_selector ?? "<first-form>"}`);
  }
  let submitter = null;
  if (submitter_selector) {
    submitter = document.querySelector(submitter_selector);
    if (!(submitter instanceof HTMLElement)) {
      fail("resolution", `Unable to find submitter for selector: ${submitter_selector}`);
    }
  }
  form.requestSubmit(submitter || undefined);
  return null;
}"#;

const FORM_SNAPSHOT: &str = r#"({ form_selector }) => {
  const form = findForm(form_selector);
  if (!form) {
    fail("capture", `Unable to find form for selector: ${form_selector ?? "<first-form>"}`);
  }
  const controls = Array.from(form.elements)
    .filter((control) => control instanceof HTMLElement)
    .map((control) => {
      const tag = control.tagName.toLowerCase();
      const type = control.getAttribute("type") || (tag === "button" ? "submit" : null);
      return {
        tag,
        type: type ? type.toLowerCase() : null,
        name: control.getAttribute("name"),
        id: control.id || null,
        disabled: control.matches(":disabled"),
        form_owner_id: (control.form && control.form.id) || null,
      };
    });
  return {
    form_id: form.id || null,
    method_attr: form.getAttribute("method"),
    action_attr: form.getAttribute("action"),
    base_uri: document.baseURI,
    location: pathAndQuery(),
    entries: Array.from(new FormData(form).entries()).map(([name, value]) => [name, serializeValue(value)]),
    controls,
  };
}"#;

const SELECTOR_TEXT: &str = r#"({ selector }) => {
  const element = document.querySelector(selector);
  return element ? { text: element.textContent || "" } : null;
}"#;

const LOCATION: &str = r#"() => ({
  path: pathAndQuery(),
  ready_state: document.readyState,
  fresh: !window.__formOracleStale,
})"#;

/// Marks the current document so a navigation can be told apart from it.
pub const MARK_STALE: &str = r#"() => {
  window.__formOracleStale = true;
  return null;
}"#;

pub const LOCATE: &str = r#"({ scope, locator }) => {
  const root = scope === null ? document : lookup(scope);
  const inScope = (element) =>
    root === document ? element.isConnected : root !== element && root.contains(element);
  let found;
  if (locator.kind === "css") {
    found = Array.from(root.querySelectorAll(locator.selector));
  } else if (locator.kind === "label") {
    found = labeledControls(locator.text, locator.exact).filter(inScope);
  } else if (locator.kind === "role") {
    found = elementsWithRole(locator.role)
      .filter(isRendered)
      .filter((element) => textMatches(accessibleName(element), locator.name, locator.exact))
      .filter(inScope);
  } else {
    fail("unsupported", `Unsupported locator: ${locator.kind}`);
  }
  return { count: found.length, handle: found.length > 0 ? remember(found[0]) : null };
}"#;

pub const ELEMENT_MATCHES: &str = r#"({ handle, selector }) => lookup(handle).matches(selector)"#;

pub const FILL: &str = r#"({ handle, value }) => {
  const element = lookup(handle);
  const tag = element.tagName.toLowerCase();
  const type = (element.getAttribute("type") || "text").toLowerCase();
  if (tag === "input") {
    const unfillable = ["checkbox", "radio", "file", "submit", "button", "reset", "image", "hidden"];
    if (unfillable.includes(type)) fail("resolution", `Input of type "${type}" cannot be filled`);
  } else if (tag !== "textarea" && !element.isContentEditable) {
    fail("resolution", "Element is not an <input>, <textarea> or [contenteditable] element");
  }
  ensureEnabled(element);
  if (element.readOnly) fail("resolution", "Element is not editable");
  element.focus();
  if (tag === "input" || tag === "textarea") {
    const proto = tag === "input" ? HTMLInputElement.prototype : HTMLTextAreaElement.prototype;
    Object.getOwnPropertyDescriptor(proto, "value").set.call(element, value);
    if (tag === "input" && value !== "" && element.value === "") {
      fail("resolution", `Malformed value for input[type=${type}]`);
    }
  } else {
    element.textContent = value;
  }
  dispatchEdit(element);
  return null;
}"#;

pub const SET_CHECKED: &str = r#"({ handle, checked }) => {
  const element = lookup(handle);
  const type = (element.getAttribute("type") || "").toLowerCase();
  const native = element instanceof HTMLInputElement && (type === "checkbox" || type === "radio");
  const role = element.getAttribute("role");
  if (!native && role !== "checkbox" && role !== "radio") {
    fail("resolution", "Not a checkbox or radio button");
  }
  ensureEnabled(element);
  const state = () => (native ? element.checked : element.getAttribute("aria-checked") === "true");
  if (state() === checked) return null;
  if (!checked && (type === "radio" || role === "radio")) {
    fail("resolution", "Cannot uncheck radio button");
  }
  element.click();
  if (state() !== checked) fail("resolution", "Clicking the checkbox did not change its state");
  return null;
}"#;

pub const LIST_OPTIONS: &str = r#"({ handle }) => {
  const element = lookup(handle);
  if (!(element instanceof HTMLSelectElement)) fail("resolution", "Expected a <select> element");
  return Array.from(element.options).map((option) => ({
    label: option.label || option.text || "",
    value: option.value || "",
  }));
}"#;

pub const SELECT_OPTIONS: &str = r#"({ handle, key, wanted }) => {
  const element = lookup(handle);
  if (!(element instanceof HTMLSelectElement)) fail("resolution", "Element is not a <select> element");
  ensureEnabled(element);
  const options = Array.from(element.options);
  const picked = wanted.map((item) => {
    const option = options.find((candidate) =>
      key === "label" ? candidate.label === item : candidate.value === item,
    );
    if (!option) fail("resolution", `Did not find option ${JSON.stringify(item)} by ${key}`);
    return option;
  });
  if (!element.multiple && picked.length > 1) {
    fail("resolution", "Target select element is not multi-select; cannot select multiple options");
  }
  for (const option of options) option.selected = picked.includes(option);
  dispatchEdit(element);
  return null;
}"#;

pub const MARK_CLICK_TARGET: &str = r#"({ handle, token }) => {
  lookup(handle).setAttribute("data-form-oracle-click", token);
  return null;
}"#;

pub const UNMARK_CLICK_TARGET: &str = r#"() => {
  for (const element of document.querySelectorAll("[data-form-oracle-click]")) {
    element.removeAttribute("data-form-oracle-click");
  }
  return null;
}"#;

/// Wrap a script function and its JSON argument into one expression whose
/// value is a JSON envelope string: `{ ok, value }` or `{ ok, kind, error }`.
pub fn invoke(body: &str, args: &Value) -> String {
    format!(
        r#"(() => {{
{prelude}
  try {{
    const value = ({body})({args});
    return JSON.stringify({{ ok: true, value: value === undefined ? null : value }});
  }} catch (error) {{
    return JSON.stringify({{
      ok: false,
      kind: (error && error.oracleKind) || "script",
      error: String((error && error.message) || error),
    }});
  }}
}})()"#,
        prelude = PRELUDE,
        body = body,
        args = args,
    )
}

/// Source and argument for one of the typed page scripts.
pub fn page_script(script: &PageScript) -> (&'static str, Value) {
    match script {
        PageScript::InstallSubmitObserver => (INSTALL_SUBMIT_OBSERVER, Value::Null),
        PageScript::ClearSubmission => (CLEAR_SUBMISSION, Value::Null),
        PageScript::ReadSubmission => (READ_SUBMISSION, Value::Null),
        PageScript::RequestSubmit {
            form_selector,
            submitter_selector,
        } => (
            REQUEST_SUBMIT,
            json!({ "form_selector": form_selector, "submitter_selector": submitter_selector }),
        ),
        PageScript::FormSnapshot { form_selector } => {
            (FORM_SNAPSHOT, json!({ "form_selector": form_selector }))
        }
        PageScript::SelectorText { selector } => (SELECTOR_TEXT, json!({ "selector": selector })),
        PageScript::Location => (LOCATION, Value::Null),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode the value returned by evaluating an [`invoke`] expression.
pub fn decode_envelope(raw: Option<Value>) -> Result<Value> {
    let text = match raw {
        Some(Value::String(text)) => text,
        other => {
            return Err(OracleError::Script(format!(
                "Page script returned no result ({:?})",
                other
            )));
        }
    };

    let envelope: Envelope = serde_json::from_str(&text)?;
    if envelope.ok {
        return Ok(envelope.value);
    }

    Err(OracleError::from_page(
        envelope.kind.as_deref().unwrap_or("script"),
        envelope
            .error
            .unwrap_or_else(|| "Page script failed".to_string()),
    ))
}

/// Where the page currently is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageLocation {
    pub path: String,
    #[serde(default)]
    pub ready_state: String,
    #[serde(default = "default_fresh")]
    pub fresh: bool,
}

fn default_fresh() -> bool {
    true
}
