//! Chrome driver: a [`PageDriver`] backed by `headless_chrome`.
//!
//! headless_chrome is synchronous, so every CDP call runs on the blocking
//! pool and is individually bounded by a tokio timeout.

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Runtime;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::{Value, json};
use std::ffi::OsStr;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::dom::{self, PageLocation};
use crate::driver::{ElementHandle, Located, Locator, OptionKey, PageDriver, PageScript, SelectOption};
use crate::error::{OracleError, Result};
use crate::types::PageEvent;
use crate::wait::poll_until;

/// One browser process with a single tab, owned for the length of a run.
pub struct BrowserSession {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    pid: Option<u32>,
    events: Arc<Mutex<Vec<PageEvent>>>,
    call_timeout: Duration,
    clicks: AtomicU64,
}

impl BrowserSession {
    pub async fn launch(config: &OracleConfig, call_timeout: Duration) -> Result<Self> {
        let headless = config.headless;
        let sandbox = config.sandbox;
        let window_size = config.window_size;
        let chrome_path = config.resolve_chrome();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        info!(headless, sandbox, chrome = ?chrome_path, "launching browser");
        let task = tokio::task::spawn_blocking(move || -> anyhow::Result<(Browser, Arc<Tab>)> {
            let options = LaunchOptions {
                headless,
                sandbox,
                path: chrome_path,
                window_size: Some(window_size),
                args: vec![
                    OsStr::new("--no-first-run"),
                    OsStr::new("--no-default-browser-check"),
                    OsStr::new("--disable-extensions"),
                    OsStr::new("--password-store=basic"),
                ],
                idle_browser_timeout: Duration::from_secs(300),
                ..Default::default()
            };

            let browser = Browser::new(options)?;
            let tab = browser.new_tab()?;
            tab.call_method(Runtime::Enable(None))?;
            tab.add_event_listener(Arc::new(move |event: &Event| {
                if let Some(page_event) = page_event(event) {
                    if let Ok(mut events) = sink.lock() {
                        events.push(page_event);
                    }
                }
            }))?;
            Ok((browser, tab))
        });

        let (browser, tab) = match tokio::time::timeout(call_timeout.max(LAUNCH_FLOOR), task).await {
            Ok(Ok(Ok(launched))) => launched,
            Ok(Ok(Err(e))) => return Err(OracleError::Browser(format!("launch failed: {}", e))),
            Ok(Err(e)) => return Err(OracleError::Browser(format!("launch task failed: {}", e))),
            Err(_) => return Err(OracleError::Timeout("Timed out launching the browser".to_string())),
        };

        tab.set_default_timeout(call_timeout);
        let pid = browser.get_process_id();
        info!(?pid, "browser ready");

        Ok(Self {
            browser: Some(browser),
            tab,
            pid,
            events,
            call_timeout,
            clicks: AtomicU64::new(0),
        })
    }

    /// Run `f` against the tab on the blocking pool, bounded by `timeout`.
    async fn blocking<T, E, F>(&self, timeout: Duration, what: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce(&Tab) -> std::result::Result<T, E> + Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        let task = tokio::task::spawn_blocking(move || f(&tab));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(OracleError::Browser(format!("{}: {}", what, e))),
            Ok(Err(e)) => Err(OracleError::Browser(format!("{} task failed: {}", what, e))),
            Err(_) => Err(OracleError::Timeout(format!(
                "Timeout {}ms exceeded during {}",
                timeout.as_millis(),
                what
            ))),
        }
    }

    /// Evaluate a page script and unwrap its envelope.
    async fn call(&self, body: &str, args: Value) -> Result<Value> {
        let expression = dom::invoke(body, &args);
        let raw = self
            .blocking(self.call_timeout, "evaluate", move |tab| {
                tab.evaluate(&expression, false).map(|object| object.value)
            })
            .await?;
        dom::decode_envelope(raw)
    }

    async fn location(&self) -> Result<PageLocation> {
        let value = self.run(&PageScript::Location).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Close the tab and browser, killing the process if that takes longer
    /// than `grace`. Never fails; problems are logged.
    pub async fn shutdown(mut self, grace: Duration) {
        let pid = self.pid;
        let browser = self.browser.take();
        let tab = Arc::clone(&self.tab);

        let close = tokio::task::spawn_blocking(move || {
            if let Err(e) = tab.close(false) {
                debug!(error = %e, "tab close failed");
            }
            drop(tab);
            drop(browser);
        });

        match tokio::time::timeout(grace, close).await {
            Ok(Ok(())) => info!("browser closed"),
            Ok(Err(e)) => warn!(error = %e, "browser teardown task failed"),
            Err(_) => {
                warn!(?pid, grace_ms = grace.as_millis() as u64, "browser did not close in time, killing");
                if let Some(pid) = pid {
                    kill_process(pid);
                }
            }
        }
    }
}

/// Chrome startup is slow on cold machines; never give it less than this.
const LAUNCH_FLOOR: Duration = Duration::from_secs(30);

fn locator_args(locator: &Locator) -> Value {
    match locator {
        Locator::Css(selector) => json!({ "kind": "css", "selector": selector }),
        Locator::Label { text, exact } => json!({ "kind": "label", "text": text, "exact": exact }),
        Locator::Role { role, name, exact } => {
            json!({ "kind": "role", "role": role, "name": name, "exact": exact })
        }
    }
}

#[async_trait]
impl PageDriver for BrowserSession {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<()> {
        info!(url, "navigating");
        self.call(dom::MARK_STALE, Value::Null).await?;

        let target = url.to_string();
        self.blocking(timeout, "navigate", move |tab| tab.navigate_to(&target).map(|_| ()))
            .await
            .map_err(|e| match e {
                OracleError::Browser(message) => OracleError::Navigation(message),
                other => other,
            })?;

        // The old document may answer until the new one commits; the stale
        // marker tells them apart.
        poll_until(timeout, "document to finish loading", || async move {
            match self.location().await {
                Ok(location) => Ok((location.fresh && location.ready_state != "loading").then_some(())),
                Err(OracleError::Browser(_) | OracleError::Script(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn locate(&self, scope: Option<ElementHandle>, locator: &Locator) -> Result<Located> {
        let value = self
            .call(
                dom::LOCATE,
                json!({ "scope": scope, "locator": locator_args(locator) }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn element_matches(&self, element: ElementHandle, selector: &str) -> Result<bool> {
        let value = self
            .call(dom::ELEMENT_MATCHES, json!({ "handle": element, "selector": selector }))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn fill(&self, element: ElementHandle, value: &str) -> Result<()> {
        self.call(dom::FILL, json!({ "handle": element, "value": value }))
            .await
            .map(|_| ())
    }

    async fn set_checked(&self, element: ElementHandle, checked: bool) -> Result<()> {
        self.call(dom::SET_CHECKED, json!({ "handle": element, "checked": checked }))
            .await
            .map(|_| ())
    }

    async fn list_options(&self, element: ElementHandle) -> Result<Vec<SelectOption>> {
        let value = self.call(dom::LIST_OPTIONS, json!({ "handle": element })).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn select_options(
        &self,
        element: ElementHandle,
        key: OptionKey,
        wanted: &[String],
    ) -> Result<()> {
        self.call(
            dom::SELECT_OPTIONS,
            json!({ "handle": element, "key": key, "wanted": wanted }),
        )
        .await
        .map(|_| ())
    }

    /// Real mouse input: tag the element, find it through CDP, click its centre.
    async fn click(&self, element: ElementHandle) -> Result<()> {
        let token = format!("{}-{}", element.0, self.clicks.fetch_add(1, Ordering::Relaxed));
        self.call(dom::MARK_CLICK_TARGET, json!({ "handle": element, "token": token }))
            .await?;

        let selector = format!("[{}=\"{}\"]", dom::CLICK_TARGET_ATTR, token);
        let clicked = self
            .blocking(self.call_timeout, "click", move |tab| {
                tab.find_element(&selector)
                    .and_then(|target| target.click().map(|_| ()))
            })
            .await;

        if let Err(e) = self.call(dom::UNMARK_CLICK_TARGET, Value::Null).await {
            debug!(error = %e, "could not clear click marker");
        }
        clicked
    }

    async fn run(&self, script: &PageScript) -> Result<Value> {
        let (body, args) = dom::page_script(script);
        self.call(body, args).await
    }

    fn drain_events(&self) -> Vec<PageEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(_) => Vec::new(),
        }
    }
}

fn page_event(event: &Event) -> Option<PageEvent> {
    match event {
        Event::RuntimeConsoleAPICalled(called) => {
            serde_json::to_value(&called.params).ok().map(|p| console_event(&p))
        }
        Event::RuntimeExceptionThrown(thrown) => {
            serde_json::to_value(&thrown.params).ok().map(|p| exception_event(&p))
        }
        _ => None,
    }
}

/// `Runtime.consoleAPICalled` params to a console entry.
fn console_event(params: &Value) -> PageEvent {
    let level = params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("log")
        .to_string();
    let text = params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| args.iter().map(remote_text).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    PageEvent::Console { level, text }
}

fn remote_text(object: &Value) -> String {
    match object.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => object
            .get("description")
            .or_else(|| object.get("unserializableValue"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                object
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("undefined")
                    .to_string()
            }),
        Some(other) => other.to_string(),
    }
}

/// `Runtime.exceptionThrown` params to a page error entry.
fn exception_event(params: &Value) -> PageEvent {
    let details = params.get("exceptionDetails");
    let message = details
        .and_then(|d| d.pointer("/exception/description"))
        .or_else(|| details.and_then(|d| d.get("text")))
        .and_then(Value::as_str)
        .unwrap_or("Uncaught exception")
        .to_string();
    PageEvent::PageError { message }
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "browser pid out of range");
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
        warn!(pid, error = %e, "failed to kill browser");
    }
}

#[cfg(not(unix))]
fn kill_process(pid: u32) {
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    if let Err(e) = status {
        warn!(pid, error = %e, "failed to kill browser");
    }
}
