use std::path::PathBuf;
use std::time::Duration;

/// Browser and run settings that are not part of a spec document.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub headless: bool,
    /// Sandboxing usually has to be disabled inside containers.
    pub sandbox: bool,
    pub chrome_path: Option<PathBuf>,
    pub window_size: (u32, u32),
    /// How long a graceful browser close may take before the process is killed.
    pub shutdown_grace: Duration,
    /// Explicit budget for navigation, steps and capture together.
    /// When unset the session derives one from the step timeout.
    pub run_timeout: Option<Duration>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: true,
            chrome_path: None,
            window_size: (1280, 720),
            shutdown_grace: Duration::from_millis(500),
            run_timeout: None,
        }
    }
}

impl OracleConfig {
    /// The configured executable, or the first well-known install location that exists.
    /// `None` leaves discovery to headless_chrome.
    pub fn resolve_chrome(&self) -> Option<PathBuf> {
        if let Some(path) = &self.chrome_path {
            return Some(path.clone());
        }

        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ];

        candidates
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Budget for one whole run of `step_count` steps: a slot per step, two
    /// for navigation and teardown, and one sized to the capture's own wait.
    pub fn run_budget(
        &self,
        step_timeout: Duration,
        step_count: usize,
        capture_timeout: Duration,
    ) -> Duration {
        self.run_timeout.unwrap_or_else(|| {
            let slots = u32::try_from(step_count).unwrap_or(u32::MAX).saturating_add(2);
            step_timeout
                .saturating_mul(slots)
                .saturating_add(step_timeout.max(capture_timeout))
        })
    }
}
