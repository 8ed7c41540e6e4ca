//! Native browser management using `chromiumoxide`.
//!
//! This module is the Chromium side of the headless page capability:
//! * Finding a usable browser executable (Brave → Chrome → Chromium, cross-platform).
//! * Building a launch config with stealth defaults (UA rotation, automation flag off).
//! * `BrowserPool`: one lazily-launched browser, a fresh tab per run.
//! * `ChromiumPage`: `navigate` / `find` / `wait_for` over a CDP page.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::{Result, ScoutError};
use crate::features::antibot::random_user_agent;
use crate::scraping::page::{select_outer_html, HeadlessPage, Navigation, PageSource};
use crate::scraping::selectors::Locator;

const WAIT_POLL: Duration = Duration::from_millis(250);

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. explicit override (config `chrome_executable` / `CHROME_EXECUTABLE`)
/// 2. PATH scan – finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable(explicit: Option<&str>) -> Option<String> {
    if let Some(p) = explicit.map(str::trim).filter(|p| !p.is_empty()) {
        if Path::new(p).exists() {
            return Some(p.to_string());
        }
        warn!("configured browser executable {} does not exist, falling back to discovery", p);
    }

    for exe in [
        "brave-browser",
        "brave",
        "google-chrome",
        "chromium",
        "chromium-browser",
        "chrome",
    ] {
        if let Ok(full) = which::which(exe) {
            return Some(full.to_string_lossy().to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/brave-browser",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Headless browser config builder ──────────────────────────────────────────

/// Build a `BrowserConfig` with stealth defaults.
///
/// `--disable-blink-features=AutomationControlled` hides the
/// `navigator.webdriver` flag; the UA is drawn from the desktop pool.
pub fn build_headless_config(exe: &str, headless: bool, width: u32, height: u32) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox") // often required in CI / restricted environments
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        .arg("--lang=pt-BR")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua));

    if !headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| ScoutError::Browser(format!("failed to build browser config: {}", e)))
}

// ── Browser Pool ─────────────────────────────────────────────────────────────

/// A shared, long-lived browser that hands out one fresh tab per run.
///
/// The browser is launched on the first `open()` and relaunched
/// transparently if the process has died. Runs never share a tab.
pub struct BrowserPool {
    exe: String,
    headless: bool,
    inner: Mutex<Option<Browser>>,
}

impl BrowserPool {
    pub fn new(exe: impl Into<String>, headless: bool) -> Arc<Self> {
        Arc::new(Self {
            exe: exe.into(),
            headless,
            inner: Mutex::new(None),
        })
    }

    /// Pool over the discovered executable; `None` when no browser is installed.
    pub fn discover(explicit: Option<&str>, headless: bool) -> Option<Arc<Self>> {
        find_chrome_executable(explicit).map(|exe| Self::new(exe, headless))
    }

    async fn new_tab(&self) -> Result<Page> {
        let mut guard = self.inner.lock().await;

        let alive = match guard.as_ref() {
            Some(b) => b.version().await.is_ok(),
            None => false,
        };

        if !alive {
            if let Some(mut old) = guard.take() {
                warn!("browser pool: instance dead, restarting");
                let _ = old.close().await;
            }
            info!(exe = %self.exe, headless = self.headless, "browser pool: launching");
            let config = build_headless_config(&self.exe, self.headless, 1366, 900)?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| ScoutError::Browser(format!("failed to launch {}: {}", self.exe, e)))?;
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        warn!("CDP handler error: {}", e);
                    }
                }
            });
            *guard = Some(browser);
        }

        let browser = guard
            .as_ref()
            .ok_or_else(|| ScoutError::Browser("browser not running".to_string()))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScoutError::Browser(format!("failed to open tab: {}", e)))
    }

    /// Gracefully close the pooled browser instance.
    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut b) = guard.take() {
            let _ = b.close().await;
            info!("browser pool shut down");
        }
    }
}

#[async_trait]
impl PageSource for BrowserPool {
    async fn open(&self) -> Result<Box<dyn HeadlessPage>> {
        let page = self.new_tab().await?;
        Ok(Box::new(ChromiumPage { page }))
    }
}

impl Drop for BrowserPool {
    fn drop(&mut self) {
        // Drop cannot await; inside a runtime, close the browser on a task
        // so no Chromium process is left behind.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if let Ok(mut guard) = self.inner.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                });
            }
        }
    }
}

// ── Page ─────────────────────────────────────────────────────────────────────

pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn response_status(&self) -> Option<u16> {
        self.page
            .evaluate("performance.getEntriesByType('navigation').map(e => e.responseStatus)[0] ?? null")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_u64())
            .and_then(|s| u16::try_from(s).ok())
            .filter(|s| *s > 0)
    }
}

#[async_trait]
impl HeadlessPage for ChromiumPage {
    async fn navigate(&mut self, url: &str) -> Result<Navigation> {
        self.page
            .goto(url)
            .await
            .map_err(|e| ScoutError::NavigationFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        let status = self.response_status().await;
        debug!(url, final_url = %final_url, ?status, "page loaded");

        Ok(Navigation { final_url, status })
    }

    async fn find(&self, locator: &Locator) -> Result<Vec<String>> {
        let html = self
            .page
            .content()
            .await
            .map_err(|e| ScoutError::Browser(format!("failed to read page content: {}", e)))?;
        Ok(select_outer_html(&html, locator.selector()))
    }

    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(locator.css()).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(locator = locator.name(), "wait_for: timeout after {}ms", timeout.as_millis());
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.page
            .close()
            .await
            .map_err(|e| ScoutError::Browser(format!("failed to close tab: {}", e)))
    }
}
