//! Browser process management.
//!
//! Launches a headless Chromium with a remote debugging port, or attaches to
//! one that is already running, and resolves the page target to drive.

use leakwatch_core::{BrowserConfig, Error, Result};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// A browser we can drive over CDP.
pub struct Browser {
    /// Remote debugging port used to discover per-target WebSocket URLs.
    pub debug_port: u16,
    /// WebSocket URL of the page target.
    pub page_ws_url: String,
    /// Browser child process. `None` when attached to an existing browser.
    process: Option<Child>,
}

impl Browser {
    /// Launch a browser with a scratch profile under `profile_dir`.
    pub async fn launch(config: &BrowserConfig, profile_dir: &Path) -> Result<Self> {
        let browser_path = match &config.executable {
            Some(path) => path.clone(),
            None => find_browser_binary().ok_or_else(|| {
                Error::Connection(
                    "Chrome/Chromium not found. Install it or set browser.executable".to_string(),
                )
            })?,
        };

        // Stale state from an earlier run must not leak into this one.
        if profile_dir.exists() {
            std::fs::remove_dir_all(profile_dir)?;
        }
        std::fs::create_dir_all(profile_dir)?;

        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, profile_dir, config);

        info!(
            browser = %browser_path,
            port = debug_port,
            headless = config.headless,
            "Launching browser"
        );

        let child = Command::new(&browser_path)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Connection(format!("Failed to launch {}: {}", browser_path, e)))?;

        let timeout = Duration::from_secs(config.startup_timeout_secs);
        wait_for_cdp_ready(debug_port, timeout).await?;
        let page_ws_url = get_page_ws_url(debug_port).await?;

        Ok(Self {
            debug_port,
            page_ws_url,
            process: Some(child),
        })
    }

    /// Use a browser already listening on `port`.
    pub async fn attach(port: u16, startup_timeout: Duration) -> Result<Self> {
        wait_for_cdp_ready(port, startup_timeout).await?;
        let page_ws_url = get_page_ws_url(port).await?;
        info!(port, ws_url = %page_ws_url, "Attached to running browser");
        Ok(Self {
            debug_port: port,
            page_ws_url,
            process: None,
        })
    }

    pub fn is_owned(&self) -> bool {
        self.process.is_some()
    }

    /// Kill the process we launched. Attached browsers are left running.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                debug!("Browser process already gone: {}", e);
            }
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Build Chromium command line arguments.
fn build_browser_args(debug_port: u16, user_data_dir: &Path, config: &BrowserConfig) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--safebrowsing-disable-auto-update".to_string(),
        "--password-store=basic".to_string(),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// Find a Chrome/Chromium binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates: Vec<&str> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome",
            "google-chrome-stable",
            "google-chrome-unstable",
            "chromium",
            "chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

/// Find a free TCP port.
async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll /json/version until the debugging endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<String> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Connection(format!(
                "Browser debugging endpoint not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }

        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if let Some(ws_url) = body.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                    return Ok(ws_url.to_string());
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Resolve the first "page" target's WebSocket URL from /json/list.
/// Retries a few times since the page target may not appear immediately.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };
        if let Some(ws_url) = first_page_target(&targets) {
            return Ok(ws_url);
        }
    }

    Err(Error::Connection(
        "No page target found after retries".to_string(),
    ))
}

fn first_page_target(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
