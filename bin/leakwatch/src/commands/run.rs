use leakwatch_cdp::{Browser, CdpClient};
use leakwatch_core::{Config, Paths};
use leakwatch_runner::{CdpPage, Controller, ReportFormat, RunOutcome};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::Cli;

/// Load the config file, then let command-line flags override it.
pub fn load_config(cli: &Cli, paths: &Paths) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(paths)?,
    };
    apply_overrides(cli, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut Config) {
    if cli.headed {
        config.browser.headless = false;
    }
    if let Some(port) = cli.port {
        config.browser.port = Some(port);
    }
    if let Some(browser) = &cli.browser {
        config.browser.executable = Some(browser.clone());
    }
    if !cli.watch.is_empty() {
        config.scan.watched_types = cli.watch.clone();
    }
    if let Some(node_type) = &cli.node_type {
        config.scan.node_type = node_type.clone();
    }
    if cli.stop_on_first_leak {
        config.scan.stop_on_first_leak = true;
    }
    if let Some(max) = cli.max_path_length {
        config.scan.max_path_length = max;
    }
}

fn parse_test_url(raw: &str) -> anyhow::Result<url::Url> {
    let url = url::Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" | "file" => Ok(url),
        other => anyhow::bail!("Unsupported URL scheme '{}' in {}", other, raw),
    }
}

/// Run the suite at `cli.url` and report leaks on stdout.
pub async fn run(cli: &Cli) -> anyhow::Result<RunOutcome> {
    let url = parse_test_url(&cli.url)?;
    let paths = Paths::new();
    let config = load_config(cli, &paths)?;

    let mut browser = match config.browser.port {
        Some(port) => {
            Browser::attach(port, Duration::from_secs(config.browser.startup_timeout_secs)).await?
        }
        None => Browser::launch(&config.browser, &paths.profile_dir()).await?,
    };

    let client = Arc::new(
        CdpClient::connect(&browser.page_ws_url, config.protocol.command_timeout()).await?,
    );
    let page = CdpPage::new(client.clone(), config.protocol.page_load_timeout());
    let format = if cli.json {
        ReportFormat::Json
    } else {
        ReportFormat::Text
    };

    let result = {
        let mut controller = Controller::new(&page, &config.scan, std::io::stdout(), format);
        controller.run(url.as_str()).await
    };

    if browser.is_owned() {
        if let Err(e) = client.close_browser().await {
            warn!("Browser did not close cleanly: {}", e);
        }
        browser.shutdown().await;
    }

    let outcome = result?;
    info!(
        success = outcome.success,
        leaks = outcome.leak_count(),
        boundaries = outcome.boundaries,
        "Finished"
    );
    Ok(outcome)
}
