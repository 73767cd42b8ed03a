use crate::{browser::config::{ConnectionOptions, LaunchOptions},
            error::{ResilienceError, Result}};
use headless_chrome::{Browser, Tab};
use std::{ffi::OsStr, sync::Arc, time::Duration};

/// Browser session that manages a Chrome/Chromium instance
#[derive(Clone)]
pub struct BrowserSession {
    browser: Arc<Browser>,
}

impl BrowserSession {
    /// Launch a new browser instance with the given options
    pub fn launch(options: LaunchOptions) -> Result<Self> {
        let mut launch_opts = headless_chrome::LaunchOptions::default();

        // Keep sites from detecting automation and swapping out their markup
        launch_opts.ignore_default_args.push(OsStr::new("--enable-automation"));
        launch_opts.args.push(OsStr::new("--disable-blink-features=AutomationControlled"));

        launch_opts.idle_browser_timeout = Duration::from_secs(options.idle_timeout_secs);
        launch_opts.headless = options.headless;
        launch_opts.window_size = Some((options.window_width, options.window_height));
        launch_opts.path = options.chrome_path;
        launch_opts.user_data_dir = options.user_data_dir;
        launch_opts.sandbox = options.sandbox;

        let browser = Browser::new(launch_opts).map_err(|e| ResilienceError::LaunchFailed(e.to_string()))?;

        browser.new_tab().map_err(|e| ResilienceError::LaunchFailed(format!("Failed to create tab: {}", e)))?;

        log::info!("Launched browser (headless: {})", options.headless);
        Ok(Self { browser: Arc::new(browser) })
    }

    /// Connect to an existing browser instance via WebSocket
    pub fn connect(options: ConnectionOptions) -> Result<Self> {
        let browser = Browser::connect_with_timeout(options.ws_url, Duration::from_millis(options.timeout))
            .map_err(|e| ResilienceError::ConnectionFailed(e.to_string()))?;

        Ok(Self { browser: Arc::new(browser) })
    }

    /// Launch a browser with default options
    pub fn new() -> Result<Self> {
        Self::launch(LaunchOptions::default())
    }

    /// Get the active tab
    pub fn tab(&self) -> Result<Arc<Tab>> {
        self.get_active_tab()
    }

    pub fn get_tabs(&self) -> Result<Vec<Arc<Tab>>> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map_err(|e| ResilienceError::ConnectionFailed(format!("Failed to get tabs: {}", e)))?
            .clone();

        Ok(tabs)
    }

    /// Get the currently active tab by checking the document visibility and focus state
    pub fn get_active_tab(&self) -> Result<Arc<Tab>> {
        let tabs = self.get_tabs()?;

        // Visible and focused first, then merely visible
        for check in ["document.visibilityState === 'visible' && document.hasFocus()", "document.visibilityState === 'visible'"] {
            for tab in &tabs {
                match tab.evaluate(check, false) {
                    Ok(remote_object) => {
                        if remote_object.value.and_then(|v| v.as_bool()).unwrap_or(false) {
                            return Ok(tab.clone());
                        }
                    }
                    Err(e) => log::debug!("Failed to check tab status: {}", e),
                }
            }
        }

        // A lone headless tab reports neither state reliably
        match tabs.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(ResilienceError::ConnectionFailed("No active tab found".to_string())),
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    /// Navigate the active tab and wait for the load to finish
    pub fn navigate(&self, url: &str) -> Result<()> {
        let url = normalize_url(url);
        self.tab()?
            .navigate_to(&url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(|e| ResilienceError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e)))?;

        Ok(())
    }

    pub fn current_url(&self) -> Result<String> {
        Ok(self.tab()?.get_url())
    }

    /// Close every tab; the browser process exits when the session is dropped
    pub fn close(&self) -> Result<()> {
        for tab in self.get_tabs()? {
            let _ = tab.close(false);
        }
        Ok(())
    }
}

/// Complete an incomplete URL with a scheme
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();

    const SCHEMES: [&str; 7] = ["http://", "https://", "file://", "data:", "about:", "chrome://", "chrome-extension://"];
    if SCHEMES.iter().any(|s| trimmed.starts_with(s)) {
        return trimmed.to_string();
    }

    if trimmed.starts_with('/') || trimmed.starts_with("./") || trimmed.starts_with("../") {
        return trimmed.to_string();
    }

    if trimmed.starts_with("localhost") || trimmed.starts_with("127.0.0.1") {
        return format!("http://{}", trimmed);
    }

    if trimmed.contains('.') {
        return format!("https://{}", trimmed);
    }

    format!("https://www.{}.com", trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_options_builder() {
        let opts = LaunchOptions::new().headless(false).window_size(800, 600).sandbox(false);

        assert!(!opts.headless);
        assert!(!opts.sandbox);
        assert_eq!(opts.window_width, 800);
        assert_eq!(opts.window_height, 600);
    }

    #[test]
    fn test_connection_options() {
        let opts = ConnectionOptions::new("ws://localhost:9222").timeout(5000);

        assert_eq!(opts.ws_url, "ws://localhost:9222");
        assert_eq!(opts.timeout, 5000);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
        assert_eq!(normalize_url("  about:blank "), "about:blank");
        assert_eq!(normalize_url("localhost:3000/app"), "http://localhost:3000/app");
        assert_eq!(normalize_url("example.com/path"), "https://example.com/path");
        assert_eq!(normalize_url("google"), "https://www.google.com");
        assert_eq!(normalize_url("/relative"), "/relative");
    }

    // Integration tests (require Chrome to be installed)
    #[test]
    #[ignore] // Ignore by default, run with: cargo test -- --ignored
    fn test_launch_browser() {
        let result = BrowserSession::launch(LaunchOptions::new().headless(true));
        assert!(result.is_ok());
    }

    #[test]
    #[ignore]
    fn test_navigate() {
        let session = BrowserSession::launch(LaunchOptions::new().headless(true)).expect("Failed to launch browser");

        assert!(session.navigate("about:blank").is_ok());
        assert_eq!(session.current_url().unwrap(), "about:blank");
    }
}
