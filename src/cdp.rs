//! Chrome DevTools Protocol backend (uses the `headless_chrome` crate)
//!
//! One headless Chrome process is launched per factory; every pooled context
//! is a tab in that process.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, info, warn};
use serde_json::json;

use crate::pool::ContextFactory;
use crate::renderer::{Clip, Surface};
use crate::{Error, Result, VreConfig};

/// Chrome is never shut down for idleness; the pool owns its lifetime.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const CHROME_ARGS: &[&str] = &[
    "--disable-gpu",
    "--hide-scrollbars",
    "--mute-audio",
    "--disable-extensions",
    "--disable-dev-shm-usage",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-translate",
];

/// Launch settings for [`ChromeContextFactory`]
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub chrome_path: Option<PathBuf>,
    pub sandbox: bool,
    pub window_width: u32,
    /// Default timeout of each tab's CDP calls
    pub tab_timeout: Duration,
}

impl From<&VreConfig> for ChromeOptions {
    fn from(cfg: &VreConfig) -> Self {
        Self {
            chrome_path: cfg.chrome_path.clone(),
            sandbox: cfg.sandbox,
            window_width: cfg.default_width,
            tab_timeout: Duration::from_millis(cfg.render_timeout_ms),
        }
    }
}

/// Opens tabs in a shared headless Chrome
pub struct ChromeContextFactory {
    browser: Browser,
    tab_timeout: Duration,
}

impl ChromeContextFactory {
    /// Launch Chrome.
    pub fn launch(options: ChromeOptions) -> Result<Self> {
        let args: Vec<&OsStr> = CHROME_ARGS.iter().map(OsStr::new).collect();
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(options.sandbox)
            .window_size(Some((options.window_width, 1080)))
            .path(options.chrome_path.clone())
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .args(args)
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;
        info!("Launched headless Chrome");

        Ok(Self {
            browser,
            tab_timeout: options.tab_timeout,
        })
    }
}

impl ContextFactory for ChromeContextFactory {
    type Context = ChromeContext;

    fn create(&self) -> Result<ChromeContext> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;
        tab.set_default_timeout(self.tab_timeout);
        tab.navigate_to("about:blank")
            .and_then(|t| t.wait_until_navigated())
            .map_err(|e| Error::InitializationError(format!("Failed to open blank page: {}", e)))?;
        debug!("Opened rendering tab");
        Ok(ChromeContext { tab })
    }

    fn destroy(&self, context: ChromeContext) {
        if let Err(e) = context.tab.close(false) {
            warn!("Failed to close tab: {}", e);
        }
    }
}

/// One pooled Chrome tab
pub struct ChromeContext {
    tab: Arc<Tab>,
}

impl ChromeContext {
    fn eval_u32(&self, expression: &str) -> Result<u32> {
        let remote = self
            .tab
            .evaluate(expression, false)
            .map_err(|e| Error::RenderError(format!("Evaluation failed: {}", e)))?;
        remote
            .value
            .as_ref()
            .and_then(|v| v.as_f64())
            .map(|n| n.max(0.0).ceil() as u32)
            .ok_or_else(|| Error::RenderError(format!("No numeric value returned from {}", expression)))
    }
}

impl Surface for ChromeContext {
    fn set_viewport(&mut self, width: u32, height: u32, scale: f64) -> Result<()> {
        let metrics: Emulation::SetDeviceMetricsOverride = serde_json::from_value(json!({
            "width": width,
            "height": height.max(1),
            "deviceScaleFactor": scale,
            "mobile": false,
        }))
        .map_err(|e| Error::RenderError(format!("Invalid viewport: {}", e)))?;
        self.tab
            .call_method(metrics)
            .map_err(|e| Error::RenderError(format!("Failed to set viewport: {}", e)))?;
        Ok(())
    }

    fn load_html(&mut self, html: &str) -> Result<()> {
        let url = format!(
            "data:text/html;charset=utf-8;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(html)
        );
        self.tab
            .navigate_to(&url)
            .map_err(|e| Error::RenderError(format!("Navigation failed: {}", e)))?;
        Ok(())
    }

    fn wait_ready(&mut self) -> Result<()> {
        self.tab
            .wait_until_navigated()
            .map_err(|e| Error::RenderError(format!("Wait for navigation failed: {}", e)))?;
        self.tab
            .wait_for_element("body")
            .map_err(|e| Error::RenderError(format!("Document body never appeared: {}", e)))?;
        Ok(())
    }

    fn content_height(&mut self) -> Result<u32> {
        self.eval_u32("document.body.scrollHeight")
    }

    fn capture_png(&mut self, clip: Clip) -> Result<Vec<u8>> {
        // the clip is in CSS pixels; the device scale factor already applies
        let viewport = Page::Viewport {
            x: clip.x,
            y: clip.y,
            width: clip.width,
            height: clip.height,
            scale: 1.0,
        };
        self.tab
            .capture_screenshot(
                Page::CaptureScreenshotFormatOption::Png,
                None,
                Some(viewport),
                true,
            )
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))
    }
}
