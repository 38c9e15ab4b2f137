//! Visual Response Engine
//!
//! Turns structured data into a rendered image for chat-bot replies: a
//! tenant-specific HTML template is executed against the data, rasterized
//! through a pool of headless-browser contexts, and returned together with a
//! plain-text caption derived from the same data.
//!
//! # Features
//!
//! - **CDP Backend** (default): renders through headless Chrome
//! - **Tenant overrides**: per-tenant templates and brand configs fall back to
//!   shared defaults
//! - **Bounded pool**: warm contexts with limited overflow under bursts
//!
//! # Example
//!
//! ```no_run
//! use vre::{RenderRequest, VisualResponseEngine, VreConfig};
//!
//! # async fn run() -> vre::Result<()> {
//! let engine = VisualResponseEngine::launch(VreConfig::default())?;
//! let request = RenderRequest::template(
//!     "acme",
//!     "card_produto",
//!     serde_json::json!({"nome": "Camarão Cinza", "preco": 62.90, "unidade": "kg"}),
//! );
//! let response = engine.render(&request).await?;
//! println!("{}x{} {}", response.width, response.height, response.caption);
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine as Base64Engine;
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Error, Result};

pub mod brand;
pub mod cache;
pub mod caption;
pub mod convert;
pub mod engine;
pub mod funcs;
pub mod placeholder;
pub mod pool;
pub mod registry;
pub mod renderer;
pub mod store;

// Chrome backend
#[cfg(feature = "cdp")]
pub mod cdp;

pub use brand::BrandConfig;
pub use caption::CaptionGenerator;
pub use engine::VisualResponseEngine;
pub use funcs::FunctionLibrary;
pub use pool::{BrowserPool, ContextFactory, PoolStats, PooledContext};
pub use registry::TemplateRegistry;
pub use renderer::{RenderOpts, RenderedImage, Renderer, Surface};
pub use store::{FsStore, MemoryStore, TemplateStore};

/// Image encoding of a rendered response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Webp,
    Jpeg,
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpg",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Webp => "webp",
            OutputFormat::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::Webp),
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            other => Err(Error::InvalidRequest(format!("unknown output format: {}", other))),
        }
    }
}

/// Messaging channel a response is rendered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Web,
    Email,
}

impl Channel {
    /// Lenient lookup; `None` for names that are not channels.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Some(Channel::Whatsapp),
            "telegram" => Some(Channel::Telegram),
            "web" => Some(Channel::Web),
            "email" => Some(Channel::Email),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Web => "web",
            Channel::Email => "email",
        }
    }

    pub fn defaults(&self) -> ChannelDefaults {
        match self {
            Channel::Whatsapp | Channel::Telegram => ChannelDefaults {
                width: 800,
                max_height: 1200,
                format: OutputFormat::Webp,
                quality: 85,
                scale: 1.5,
            },
            Channel::Web => ChannelDefaults {
                width: 600,
                max_height: 0,
                format: OutputFormat::Webp,
                quality: 80,
                scale: 1.0,
            },
            Channel::Email => ChannelDefaults {
                width: 600,
                max_height: 0,
                format: OutputFormat::Png,
                quality: 90,
                scale: 1.0,
            },
        }
    }
}

/// Output presets of a channel. `max_height == 0` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelDefaults {
    pub width: u32,
    pub max_height: u32,
    pub format: OutputFormat,
    pub quality: u8,
    pub scale: f64,
}

/// Configuration for the visual response engine
///
/// Timeouts are in milliseconds. `VreConfig::from_env()` overlays `VRE_*`
/// environment variables on the defaults.
///
/// # Examples
///
/// ```
/// let cfg = vre::VreConfig::default();
/// assert_eq!(cfg.pool_size, 3);
/// assert!(cfg.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct VreConfig {
    /// Root of the template store (`default/`, `tenants/<id>/`)
    pub templates_path: PathBuf,
    /// Number of warm rendering contexts
    pub pool_size: usize,
    /// How long acquire waits before creating an overflow context
    pub acquire_wait_ms: u64,
    /// Deadline for a whole render, acquire included
    pub render_timeout_ms: u64,
    /// Pause after load for fonts and images
    pub settle_delay_ms: u64,
    pub default_width: u32,
    pub default_format: OutputFormat,
    pub default_quality: u8,
    pub default_scale: f64,
    /// Lifetime of cached renders (0 disables the cache)
    pub render_cache_ttl_ms: u64,
    /// pngquant binary; `None` disables PNG compression
    pub pngquant_path: Option<PathBuf>,
    /// Chrome binary; `None` lets the backend find one
    pub chrome_path: Option<PathBuf>,
    /// Run Chrome with its sandbox enabled
    pub sandbox: bool,
}

impl Default for VreConfig {
    fn default() -> Self {
        Self {
            templates_path: PathBuf::from("./templates"),
            pool_size: 3,
            acquire_wait_ms: 5000,
            render_timeout_ms: 10000,
            settle_delay_ms: 100,
            default_width: 800,
            default_format: OutputFormat::Webp,
            default_quality: 85,
            default_scale: 1.5,
            render_cache_ttl_ms: 300_000,
            pngquant_path: Some(PathBuf::from("pngquant")),
            chrome_path: None,
            sandbox: false,
        }
    }
}

impl VreConfig {
    /// Defaults overlaid with `VRE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (same keys as `from_env`).
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup("VRE_TEMPLATES_PATH") {
            cfg.templates_path = PathBuf::from(v);
        }
        set_parsed(&lookup, "VRE_POOL_SIZE", &mut cfg.pool_size)?;
        set_parsed(&lookup, "VRE_ACQUIRE_WAIT_MS", &mut cfg.acquire_wait_ms)?;
        set_parsed(&lookup, "VRE_RENDER_TIMEOUT_MS", &mut cfg.render_timeout_ms)?;
        set_parsed(&lookup, "VRE_SETTLE_DELAY_MS", &mut cfg.settle_delay_ms)?;
        set_parsed(&lookup, "VRE_DEFAULT_WIDTH", &mut cfg.default_width)?;
        set_parsed(&lookup, "VRE_DEFAULT_QUALITY", &mut cfg.default_quality)?;
        set_parsed(&lookup, "VRE_DEFAULT_SCALE", &mut cfg.default_scale)?;
        set_parsed(&lookup, "VRE_RENDER_CACHE_TTL_MS", &mut cfg.render_cache_ttl_ms)?;
        set_parsed(&lookup, "VRE_SANDBOX", &mut cfg.sandbox)?;

        if let Some(v) = lookup("VRE_DEFAULT_FORMAT") {
            cfg.default_format = v
                .parse()
                .map_err(|_| Error::ConfigError(format!("VRE_DEFAULT_FORMAT: invalid value {:?}", v)))?;
        }
        if let Some(v) = lookup("VRE_PNGQUANT") {
            cfg.pngquant_path = if v.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = lookup("CHROME_PATH") {
            if !v.trim().is_empty() {
                cfg.chrome_path = Some(PathBuf::from(v));
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::ConfigError("pool_size must be at least 1".into()));
        }
        if !(1..=100).contains(&self.default_quality) {
            return Err(Error::ConfigError("default_quality must be within 1..=100".into()));
        }
        if !(self.default_scale.is_finite() && self.default_scale > 0.0) {
            return Err(Error::ConfigError("default_scale must be positive".into()));
        }
        if self.default_width == 0 {
            return Err(Error::ConfigError("default_width must be positive".into()));
        }
        Ok(())
    }

    /// Presets used when a request names no known channel.
    pub fn fallback_channel_defaults(&self) -> ChannelDefaults {
        ChannelDefaults {
            width: self.default_width,
            format: self.default_format,
            quality: self.default_quality,
            scale: self.default_scale,
            ..Channel::Whatsapp.defaults()
        }
    }
}

fn set_parsed<L, T>(lookup: &L, key: &str, slot: &mut T) -> Result<()>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| Error::ConfigError(format!("{}: invalid value {:?}", key, raw)))?;
    }
    Ok(())
}

/// One render call.
///
/// Either `template_id` or `html` must be set. Unset overrides come from the
/// channel presets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderRequest {
    pub tenant_id: String,
    pub template_id: String,
    /// Raw HTML rendered instead of a template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Caption used verbatim instead of the generated one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Text to send after the image, passed through untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
}

impl RenderRequest {
    pub fn template(tenant_id: impl Into<String>, template_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            template_id: template_id.into(),
            data,
            ..Default::default()
        }
    }

    pub fn custom_html(tenant_id: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            html: Some(html.into()),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel.as_str().to_string());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_follow_up(mut self, text: impl Into<String>) -> Self {
        self.follow_up = Some(text.into());
        self
    }

    pub fn is_custom_html(&self) -> bool {
        self.html.as_deref().map_or(false, |h| !h.trim().is_empty())
    }

    /// Reject requests that cannot be rendered.
    pub fn validate(&self) -> Result<()> {
        registry::validate_identifier("tenant id", &self.tenant_id)?;
        if !self.is_custom_html() {
            if self.template_id.is_empty() {
                return Err(Error::InvalidRequest(
                    "either template_id or html is required".into(),
                ));
            }
            registry::validate_identifier("template id", &self.template_id)?;
        }
        if let Some(q) = self.quality {
            if !(1..=100).contains(&q) {
                return Err(Error::InvalidRequest(format!("quality out of range: {}", q)));
            }
        }
        if let Some(s) = self.scale {
            if !(s.is_finite() && s > 0.0) {
                return Err(Error::InvalidRequest(format!("invalid scale: {}", s)));
            }
        }
        if self.width == Some(0) {
            return Err(Error::InvalidRequest("width must be positive".into()));
        }
        Ok(())
    }

    /// Effective output settings: channel presets (or `fallback`) with the
    /// request's overrides applied.
    pub fn settings(&self, fallback: &ChannelDefaults) -> ChannelDefaults {
        let base = self
            .channel
            .as_deref()
            .and_then(Channel::parse)
            .map(|c| c.defaults())
            .unwrap_or(*fallback);

        ChannelDefaults {
            width: self.width.unwrap_or(base.width),
            max_height: base.max_height,
            format: self.format.unwrap_or(base.format),
            quality: self.quality.unwrap_or(base.quality),
            scale: self.scale.unwrap_or(base.scale),
        }
    }
}

/// Result of a render call
#[derive(Debug, Clone, Serialize)]
pub struct RenderResponse {
    #[serde(skip)]
    pub image: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub caption: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow_up: Option<String>,
    pub render_time_ms: u64,
    pub cache_hit: bool,
}

impl RenderResponse {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type(),
            base64::engine::general_purpose::STANDARD.encode(&self.image)
        )
    }
}
