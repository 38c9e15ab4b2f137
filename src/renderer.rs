//! HTML to image rendering over the browser pool
//!
//! One render: acquire a context, size the viewport, load the HTML, let it
//! settle, measure the content height, capture exactly that area as PNG,
//! return the context, convert to the requested format. A single deadline
//! covers acquisition and rendering; once a context is owned the capture is
//! never preempted, the caller simply stops waiting for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::convert::{self, Converted};
use crate::pool::{BrowserPool, ContextFactory};
use crate::{Error, OutputFormat, Result, VreConfig};

/// Region to capture, in CSS pixels, rasterized at `scale`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

/// A page that can load HTML and capture itself.
///
/// Implemented by the pooled contexts of each backend.
pub trait Surface: Send + 'static {
    /// Layout viewport in CSS pixels with the given device scale factor.
    fn set_viewport(&mut self, width: u32, height: u32, scale: f64) -> Result<()>;

    /// Replace the document with `html`, without any network fetch for it.
    fn load_html(&mut self, html: &str) -> Result<()>;

    /// Block until the document is structurally ready.
    fn wait_ready(&mut self) -> Result<()>;

    /// Rendered content height in CSS pixels.
    fn content_height(&mut self) -> Result<u32>;

    /// Lossless PNG of `clip`.
    fn capture_png(&mut self, clip: Clip) -> Result<Vec<u8>>;
}

/// Per-render options; zero or `None` fields take the renderer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RenderOpts {
    pub width: u32,
    pub format: Option<OutputFormat>,
    pub quality: u8,
    pub scale: f64,
    /// Cap on the captured height in CSS pixels (0: none)
    pub max_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Resolved {
    width: u32,
    format: OutputFormat,
    quality: u8,
    scale: f64,
    max_height: u32,
}

/// Output of one render
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    pub render_time: Duration,
}

/// Renderer defaults and limits
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub render_timeout: Duration,
    pub settle_delay: Duration,
    pub default_width: u32,
    pub default_format: OutputFormat,
    pub default_quality: u8,
    pub default_scale: f64,
    pub pngquant_path: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::from(&VreConfig::default())
    }
}

impl From<&VreConfig> for RendererConfig {
    fn from(cfg: &VreConfig) -> Self {
        Self {
            render_timeout: Duration::from_millis(cfg.render_timeout_ms),
            settle_delay: Duration::from_millis(cfg.settle_delay_ms),
            default_width: cfg.default_width,
            default_format: cfg.default_format,
            default_quality: cfg.default_quality,
            default_scale: cfg.default_scale,
            pngquant_path: cfg.pngquant_path.clone(),
        }
    }
}

/// Renders HTML through a [`BrowserPool`]
pub struct Renderer<F: ContextFactory>
where
    F::Context: Surface,
{
    pool: BrowserPool<F>,
    config: Arc<RendererConfig>,
}

impl<F: ContextFactory> Clone for Renderer<F>
where
    F::Context: Surface,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<F: ContextFactory> Renderer<F>
where
    F::Context: Surface,
{
    pub fn new(pool: BrowserPool<F>, config: RendererConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    pub fn pool(&self) -> &BrowserPool<F> {
        &self.pool
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    fn resolve(&self, opts: &RenderOpts) -> Resolved {
        let cfg = &self.config;
        Resolved {
            width: if opts.width == 0 { cfg.default_width } else { opts.width },
            format: opts.format.unwrap_or(cfg.default_format),
            quality: if opts.quality == 0 { cfg.default_quality } else { opts.quality.min(100) },
            scale: if opts.scale > 0.0 && opts.scale.is_finite() {
                opts.scale
            } else {
                cfg.default_scale
            },
            max_height: opts.max_height,
        }
    }

    /// Render `html` to an image.
    pub async fn render_html(
        &self,
        html: &str,
        opts: &RenderOpts,
        cancel: &CancellationToken,
    ) -> Result<RenderedImage> {
        let started = Instant::now();
        let opts = self.resolve(opts);
        let timeout = self.config.render_timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = tokio::time::Instant::now() + timeout;

        let context = match tokio::time::timeout_at(deadline, self.pool.acquire(cancel)).await {
            Ok(acquired) => acquired?,
            Err(_) => return Err(Error::AcquireTimeout(timeout_ms)),
        };
        debug!("Acquired context after {:?}", started.elapsed());

        let html = html.to_string();
        let settle = self.config.settle_delay;
        let pngquant = self.config.pngquant_path.clone();
        let job = tokio::task::spawn_blocking(move || {
            let mut context = context;
            let png = capture(&mut *context, &html, &opts, settle);
            context.release();
            convert::convert(&png?, opts.format, opts.quality, pngquant.as_deref())
        });

        let Converted { bytes, width, height } = match tokio::time::timeout_at(deadline, job).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(Error::RenderError(format!("render task failed: {}", e))),
            Err(_) => return Err(Error::RenderTimeout(timeout_ms)),
        };

        let render_time = started.elapsed();
        info!(
            "Rendered {}x{} {} ({} bytes) in {:?}",
            width,
            height,
            opts.format,
            bytes.len(),
            render_time
        );
        Ok(RenderedImage {
            bytes,
            width,
            height,
            format: opts.format,
            render_time,
        })
    }
}

fn capture<S: Surface + ?Sized>(
    surface: &mut S,
    html: &str,
    opts: &Resolved,
    settle: Duration,
) -> Result<Vec<u8>> {
    // height 1 so the measured height is the content, not the viewport
    surface.set_viewport(opts.width, 1, opts.scale)?;
    surface.load_html(html)?;
    surface.wait_ready()?;
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }

    let mut height = surface.content_height()?.max(1);
    if opts.max_height > 0 {
        height = height.min(opts.max_height);
    }

    surface.set_viewport(opts.width, height, opts.scale)?;
    surface.capture_png(Clip {
        x: 0.0,
        y: 0.0,
        width: f64::from(opts.width),
        height: f64::from(height),
        scale: opts.scale,
    })
}

/// Pixel size of a CSS length at `scale`.
pub fn device_pixels(css: u32, scale: f64) -> u32 {
    (f64::from(css) * scale).round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::sample_png;
    use crate::pool::BrowserPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls {
        viewports: Mutex<Vec<(u32, u32, f64)>>,
        clips: Mutex<Vec<Clip>>,
        loaded: Mutex<Vec<String>>,
    }

    struct FakeSurface {
        calls: Arc<Calls>,
        height: u32,
        delay: Duration,
    }

    impl Surface for FakeSurface {
        fn set_viewport(&mut self, width: u32, height: u32, scale: f64) -> Result<()> {
            self.calls.viewports.lock().unwrap().push((width, height, scale));
            Ok(())
        }

        fn load_html(&mut self, html: &str) -> Result<()> {
            self.calls.loaded.lock().unwrap().push(html.to_string());
            Ok(())
        }

        fn wait_ready(&mut self) -> Result<()> {
            std::thread::sleep(self.delay);
            Ok(())
        }

        fn content_height(&mut self) -> Result<u32> {
            Ok(self.height)
        }

        fn capture_png(&mut self, clip: Clip) -> Result<Vec<u8>> {
            self.calls.clips.lock().unwrap().push(clip);
            Ok(sample_png(
                device_pixels(clip.width as u32, clip.scale),
                device_pixels(clip.height as u32, clip.scale),
            ))
        }
    }

    struct FakeFactory {
        calls: Arc<Calls>,
        height: u32,
        delay: Duration,
        released: Arc<AtomicUsize>,
    }

    impl ContextFactory for FakeFactory {
        type Context = FakeSurface;

        fn create(&self) -> Result<FakeSurface> {
            Ok(FakeSurface {
                calls: Arc::clone(&self.calls),
                height: self.height,
                delay: self.delay,
            })
        }

        fn destroy(&self, _context: FakeSurface) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn renderer(height: u32, delay: Duration, timeout: Duration) -> (Arc<Calls>, Renderer<FakeFactory>) {
        renderer_waiting(height, delay, timeout, Duration::from_millis(20))
    }

    fn renderer_waiting(
        height: u32,
        delay: Duration,
        timeout: Duration,
        wait_threshold: Duration,
    ) -> (Arc<Calls>, Renderer<FakeFactory>) {
        let calls = Arc::new(Calls::default());
        let factory = FakeFactory {
            calls: Arc::clone(&calls),
            height,
            delay,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let pool = BrowserPool::new(factory, 1, wait_threshold).unwrap();
        let config = RendererConfig {
            render_timeout: timeout,
            settle_delay: Duration::ZERO,
            pngquant_path: None,
            ..RendererConfig::default()
        };
        (calls, Renderer::new(pool, config))
    }

    #[tokio::test]
    async fn capture_fits_content_height() {
        let (calls, renderer) = renderer(300, Duration::ZERO, Duration::from_secs(5));
        let opts = RenderOpts {
            width: 400,
            format: Some(OutputFormat::Png),
            scale: 1.5,
            ..Default::default()
        };
        let img = renderer
            .render_html("<p>hello</p>", &opts, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((img.width, img.height), (600, 450));
        assert_eq!(img.format, OutputFormat::Png);
        assert_eq!(calls.loaded.lock().unwrap().as_slice(), ["<p>hello</p>"]);
        assert_eq!(calls.viewports.lock().unwrap().last(), Some(&(400, 300, 1.5)));
        let clip = calls.clips.lock().unwrap()[0];
        assert_eq!((clip.width, clip.height), (400.0, 300.0));
        // context went back to the pool
        assert_eq!(renderer.pool().stats().available, 1);
    }

    #[tokio::test]
    async fn max_height_caps_capture_and_defaults_apply() {
        let (calls, renderer) = renderer(5000, Duration::ZERO, Duration::from_secs(5));
        let opts = RenderOpts {
            max_height: 1200,
            ..Default::default()
        };
        let img = renderer
            .render_html("<p>tall</p>", &opts, &CancellationToken::new())
            .await
            .unwrap();

        // defaults: 800px wide at 1.5x, webp
        assert_eq!(img.format, OutputFormat::Webp);
        assert_eq!((img.width, img.height), (1200, 1800));
        assert_eq!(calls.clips.lock().unwrap()[0].height, 1200.0);
    }

    #[tokio::test]
    async fn slow_render_times_out_and_context_returns_later() {
        let (_, renderer) = renderer(100, Duration::from_millis(300), Duration::from_millis(50));
        let err = renderer
            .render_html("<p>slow</p>", &RenderOpts::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RenderTimeout(50)));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(renderer.pool().stats().available, 1);
    }

    #[tokio::test]
    async fn busy_pool_past_the_deadline_is_an_acquire_timeout() {
        // the overflow threshold is never reached before the render deadline
        let (calls, renderer) = renderer_waiting(
            100,
            Duration::ZERO,
            Duration::from_millis(50),
            Duration::from_secs(30),
        );
        let held = renderer.pool().acquire(&CancellationToken::new()).await.unwrap();

        let err = renderer
            .render_html("<p>queued</p>", &RenderOpts::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout(50)));
        assert!(err.is_transient());
        assert!(calls.loaded.lock().unwrap().is_empty());

        held.release();
        assert_eq!(renderer.pool().stats().available, 1);
    }

    #[tokio::test]
    async fn cancelled_acquire_is_reported() {
        let (_, renderer) = renderer(100, Duration::ZERO, Duration::from_secs(5));
        let held = renderer.pool().acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = renderer
            .render_html("<p>x</p>", &RenderOpts::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        held.release();
    }

    #[test]
    fn device_pixels_round() {
        assert_eq!(device_pixels(800, 1.5), 1200);
        assert_eq!(device_pixels(333, 1.5), 500);
        assert_eq!(device_pixels(0, 2.0), 1);
    }
}
