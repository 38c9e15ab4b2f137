//! Browser-less rendering backend
//!
//! Approximates the layout of the loaded HTML from its block elements and
//! draws a wireframe bitmap of that size. Useful for dry runs of the full
//! pipeline on machines without Chrome, and in tests.

use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::pool::ContextFactory;
use crate::renderer::{device_pixels, Clip, Surface};
use crate::{Error, Result};

const LINE_HEIGHT: u32 = 24;
const BODY_PADDING: u32 = 32;
const MIN_HEIGHT: u32 = 64;

const BLOCK_TAGS: &[&str] = &[
    "<p", "<div", "<li", "<tr", "<h1", "<h2", "<h3", "<h4", "<h5", "<h6", "<br", "<img", "<section",
    "<header", "<footer", "<table",
];

/// Creates [`PlaceholderSurface`]s
#[derive(Debug, Clone, Default)]
pub struct PlaceholderFactory;

impl ContextFactory for PlaceholderFactory {
    type Context = PlaceholderSurface;

    fn create(&self) -> Result<PlaceholderSurface> {
        Ok(PlaceholderSurface::default())
    }
}

/// In-memory page that "lays out" one line per block element
#[derive(Debug, Clone, Default)]
pub struct PlaceholderSurface {
    html: String,
    viewport: (u32, u32, f64),
}

impl PlaceholderSurface {
    pub fn estimated_height(html: &str) -> u32 {
        let lower = html.to_ascii_lowercase();
        let blocks: usize = BLOCK_TAGS
            .iter()
            .map(|tag| {
                lower
                    .match_indices(tag)
                    .filter(|(i, m)| {
                        // `<p` must not match `<pre`/`<path`, etc.
                        lower[i + m.len()..]
                            .chars()
                            .next()
                            .map_or(true, |c| c == '>' || c == '/' || c.is_whitespace())
                    })
                    .count()
            })
            .sum();
        let blocks = u32::try_from(blocks).unwrap_or(u32::MAX / LINE_HEIGHT);
        (BODY_PADDING + blocks.saturating_mul(LINE_HEIGHT)).max(MIN_HEIGHT)
    }

    /// First `#rrggbb` colour in the document, used for the header band.
    fn accent(&self) -> Rgba<u8> {
        let bytes = self.html.as_bytes();
        for (i, _) in self.html.match_indices('#') {
            if let Some(hex) = bytes.get(i + 1..i + 7) {
                if hex.iter().all(u8::is_ascii_hexdigit) {
                    let channel = |k: usize| {
                        std::str::from_utf8(&hex[k..k + 2])
                            .ok()
                            .and_then(|s| u8::from_str_radix(s, 16).ok())
                            .unwrap_or(0)
                    };
                    return Rgba([channel(0), channel(2), channel(4), 255]);
                }
            }
        }
        Rgba([15, 52, 96, 255])
    }
}

impl Surface for PlaceholderSurface {
    fn set_viewport(&mut self, width: u32, height: u32, scale: f64) -> Result<()> {
        self.viewport = (width, height, scale);
        Ok(())
    }

    fn load_html(&mut self, html: &str) -> Result<()> {
        self.html = html.to_string();
        Ok(())
    }

    fn wait_ready(&mut self) -> Result<()> {
        Ok(())
    }

    fn content_height(&mut self) -> Result<u32> {
        Ok(Self::estimated_height(&self.html))
    }

    fn capture_png(&mut self, clip: Clip) -> Result<Vec<u8>> {
        let width = device_pixels(clip.width.round() as u32, clip.scale);
        let height = device_pixels(clip.height.round() as u32, clip.scale);
        let band = device_pixels(BODY_PADDING, clip.scale).min(height);
        let line = device_pixels(LINE_HEIGHT, clip.scale).max(1);
        let margin = width / 16;
        let accent = self.accent();

        let img = RgbaImage::from_fn(width, height, |x, y| {
            if y < band {
                accent
            } else if (y - band) % line < line / 3 && x >= margin && x < width - margin {
                Rgba([220, 224, 230, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });

        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| Error::RenderError(format!("placeholder capture failed: {}", e)))?;
        Ok(buf.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_grows_with_blocks() {
        let short = PlaceholderSurface::estimated_height("<div><p>a</p></div>");
        let long = PlaceholderSurface::estimated_height(
            "<div><p>a</p><p>b</p><ul><li>1</li><li>2</li><li>3</li></ul></div>",
        );
        assert_eq!(short, MIN_HEIGHT.max(BODY_PADDING + 2 * LINE_HEIGHT));
        assert!(long > short);
        assert_eq!(PlaceholderSurface::estimated_height("<pre>x</pre>"), MIN_HEIGHT);
    }

    #[test]
    fn capture_matches_clip_at_scale() {
        let mut surface = PlaceholderSurface::default();
        surface.load_html("<style>h1{color:#E94560}</style><h1>x</h1>").unwrap();
        assert_eq!(surface.accent(), Rgba([0xE9, 0x45, 0x60, 255]));

        let png = surface
            .capture_png(Clip {
                x: 0.0,
                y: 0.0,
                width: 200.0,
                height: 100.0,
                scale: 2.0,
            })
            .unwrap();
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!((img.width(), img.height()), (400, 200));
    }
}
