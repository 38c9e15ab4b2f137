//! Conversion of the lossless capture into the requested output format

use std::io::{Cursor, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageFormat};
use log::{debug, warn};

use crate::{Error, OutputFormat, Result};

/// pngquant's exit status when the requested quality cannot be met
const PNGQUANT_QUALITY_TOO_LOW: i32 = 99;

/// Encoded image plus its pixel dimensions
#[derive(Debug, Clone)]
pub struct Converted {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode a PNG capture and encode it as `format`.
///
/// PNG output goes through `pngquant` when a binary is given; any failure
/// there keeps the original bitmap.
pub fn convert(png: &[u8], format: OutputFormat, quality: u8, pngquant: Option<&Path>) -> Result<Converted> {
    let img = decode_png(png)?;
    let (width, height) = (img.width(), img.height());

    let bytes = match format {
        OutputFormat::Png => match pngquant {
            Some(tool) => compress_png(png, quality, tool),
            None => png.to_vec(),
        },
        OutputFormat::Jpeg => encode_jpeg(&img, quality)?,
        OutputFormat::Webp => encode_webp(&img)?,
    };

    Ok(Converted { bytes, width, height })
}

pub fn decode_png(png: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory_with_format(png, ImageFormat::Png)
        .map_err(|e| Error::FormatConversion(format!("failed to decode capture: {}", e)))
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.to_rgb8().write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

fn encode_webp(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = WebPEncoder::new_lossless(&mut buf);
    img.to_rgba8().write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

/// Best-effort palette quantization through an external `pngquant`.
///
/// Returns the input unchanged when the tool is missing, fails, cannot reach
/// the quality floor, or produces a larger file.
pub fn compress_png(png: &[u8], quality: u8, tool: &Path) -> Vec<u8> {
    match run_pngquant(png, quality, tool) {
        Ok(Some(out)) if !out.is_empty() && out.len() < png.len() => {
            debug!("pngquant: {} -> {} bytes", png.len(), out.len());
            out
        }
        Ok(_) => png.to_vec(),
        Err(e) => {
            warn!("PNG compression skipped: {}", e);
            png.to_vec()
        }
    }
}

fn run_pngquant(png: &[u8], quality: u8, tool: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let quality = quality.min(100);
    let range = format!("{}-{}", quality.saturating_sub(10), quality);

    let mut child = Command::new(tool)
        .args(["--quality", &range, "--speed", "3", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    // feed stdin from a separate thread so a full stdout pipe cannot deadlock us
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pngquant stdin unavailable"))?;
    let input = png.to_vec();
    let writer = std::thread::spawn(move || stdin.write_all(&input));

    let output = child.wait_with_output()?;
    // a write error here only means pngquant exited early; its status says why
    let _ = writer.join();

    match output.status.code() {
        Some(0) => Ok(Some(output.stdout)),
        Some(PNGQUANT_QUALITY_TOO_LOW) => Ok(None),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("pngquant exited with {}", output.status),
        )),
    }
}
