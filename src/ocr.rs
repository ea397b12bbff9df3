use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const ERROR_MARKER: &str = "⚠️ OCR error:";

/// A text recognition engine. Receives a PNG-encoded image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, png: &[u8]) -> Result<String>;
}

/// Runs the `tesseract` command line, streaming the image through stdin.
pub struct TesseractCli {
    program: String,
    language: Option<String>,
}

impl TesseractCli {
    pub fn new(program: impl Into<String>, language: Option<String>) -> Self {
        Self {
            program: program.into(),
            language,
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&self, png: &[u8]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("stdin").arg("stdout");
        if let Some(lang) = &self.language {
            cmd.arg("-l").arg(lang);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} on {} byte image", self.program, png.len());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", self.program))?;

        let mut stdin = child.stdin.take().context("Failed to take stdin")?;
        stdin
            .write_all(png)
            .await
            .context("Failed to send image to OCR engine")?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for OCR engine")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", self.program, output.status, stderr.trim());
        }

        String::from_utf8(output.stdout).context("OCR engine produced non UTF-8 text")
    }
}

/// Accepted upload formats.
pub fn is_supported_upload(bytes: &[u8]) -> bool {
    matches!(
        image::guess_format(bytes),
        Ok(ImageFormat::Png) | Ok(ImageFormat::Jpeg)
    )
}

/// Decode an uploaded JPEG or PNG.
pub fn decode_upload(bytes: &[u8]) -> Result<DynamicImage> {
    if !is_supported_upload(bytes) {
        bail!("unsupported image format (expected JPEG or PNG)");
    }
    image::load_from_memory(bytes).context("Failed to decode image")
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(buf.into_inner())
}

/// PNG bytes as the base64 payload stored on image messages.
pub fn to_base64_png(image: &DynamicImage) -> Result<String> {
    Ok(STANDARD.encode(encode_png(image)?))
}

/// Decode a stored image payload back into PNG bytes for redisplay.
pub fn from_base64_png(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload)
        .context("Stored image is not valid base64")
}

/// Wraps an [`OcrEngine`] so that callers always get text back: either the
/// trimmed recognized text or an error marker describing the failure.
#[derive(Clone)]
pub struct OcrAdapter {
    engine: Arc<dyn OcrEngine>,
}

impl OcrAdapter {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }

    pub async fn extract(&self, image: &DynamicImage) -> String {
        let result = match encode_png(image) {
            Ok(png) => self.engine.recognize(&png).await,
            Err(e) => Err(e),
        };
        into_text(result)
    }
}

fn into_text(result: Result<String>) -> String {
    match result {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!("OCR failed: {:#}", e);
            error_marker(&e)
        }
    }
}

pub fn error_marker(e: &anyhow::Error) -> String {
    format!("{} {:#}", ERROR_MARKER, e)
}
