//! Read-image tool (spec §4.C/§6): load an image file from disk, converting
//! HEIC/AVIF through an external tool first, with optional resampling.

use crate::browser::runtime::resample_if_needed;
use crate::registry::{Tool, ToolResult};
use chorus_core::config::BrowserConfig;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

pub struct ReadImageTool {
    max_image_dimension: Option<u32>,
}

impl ReadImageTool {
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            max_image_dimension: config.max_image_dimension,
        }
    }
}

/// ISO base media file format brands that identify HEIC/AVIF containers:
/// bytes 4..8 are "ftyp", bytes 8..12 are the major brand.
fn heif_brand(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return None;
    }
    match &bytes[8..12] {
        b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" | b"hevm" | b"hevs" | b"mif1" => Some("heic"),
        b"avif" | b"avis" => Some("avif"),
        _ => None,
    }
}

async fn convert_heif_to_png(path: &Path) -> Result<Vec<u8>, String> {
    let out_path = std::env::temp_dir().join(format!("chorus-read-image-{}.png", uuid::Uuid::new_v4()));
    let status = Command::new("magick")
        .arg(path)
        .arg(&out_path)
        .status()
        .await
        .map_err(|e| format!("failed to invoke image conversion tool: {e}"))?;

    if !status.success() {
        return Err("image conversion tool exited with a failure status".to_string());
    }

    let bytes = tokio::fs::read(&out_path)
        .await
        .map_err(|e| format!("failed to read converted image: {e}"))?;
    let _ = tokio::fs::remove_file(&out_path).await;
    Ok(bytes)
}

#[async_trait::async_trait]
impl Tool for ReadImageTool {
    fn name(&self) -> &str {
        "read_image"
    }

    fn description(&self) -> &str {
        "Read an image file from disk and return it as inline image content. \
         HEIC/AVIF files are converted to PNG first."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path to the image file" },
                "timeout": { "type": "integer", "description": "Timeout in seconds (default 15)" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let path = match args["path"].as_str() {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: path"),
        };
        let timeout_secs = args["timeout"].as_u64().unwrap_or(15);

        let read = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            tokio::fs::read(path),
        )
        .await;

        let bytes = match read {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => return ToolResult::error(format!("Failed to read {path}: {e}")),
            Err(_) => return ToolResult::error(format!("Timed out reading {path}")),
        };

        let bytes = if let Some(brand) = heif_brand(&bytes) {
            match convert_heif_to_png(Path::new(path)).await {
                Ok(b) => b,
                Err(e) => return ToolResult::error(format!("Failed to convert {brand} image: {e}")),
            }
        } else {
            bytes
        };

        let decoded = match image::guess_format(&bytes) {
            Ok(_) => bytes,
            Err(_) => return ToolResult::error(format!("{path} does not contain recognizable image data")),
        };

        let decoded = match self.max_image_dimension {
            Some(max) => match resample_if_needed(&decoded, max) {
                Ok(b) => b,
                Err(e) => return ToolResult::error(e.to_string()),
            },
            None => decoded,
        };

        ToolResult::text_with_display(
            format!("Read {} ({} bytes)", path, decoded.len()),
            json!({ "path": path, "bytes": decoded.len() }),
        )
    }
}
