//! Utility functions
//!
use std::{fs::File, io::Cursor, path::PathBuf};

use anyhow::Result;
use reqwest::Client;

/// Download a file from a URL to a given filepath, creating parent directories as needed.
pub async fn download_file(
    client: &Client,
    url: &str,
    filepath: impl AsRef<std::path::Path>,
) -> Result<()> {
    let resp = client.get(url).send().await?.error_for_status()?;

    if let Some(parent) = filepath.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(filepath)?;
    let mut content = Cursor::new(resp.bytes().await?);
    std::io::copy(&mut content, &mut file)?;

    Ok(())
}

/// Default location of the detection model, inside the user's cache directory.
pub fn default_model_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("detect_server")
        .join("yolov8n.onnx")
}
