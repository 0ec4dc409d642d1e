//! Command-line chat client for colloquy.
//!
//! Wires the engine to an OpenAI-compatible endpoint, a history store
//! (Postgres when `DATABASE_URL` is set, in memory otherwise) and the
//! built-in tools.

pub mod config;
pub mod db;
pub mod render;
pub mod tools;

use std::path::Path;

/// Reads an image attachment. An empty file counts as no image.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn load_image(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let bytes = tokio::fs::read(path).await?;
    Ok((!bytes.is_empty()).then_some(bytes))
}
