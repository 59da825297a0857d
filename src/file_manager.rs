//! # File Management Module
//!
//! Questo modulo fa da "File Intake Source" per la CLI e raccoglie le utilità sui file.
//!
//! ## Responsabilità:
//! - Discovery ricorsiva dei file passati da riga di comando (file o directory)
//! - Lettura dei file in `Candidate` con MIME type dedotto dall'estensione
//! - Formattazione human-readable delle dimensioni
//! - Calcolo percentuali di riduzione
//!
//! ## Formati riconosciuti:
//! - **Immagini**: JPG, JPEG, PNG, WebP, GIF, BMP, AVIF
//! - **Video**: MP4, MOV, AVI, MKV, WebM
//! - **Audio**: MP3, WAV, FLAC, OGG, M4A
//! - **Documenti**: PDF
//!
//! ## Esempio:
//! ```rust,ignore
//! let candidates = FileManager::collect_candidates(&[PathBuf::from("/photos")]).await?;
//! let report = pipeline.add_files(candidates)?;
//! ```

use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::intake::Candidate;

/// Manages file discovery and size utilities
pub struct FileManager;

impl FileManager {
    /// Expand files and directories into a flat, sorted list of regular files
    pub fn discover(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for input in inputs {
            if !input.exists() {
                return Err(anyhow::anyhow!("Input does not exist: {}", input.display()));
            }

            if input.is_file() {
                files.push(input.clone());
                continue;
            }

            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            found.sort();
            debug!("Found {} files under {}", found.len(), input.display());
            files.extend(found);
        }

        Ok(files)
    }

    /// Read every discovered file into a pipeline candidate
    pub async fn collect_candidates(inputs: &[PathBuf]) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for path in Self::discover(inputs)? {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                warn!("Skipping path without file name: {}", path.display());
                continue;
            };

            let bytes = fs::read(&path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            let mime_type = Self::guess_mime(&name);
            candidates.push(Candidate::new(name, mime_type, bytes));
        }

        Ok(candidates)
    }

    /// MIME type from the file extension, empty when unknown
    pub fn guess_mime(name: &str) -> &'static str {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "jpg" | "jpeg" => "image/jpeg",
            "png" => "image/png",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "bmp" => "image/bmp",
            "avif" => "image/avif",
            "mp4" => "video/mp4",
            "mov" => "video/quicktime",
            "avi" => "video/x-msvideo",
            "mkv" => "video/x-matroska",
            "webm" => "video/webm",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "flac" => "audio/flac",
            "ogg" => "audio/ogg",
            "m4a" => "audio/mp4",
            "pdf" => "application/pdf",
            _ => "",
        }
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}
