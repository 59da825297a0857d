//! # Archive Export Module
//!
//! Questo modulo raccoglie gli output riusciti in un unico payload scaricabile.
//!
//! ## Responsabilità:
//! - Un solo item riuscito: payload singolo `<prefix>_<nome>` con i byte dell'output
//! - Più item: archivio ZIP con un'entry per item, nomi resi univoci
//! - Nome suggerito per l'archivio: `<tool>_<timestamp>.zip`
//! - Sink di download su directory con scrittura atomica
//!
//! ## Collisioni di nomi:
//! ```text
//! compressed_a.png, compressed_a.png  ──►  compressed_a.png, compressed_a_1.png
//! ```
//!
//! ## Fallimenti:
//! Un errore di costruzione dell'archivio fallisce solo l'export: lo stato della
//! pipeline resta intatto e l'export può essere ripetuto.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::PipelineError;

/// One succeeded output ready for export
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub original_name: String,
    pub bytes: Bytes,
}

/// What the user downloads
#[derive(Debug, Clone, PartialEq)]
pub enum ExportPayload {
    Single { filename: String, bytes: Bytes },
    Archive { filename: String, bytes: Bytes, entries: Vec<String> },
}

impl ExportPayload {
    pub fn filename(&self) -> &str {
        match self {
            Self::Single { filename, .. } | Self::Archive { filename, .. } => filename,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Self::Single { bytes, .. } | Self::Archive { bytes, .. } => bytes,
        }
    }
}

/// Strip any path components so entries cannot escape the archive root
fn sanitize_filename(filename: &str, fallback: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or(fallback)
        .to_string()
}

/// Insert `_n` before the extension
fn with_suffix(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}_{}", name, n),
    }
}

/// Builds single-file payloads and ZIP archives
#[derive(Debug, Clone)]
pub struct ArchiveExporter {
    prefix: String,
    tool_name: String,
}

impl ArchiveExporter {
    pub fn new(prefix: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tool_name: tool_name.into(),
        }
    }

    /// `<prefix>_<originalName>`
    pub fn entry_name(&self, original_name: &str) -> String {
        let base = sanitize_filename(original_name, "unnamed");
        if self.prefix.is_empty() {
            base
        } else {
            format!("{}_{}", self.prefix, base)
        }
    }

    /// Unique entry names, in input order
    pub fn unique_names(&self, entries: &[ExportEntry]) -> Vec<String> {
        let mut taken: HashSet<String> = HashSet::new();
        entries
            .iter()
            .map(|entry| {
                let base = self.entry_name(&entry.original_name);
                let mut candidate = base.clone();
                let mut n = 1;
                while !taken.insert(candidate.clone()) {
                    candidate = with_suffix(&base, n);
                    n += 1;
                }
                candidate
            })
            .collect()
    }

    pub fn archive_name(&self, timestamp: DateTime<Utc>) -> String {
        format!("{}_{}.zip", self.tool_name, timestamp.format("%Y%m%d_%H%M%S"))
    }

    pub fn export(&self, entries: &[ExportEntry]) -> Result<ExportPayload, PipelineError> {
        self.export_at(entries, Utc::now())
    }

    pub fn export_at(&self, entries: &[ExportEntry], timestamp: DateTime<Utc>) -> Result<ExportPayload, PipelineError> {
        match entries {
            [] => Err(PipelineError::NothingToExport),
            [single] => Ok(ExportPayload::Single {
                filename: self.entry_name(&single.original_name),
                bytes: single.bytes.clone(),
            }),
            many => {
                let names = self.unique_names(many);
                let bytes = Self::build_zip(many, &names)
                    .map_err(|e| PipelineError::ArchiveBuildFailure(e.to_string()))?;
                let filename = self.archive_name(timestamp);
                info!("Built archive {} with {} entries ({} bytes)", filename, names.len(), bytes.len());
                Ok(ExportPayload::Archive {
                    filename,
                    bytes: Bytes::from(bytes),
                    entries: names,
                })
            }
        }
    }

    fn build_zip(entries: &[ExportEntry], names: &[String]) -> anyhow::Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        // gli output sono già compressi: deflate guadagna poco ma resta compatibile
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        for (entry, name) in entries.iter().zip(names) {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(&entry.bytes)?;
            debug!("Added {} ({} bytes) to archive", name, entry.bytes.len());
        }

        Ok(zip.finish()?.into_inner())
    }
}

/// Platform-level save action for an exported payload
pub trait DownloadSink {
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, PipelineError>;
}

/// Saves payloads into a directory, atomically
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DownloadSink for DirectorySink {
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, PipelineError> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(sanitize_filename(filename, "export.bin"));

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(&target).map_err(|e| PipelineError::Io(e.error))?;

        info!("Saved {} ({} bytes)", target.display(), bytes.len());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;
    use tempfile::TempDir;

    fn entry(name: &str, bytes: &'static [u8]) -> ExportEntry {
        ExportEntry {
            original_name: name.to_string(),
            bytes: Bytes::from_static(bytes),
        }
    }

    fn exporter() -> ArchiveExporter {
        ArchiveExporter::new("compressed", "image_compressor")
    }

    fn zip_contents(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                (file.name().to_string(), data)
            })
            .collect()
    }

    #[test]
    fn test_single_entry_is_plain_payload() {
        let payload = exporter().export(&[entry("a.png", b"AAAA")]).unwrap();
        assert_eq!(
            payload,
            ExportPayload::Single {
                filename: "compressed_a.png".into(),
                bytes: Bytes::from_static(b"AAAA"),
            }
        );
    }

    #[test]
    fn test_archive_has_one_entry_per_item() {
        let timestamp = Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 5).unwrap();
        let payload = exporter()
            .export_at(&[entry("a.png", b"AAAA"), entry("b.png", b"BB")], timestamp)
            .unwrap();

        assert_eq!(payload.filename(), "image_compressor_20261017_093005.zip");
        let contents = zip_contents(payload.bytes());
        assert_eq!(
            contents,
            vec![
                ("compressed_a.png".to_string(), b"AAAA".to_vec()),
                ("compressed_b.png".to_string(), b"BB".to_vec()),
            ]
        );
    }

    #[test]
    fn test_name_collisions_get_numeric_suffix() {
        let entries = [
            entry("a.png", b"1"),
            entry("dir/a.png", b"2"),
            entry("a.png", b"3"),
            entry("a_1.png", b"4"),
            entry("README", b"5"),
            entry("README", b"6"),
        ];
        let names = exporter().unique_names(&entries);
        assert_eq!(
            names,
            vec![
                "compressed_a.png",
                "compressed_a_1.png",
                "compressed_a_2.png",
                "compressed_a_1_1.png",
                "compressed_README",
                "compressed_README_1",
            ]
        );

        let payload = exporter().export(&entries).unwrap();
        assert_eq!(zip_contents(payload.bytes()).len(), entries.len());
    }

    #[test]
    fn test_nothing_to_export() {
        assert!(matches!(exporter().export(&[]), Err(PipelineError::NothingToExport)));
    }

    #[test]
    fn test_entry_names_are_sanitized() {
        assert_eq!(exporter().entry_name("../../etc/passwd"), "compressed_passwd");
        assert_eq!(exporter().entry_name(".."), "compressed_unnamed");
        assert_eq!(ArchiveExporter::new("", "t").entry_name("x.png"), "x.png");
    }

    #[test]
    fn test_directory_sink_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let sink = DirectorySink::new(temp_dir.path().join("out"));

        let path = sink.save("compressed_a.png", b"data").unwrap();
        assert_eq!(path, temp_dir.path().join("out").join("compressed_a.png"));
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        // sovrascrive un export precedente con lo stesso nome
        sink.save("compressed_a.png", b"newer").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
    }
}
