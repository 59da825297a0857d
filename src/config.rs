//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione della pipeline.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri della pipeline
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `max_concurrency`: Trasformazioni in parallelo (default: 3)
//! - `accepted_class`: Classe di file accettati (default: image)
//! - `output_prefix`: Prefisso dei file esportati (default: "compressed")
//! - `tool_name`: Prefisso del nome dell'archivio (default: "media_batch")
//! - `jpeg_quality`: Qualità di ricodifica (1-100, default: 80)
//! - `max_dimension`: Lato massimo in pixel (default: None = nessun resize)
//! - `progress_updates_per_sec`: Tetto aggiornamenti di progresso per item (default: 10)
//! - `max_batch_items` / `max_batch_bytes`: Tetto del batch (default: 500 / 1 GiB)
//! - `output_path`: Directory di export (default: None = directory corrente)
//! - `deadline_secs`: Scadenza del run, poi cancellazione (default: None)
//!
//! ## Validazione:
//! - Controlla che jpeg_quality sia 1-100
//! - Controlla che max_concurrency sia > 0
//! - Controlla che i limiti del batch siano > 0
//! - Controlla che prefisso e nome tool siano nomi di file validi
//!
//! ## Esempio:
//! ```rust,ignore
//! let config = Config {
//!     max_concurrency: 2,
//!     jpeg_quality: 70,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::intake::MediaClass;
use crate::transform::TransformOptions;

/// Configuration for a batch pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of transforms in flight at once
    pub max_concurrency: usize,
    /// Class of files accepted by intake
    pub accepted_class: MediaClass,
    /// Prefix of exported file names
    pub output_prefix: String,
    /// Prefix of the archive file name
    pub tool_name: String,
    /// Re-encode quality (1-100)
    pub jpeg_quality: u8,
    /// Downscale limit in pixels
    pub max_dimension: Option<u32>,
    /// Per-item progress updates per second (0 = unthrottled)
    pub progress_updates_per_sec: u32,
    /// Maximum number of queued items
    pub max_batch_items: usize,
    /// Maximum total size of queued items
    pub max_batch_bytes: u64,
    /// Export directory (None = current directory)
    pub output_path: Option<PathBuf>,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
    /// Cancel the run after this many seconds
    pub deadline_secs: Option<u64>,
    /// Dry run - transform but don't write the export
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            accepted_class: MediaClass::Image,
            output_prefix: "compressed".to_string(),
            tool_name: "media_batch".to_string(),
            jpeg_quality: 80,
            max_dimension: None,
            progress_updates_per_sec: 10,
            max_batch_items: 500,
            max_batch_bytes: 1024 * 1024 * 1024,
            output_path: None,
            json_output: false,
            deadline_secs: None,
            dry_run: false,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(anyhow::anyhow!("JPEG quality must be between 1 and 100"));
        }

        if self.max_concurrency == 0 {
            return Err(anyhow::anyhow!("Concurrency must be greater than 0"));
        }

        if self.max_batch_items == 0 || self.max_batch_bytes == 0 {
            return Err(anyhow::anyhow!("Batch limits must be greater than 0"));
        }

        if self.max_dimension == Some(0) {
            return Err(anyhow::anyhow!("Max dimension must be greater than 0"));
        }

        for (label, value) in [("Output prefix", &self.output_prefix), ("Tool name", &self.tool_name)] {
            if value.contains(['/', '\\']) || value == ".." {
                return Err(anyhow::anyhow!("{} must be a plain file name: {}", label, value));
            }
        }

        if self.tool_name.is_empty() {
            return Err(anyhow::anyhow!("Tool name must not be empty"));
        }

        if let Some(ref output_path) = self.output_path {
            if output_path.exists() && !output_path.is_dir() {
                return Err(anyhow::anyhow!("Output path is not a directory: {}", output_path.display()));
            }
        }

        Ok(())
    }

    /// Engine options derived from this configuration
    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            quality: self.jpeg_quality,
            max_dimension: self.max_dimension,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// Default config file location (`~/.media-batch/config.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".media-batch").join("config.json"))
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.jpeg_quality = 0;
        assert!(config.validate().is_err());

        config.jpeg_quality = 80;
        config.max_concurrency = 0;
        assert!(config.validate().is_err());

        config.max_concurrency = 2;
        config.output_prefix = "../evil".to_string();
        assert!(config.validate().is_err());

        config.output_prefix = String::new();
        assert!(config.validate().is_ok());

        config.max_batch_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.accepted_class, MediaClass::Image);
        assert_eq!(config.output_prefix, "compressed");
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.progress_updates_per_sec, 10);
        assert!(config.deadline().is_none());
        assert!(!config.dry_run);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let original_config = Config {
            max_concurrency: 2,
            accepted_class: MediaClass::Pdf,
            jpeg_quality: 65,
            max_dimension: Some(2048),
            deadline_secs: Some(30),
            ..Default::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config, original_config);
        assert_eq!(loaded_config.deadline(), Some(Duration::from_secs(30)));
        assert_eq!(loaded_config.transform_options().max_dimension, Some(2048));
    }

    #[tokio::test]
    async fn test_partial_config_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{"max_concurrency": 4, "accepted_class": "video"}"#)
            .await
            .unwrap();

        let config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.accepted_class, MediaClass::Video);
        assert_eq!(config.output_prefix, "compressed");
    }

    #[tokio::test]
    async fn test_missing_file_gives_default() {
        let config = Config::from_file(Path::new("/definitely/not/here.json")).await.unwrap();
        assert_eq!(config, Config::default());
    }
}
