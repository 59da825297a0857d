//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom della pipeline.
//!
//! ## Responsabilità:
//! - Definisce `PipelineError` per le operazioni batch (run, export, fasi)
//! - Definisce `IntakeError` per i rifiuti non fatali dei singoli candidati
//! - Definisce `TransformError` per i fallimenti per-item del transform engine
//! - Integra con `thiserror` per automatic error conversion
//!
//! ## Categorie di errori:
//! - `IntakeError`: tipo non accettato, duplicato, limite batch superato
//! - `TransformError`: catturato nel `TransformResult` dell'item, mai propagato
//! - `ArchiveBuildFailure`: fallisce solo lo step di export
//! - `ResourceRevoked`: accesso a un handle già rilasciato
//! - `InvalidPhase`: operazione non permessa nella fase corrente
//!
//! ## Esempio:
//! ```rust,ignore
//! if state.phase == Phase::Transforming {
//!     return Err(PipelineError::InvalidPhase { operation: "add files", phase: state.phase });
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::intake::MediaClass;
use crate::lifecycle::HandleId;
use crate::state::Phase;

/// Errors surfaced by batch-level pipeline operations
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Transform failed: {0}")]
    TransformFailure(#[from] TransformError),

    #[error("Archive build failed: {0}")]
    ArchiveBuildFailure(String),

    #[error("Nothing to export: no item has succeeded")]
    NothingToExport,

    #[error("Resource handle {0} has already been revoked")]
    ResourceRevoked(HandleId),

    #[error("Cannot {operation} while pipeline is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    #[error("Run interrupted by pipeline reset")]
    RunInterrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Per-candidate rejection reasons reported by intake
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntakeError {
    #[error("{name}: type '{mime_type}' is not accepted (expected {expected})")]
    InvalidInputType {
        name: String,
        mime_type: String,
        expected: MediaClass,
    },

    #[error("{name}: already queued")]
    DuplicateInput { name: String },

    #[error("{name}: batch limit exceeded ({limit})")]
    BatchLimitExceeded { name: String, limit: String },
}

impl IntakeError {
    /// Duplicates are skipped silently, everything else is worth telling the user about
    pub fn is_silent(&self) -> bool {
        matches!(self, IntakeError::DuplicateInput { .. })
    }
}

/// Failure of a single item's transform
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TransformError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("transform panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl From<image::ImageError> for TransformError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => TransformError::UnsupportedFormat(e.to_string()),
            image::ImageError::Decoding(e) => TransformError::Decode(e.to_string()),
            image::ImageError::Encoding(e) => TransformError::Encode(e.to_string()),
            other => TransformError::Other(other.to_string()),
        }
    }
}
