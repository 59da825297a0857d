//! # Intake & Deduplication Module
//!
//! Questo modulo valida e deduplica i file in ingresso prima che entrino nella pipeline.
//!
//! ## Responsabilità:
//! - Rifiuta i candidati il cui tipo non appartiene alla classe accettata
//! - Deduplica per `(name, size_bytes)`: un duplicato viene saltato in silenzio
//! - Applica il tetto del batch (numero di item e byte totali)
//! - Crea `InputItem` con handle raw e preview tramite il `ResourceRegistry`
//! - Rimozione idempotente e reset con rilascio di tutti gli handle
//!
//! ## Regole di fase:
//! - `Idle`/`Completed` → `Selecting` quando almeno un item viene aggiunto
//! - Aggiungere file durante `Transforming` è un errore
//!
//! ## Esempio:
//! ```rust,ignore
//! let intake = IntakeManager::new(MediaClass::Image, 500, 1 << 30);
//! let report = intake.add_files(&mut state, &registry, candidates)?;
//! for rejection in &report.rejected {
//!     warn!("{}", rejection);
//! }
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::error::{IntakeError, PipelineError};
use crate::file_manager::FileManager;
use crate::lifecycle::{HandleKind, ResourceRegistry};
use crate::state::{InputItem, ItemId, Phase, PipelineState, TransformResult};

/// Class of files a pipeline accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaClass {
    Image,
    Video,
    Audio,
    Pdf,
    Any,
}

impl MediaClass {
    /// Check a declared MIME type against this class
    pub fn accepts(&self, mime_type: &str) -> bool {
        let mime = mime_type.trim().to_ascii_lowercase();
        match self {
            Self::Image => mime.starts_with("image/"),
            Self::Video => mime.starts_with("video/"),
            Self::Audio => mime.starts_with("audio/"),
            Self::Pdf => mime == "application/pdf",
            Self::Any => true,
        }
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Pdf => "pdf",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

impl FromStr for MediaClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "video" | "videos" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "pdf" => Ok(Self::Pdf),
            "any" | "*" => Ok(Self::Any),
            _ => Err(anyhow::anyhow!("Unsupported media class: {}", s)),
        }
    }
}

/// A file offered to the pipeline by an intake source
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl Candidate {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            name: name.into(),
            size_bytes: bytes.len() as u64,
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Declared MIME type, or one guessed from the file extension when empty
    pub fn effective_mime(&self) -> &str {
        if self.mime_type.trim().is_empty() {
            FileManager::guess_mime(&self.name)
        } else {
            &self.mime_type
        }
    }
}

/// Outcome of one `add_files` call
#[derive(Debug, Default)]
pub struct IntakeReport {
    pub added: Vec<InputItem>,
    pub rejected: Vec<IntakeError>,
}

impl IntakeReport {
    /// Rejections worth surfacing (duplicates are skipped silently)
    pub fn reported(&self) -> impl Iterator<Item = &IntakeError> {
        self.rejected.iter().filter(|r| !r.is_silent())
    }
}

/// Validates, deduplicates and registers incoming candidates
#[derive(Debug, Clone)]
pub struct IntakeManager {
    accepted: MediaClass,
    max_items: usize,
    max_bytes: u64,
}

impl IntakeManager {
    pub fn new(accepted: MediaClass, max_items: usize, max_bytes: u64) -> Self {
        Self {
            accepted,
            max_items,
            max_bytes,
        }
    }

    pub fn accepted(&self) -> MediaClass {
        self.accepted
    }

    /// Validate and register candidates
    pub fn add_files(
        &self,
        state: &mut PipelineState,
        registry: &ResourceRegistry,
        candidates: Vec<Candidate>,
    ) -> Result<IntakeReport, PipelineError> {
        if state.phase == Phase::Transforming {
            return Err(PipelineError::InvalidPhase {
                operation: "add files",
                phase: state.phase,
            });
        }

        let mut report = IntakeReport::default();
        let mut item_count = state.items.len();
        let mut total_bytes = state.total_bytes();
        let mut seen: HashSet<ItemId> = HashSet::new();

        for candidate in candidates {
            let mime_type = candidate.effective_mime().to_string();
            if !self.accepted.accepts(&mime_type) {
                debug!("Rejecting {}: {} is not {}", candidate.name, mime_type, self.accepted);
                report.rejected.push(IntakeError::InvalidInputType {
                    name: candidate.name,
                    mime_type,
                    expected: self.accepted,
                });
                continue;
            }

            let id = ItemId::derive(&candidate.name, candidate.size_bytes);
            if state.contains(&id) || !seen.insert(id.clone()) {
                debug!("Skipping duplicate {} ({} bytes)", candidate.name, candidate.size_bytes);
                report.rejected.push(IntakeError::DuplicateInput { name: candidate.name });
                continue;
            }

            if item_count + 1 > self.max_items {
                seen.remove(&id);
                report.rejected.push(IntakeError::BatchLimitExceeded {
                    name: candidate.name,
                    limit: format!("max {} items", self.max_items),
                });
                continue;
            }
            if total_bytes.saturating_add(candidate.size_bytes) > self.max_bytes {
                seen.remove(&id);
                report.rejected.push(IntakeError::BatchLimitExceeded {
                    name: candidate.name,
                    limit: format!("max {}", FileManager::format_size(self.max_bytes)),
                });
                continue;
            }

            let raw_handle = registry.acquire(HandleKind::Raw, candidate.bytes.clone());
            let preview_handle = registry.acquire(HandleKind::Preview, candidate.bytes);
            let item = InputItem {
                id: id.clone(),
                name: candidate.name,
                size_bytes: candidate.size_bytes,
                mime_type,
                raw_handle,
                preview_handle,
            };

            item_count += 1;
            total_bytes += item.size_bytes;
            state.results.insert(id.clone(), TransformResult::pending(id));
            state.items.push(item.clone());
            report.added.push(item);
        }

        if !report.added.is_empty() {
            state.transition(Phase::Selecting)?;
            state.recompute_progress();
            info!("Queued {} new files ({} total)", report.added.len(), state.items.len());
        }

        for rejection in report.reported() {
            warn!("Rejected: {}", rejection);
        }

        Ok(report)
    }

    /// Idempotent removal of one item and all of its handles
    pub fn remove_item(
        &self,
        state: &mut PipelineState,
        registry: &ResourceRegistry,
        id: &ItemId,
    ) -> Option<InputItem> {
        let position = state.items.iter().position(|item| &item.id == id)?;
        let item = state.items.remove(position);
        if let Some(result) = state.results.remove(id) {
            if let Some(output) = result.output_handle {
                registry.release(output);
            }
        }
        registry.release(item.raw_handle);
        registry.release(item.preview_handle);
        state.recompute_progress();

        debug!("Removed {} ({})", item.name, item.id);
        Some(item)
    }

    /// Drop every item and release every handle
    pub fn reset(&self, state: &mut PipelineState, registry: &ResourceRegistry) -> usize {
        let removed = state.items.len();
        state.items.clear();
        state.results.clear();
        state.aggregate_progress = 0.0;
        state.phase = Phase::Idle;
        state.epoch += 1;

        let released = registry.release_all();
        debug!("Reset: removed {} items, released {} handles", removed, released);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TransformStatus;

    fn png(name: &str, size: usize) -> Candidate {
        Candidate::new(name, "image/png", vec![0u8; size])
    }

    fn intake() -> IntakeManager {
        IntakeManager::new(MediaClass::Image, 10, 1_000_000)
    }

    #[test]
    fn test_duplicate_yields_single_item() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();

        let report = intake()
            .add_files(&mut state, &registry, vec![png("a.png", 10), png("a.png", 10)])
            .unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.rejected, vec![IntakeError::DuplicateInput { name: "a.png".into() }]);
        assert_eq!(report.reported().count(), 0);

        let again = intake().add_files(&mut state, &registry, vec![png("a.png", 10)]).unwrap();
        assert!(again.added.is_empty());
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.phase, Phase::Selecting);
    }

    #[test]
    fn test_same_name_different_size_is_new() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        let report = intake()
            .add_files(&mut state, &registry, vec![png("a.png", 10), png("a.png", 11)])
            .unwrap();
        assert_eq!(report.added.len(), 2);
    }

    #[test]
    fn test_invalid_type_is_reported() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        let report = intake()
            .add_files(
                &mut state,
                &registry,
                vec![Candidate::new("notes.txt", "text/plain", "hello"), png("b.png", 4)],
            )
            .unwrap();

        assert_eq!(report.added.len(), 1);
        assert!(matches!(
            &report.rejected[..],
            [IntakeError::InvalidInputType { name, expected: MediaClass::Image, .. }] if name == "notes.txt"
        ));
        assert_eq!(registry.outstanding(), 2);
    }

    #[test]
    fn test_mime_guessed_from_extension_when_missing() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        let report = intake()
            .add_files(
                &mut state,
                &registry,
                vec![Candidate::new("photo.JPG", "", vec![1u8; 3]), Candidate::new("clip.mp4", "", vec![1u8; 3])],
            )
            .unwrap();

        assert_eq!(report.added.len(), 1);
        assert_eq!(report.added[0].mime_type, "image/jpeg");
        assert_eq!(report.rejected.len(), 1);
    }

    #[test]
    fn test_batch_limits() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        let limited = IntakeManager::new(MediaClass::Image, 2, 100);

        let report = limited
            .add_files(
                &mut state,
                &registry,
                vec![png("a.png", 60), png("b.png", 50), png("c.png", 10), png("d.png", 10)],
            )
            .unwrap();

        let added: Vec<_> = report.added.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(added, vec!["a.png", "c.png"]);
        assert_eq!(report.reported().count(), 2);
        assert!(report
            .rejected
            .iter()
            .all(|r| matches!(r, IntakeError::BatchLimitExceeded { .. })));
    }

    #[test]
    fn test_add_during_transform_is_rejected() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        intake().add_files(&mut state, &registry, vec![png("a.png", 1)]).unwrap();
        state.transition(Phase::Transforming).unwrap();

        let err = intake().add_files(&mut state, &registry, vec![png("b.png", 1)]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidPhase { phase: Phase::Transforming, .. }));
        assert_eq!(state.items.len(), 1);
    }

    #[test]
    fn test_add_after_completion_reopens_selection() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        intake().add_files(&mut state, &registry, vec![png("a.png", 1)]).unwrap();
        state.transition(Phase::Transforming).unwrap();
        let id = state.items[0].id.clone();
        state.result_mut(&id).unwrap().settle(TransformStatus::Succeeded);
        state.transition(Phase::Completed).unwrap();

        intake().add_files(&mut state, &registry, vec![png("b.png", 1)]).unwrap();
        assert_eq!(state.phase, Phase::Selecting);
        assert_eq!(state.pending_ids().len(), 1);
    }

    #[test]
    fn test_remove_then_readd_is_accepted() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        let report = intake().add_files(&mut state, &registry, vec![png("a.png", 10)]).unwrap();
        let id = report.added[0].id.clone();

        let removed = intake().remove_item(&mut state, &registry, &id).unwrap();
        assert!(!registry.is_live(removed.raw_handle));
        assert!(intake().remove_item(&mut state, &registry, &id).is_none());

        let again = intake().add_files(&mut state, &registry, vec![png("a.png", 10)]).unwrap();
        assert_eq!(again.added.len(), 1);
        assert_eq!(again.added[0].id, id);
    }

    #[test]
    fn test_reset_releases_everything() {
        let registry = ResourceRegistry::new();
        let mut state = PipelineState::new();
        intake()
            .add_files(&mut state, &registry, vec![png("a.png", 1), png("b.png", 2)])
            .unwrap();
        let epoch = state.epoch;

        assert_eq!(intake().reset(&mut state, &registry), 2);
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.items.is_empty() && state.results.is_empty());
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(state.epoch, epoch + 1);
    }
}
