//! # Pipeline State Module
//!
//! Questo modulo definisce il data model della pipeline e la sua macchina a stati.
//!
//! ## Responsabilità:
//! - `InputItem`: file accettato in intake, con i suoi handle raw e preview
//! - `TransformResult`: stato, progresso, output ed errore di ogni item
//! - `PipelineState`: items ordinati, risultati per id, fase e progresso aggregato
//! - Valida le transizioni di fase
//!
//! ## Macchina a stati:
//! ```text
//! Idle ──add──► Selecting ──run──► Transforming ──tutti terminali──► Completed
//!   ▲               ▲                                                  │
//!   │               └──────────────────────add─────────────────────────┘
//!   └──────────────── reset (da qualsiasi fase) ───────────────────────
//! ```
//!
//! ## Identità degli item:
//! - L'id è derivato da `(name, size_bytes)` con SHA-256 (primi 16 caratteri hex)
//! - Due candidati con stesso nome e dimensione sono lo stesso item

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PipelineError, TransformError};
use crate::lifecycle::Handle;
use crate::transform::TransformMetrics;

/// Deterministic item identity, derived from `(name, size_bytes)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn derive(name: &str, size_bytes: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(size_bytes.to_string().as_bytes());
        Self(hex::encode(hasher.finalize())[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file accepted by intake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    pub id: ItemId,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub raw_handle: Handle,
    pub preview_handle: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransformStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Per-item outcome, written only by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformResult {
    pub item_id: ItemId,
    pub status: TransformStatus,
    pub output_handle: Option<Handle>,
    pub output_size_bytes: Option<u64>,
    pub progress_percent: f64,
    pub error: Option<TransformError>,
    pub metrics: Option<TransformMetrics>,
}

impl TransformResult {
    pub fn pending(item_id: ItemId) -> Self {
        Self {
            item_id,
            status: TransformStatus::Pending,
            output_handle: None,
            output_size_bytes: None,
            progress_percent: 0.0,
            error: None,
            metrics: None,
        }
    }

    /// Set progress, never moving backwards
    pub fn advance(&mut self, percent: f64) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.progress_percent {
            self.progress_percent = percent;
            true
        } else {
            false
        }
    }

    /// Move to a terminal status; terminal items count as fully progressed
    pub fn settle(&mut self, status: TransformStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.progress_percent = 100.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Selecting,
    Transforming,
    Completed,
}

impl Phase {
    fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Selecting)
                | (Selecting, Transforming)
                | (Transforming, Completed)
                | (Completed, Selecting)
                | (_, Idle)
        )
    }
}

/// Complete pipeline state; cloned to produce read-only snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub items: Vec<InputItem>,
    pub results: HashMap<ItemId, TransformResult>,
    pub phase: Phase,
    pub aggregate_progress: f64,
    /// Run generation, bumped by every reset so late worker results can be recognised
    pub epoch: u64,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            results: HashMap::new(),
            phase: Phase::Idle,
            aggregate_progress: 0.0,
            epoch: 0,
        }
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.results.contains_key(id)
    }

    pub fn item(&self, id: &ItemId) -> Option<&InputItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    pub fn result(&self, id: &ItemId) -> Option<&TransformResult> {
        self.results.get(id)
    }

    pub fn result_mut(&mut self, id: &ItemId) -> Option<&mut TransformResult> {
        self.results.get_mut(id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.size_bytes).sum()
    }

    /// Validated phase change
    pub fn transition(&mut self, next: Phase) -> Result<(), PipelineError> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(PipelineError::InvalidPhase {
                operation: match next {
                    Phase::Idle => "reset",
                    Phase::Selecting => "add files",
                    Phase::Transforming => "run",
                    Phase::Completed => "complete",
                },
                phase: self.phase,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn all_terminal(&self) -> bool {
        self.results.values().all(|r| r.status.is_terminal())
    }

    /// Ids of items still waiting to be transformed, in submission order
    pub fn pending_ids(&self) -> Vec<ItemId> {
        self.items
            .iter()
            .filter(|item| {
                self.results
                    .get(&item.id)
                    .is_some_and(|r| r.status == TransformStatus::Pending)
            })
            .map(|item| item.id.clone())
            .collect()
    }

    /// Mean of all items' progress. While transforming the value only grows,
    /// even if an item leaves the batch mid-run.
    pub fn recompute_progress(&mut self) -> f64 {
        let mean = if self.results.is_empty() {
            0.0
        } else {
            self.results.values().map(|r| r.progress_percent).sum::<f64>() / self.results.len() as f64
        };
        self.aggregate_progress = if self.phase == Phase::Transforming {
            mean.max(self.aggregate_progress)
        } else {
            mean
        };
        self.aggregate_progress
    }

    pub fn count(&self, status: TransformStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }
}
