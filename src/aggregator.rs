//! # Result Aggregation Module
//!
//! Questo modulo calcola le statistiche per-item e di batch dai risultati dell'orchestratore.
//!
//! ## Responsabilità:
//! - `savings_percent` per ogni item riuscito, arrotondato a un decimale
//! - Totali di batch (byte originali e di output dei soli item riusciti)
//! - Conteggio degli item per stato
//! - Riepilogo testuale per la CLI
//!
//! ## Consistenza:
//! Il summary viene calcolato sotto il lock dello stato, quindi riflette sempre
//! l'ultimo aggiornamento completo (nessuna lettura parziale).
//!
//! ## Esempio:
//! ```rust,ignore
//! let summary = ResultAggregator::summarize(&state);
//! info!("{}", summary.format_summary());
//! ```

use serde::{Deserialize, Serialize};

use crate::file_manager::FileManager;
use crate::state::{ItemId, PipelineState, TransformStatus};

/// Round to one decimal place
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Percentage saved going from `original` to `output` bytes
pub fn savings_percent(original: u64, output: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        round1(FileManager::calculate_reduction(original, output))
    }
}

/// Statistics for one succeeded item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStats {
    pub id: ItemId,
    pub name: String,
    pub original_size: u64,
    pub output_size: u64,
    pub savings_percent: f64,
    pub elapsed_ms: u64,
}

/// Batch-level statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub items: Vec<ItemStats>,
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub pending: usize,
    pub total_original_bytes: u64,
    pub total_output_bytes: u64,
    pub bytes_saved: u64,
    pub savings_percent: f64,
}

impl BatchSummary {
    pub fn format_summary(&self) -> String {
        format!(
            "Items: {} | Succeeded: {} | Failed: {} | Cancelled: {} | {} -> {} (saved {}, {:.1}%)",
            self.total_items,
            self.succeeded,
            self.failed,
            self.cancelled,
            FileManager::format_size(self.total_original_bytes),
            FileManager::format_size(self.total_output_bytes),
            FileManager::format_size(self.bytes_saved),
            self.savings_percent
        )
    }
}

/// Computes statistics from pipeline state
pub struct ResultAggregator;

impl ResultAggregator {
    /// Stats for one item, `None` unless it succeeded
    pub fn item_stats(state: &PipelineState, id: &ItemId) -> Option<ItemStats> {
        let item = state.item(id)?;
        let result = state.result(id)?;
        if result.status != TransformStatus::Succeeded {
            return None;
        }
        let output_size = result.output_size_bytes?;

        Some(ItemStats {
            id: id.clone(),
            name: item.name.clone(),
            original_size: item.size_bytes,
            output_size,
            savings_percent: savings_percent(item.size_bytes, output_size),
            elapsed_ms: result.metrics.as_ref().map(|m| m.elapsed_ms).unwrap_or_default(),
        })
    }

    pub fn summarize(state: &PipelineState) -> BatchSummary {
        let items: Vec<ItemStats> = state
            .items
            .iter()
            .filter_map(|item| Self::item_stats(state, &item.id))
            .collect();

        let total_original_bytes: u64 = items.iter().map(|s| s.original_size).sum();
        let total_output_bytes: u64 = items.iter().map(|s| s.output_size).sum();

        BatchSummary {
            total_items: state.items.len(),
            succeeded: state.count(TransformStatus::Succeeded),
            failed: state.count(TransformStatus::Failed),
            cancelled: state.count(TransformStatus::Cancelled),
            pending: state.count(TransformStatus::Pending) + state.count(TransformStatus::Running),
            bytes_saved: total_original_bytes.saturating_sub(total_output_bytes),
            savings_percent: savings_percent(total_original_bytes, total_output_bytes),
            total_original_bytes,
            total_output_bytes,
            items,
        }
    }
}
