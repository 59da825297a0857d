//! # Progress Display Module
//!
//! Questo modulo mostra l'avanzamento della pipeline sul terminale.
//!
//! ## Responsabilità:
//! - Progress bar visuale con `indicatif` per feedback real-time
//! - Posizione della barra = progresso aggregato del batch (0-100)
//! - Messaggi di stato per ogni item terminato
//! - Spinner per operazioni indeterminate (discovery, export)
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:00:12] [███████████████████████>----------------] 58% ✅ photo.jpg: 45.2% saved
//! ```
//!
//! ## Esempio:
//! ```rust,ignore
//! let progress = ProgressManager::new();
//! while let Ok(event) = events.recv().await {
//!     progress.handle_event(&event);
//! }
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::events::PipelineEvent;

/// Terminal progress bar driven by pipeline events
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(100))
    }

    /// Manager over an existing bar (hidden bars for tests)
    pub fn with_bar(bar: ProgressBar) -> Self {
        bar.set_length(100);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Move the bar to the aggregate percentage
    pub fn set_aggregate(&self, percent: f64) {
        self.bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Update the display from one pipeline event
    pub fn handle_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::ItemProgress { aggregate, .. } => self.set_aggregate(*aggregate),
            PipelineEvent::ItemSucceeded { metrics, .. } => {
                self.set_message(&format!("✅ {}: {:.1}% saved", metrics.name, metrics.savings_percent));
            }
            PipelineEvent::ItemFailed { id, error } => {
                self.set_message(&format!("❌ {}: {}", id, error));
            }
            PipelineEvent::ItemCancelled { id } => self.set_message(&format!("⏹ {} cancelled", id)),
            PipelineEvent::BatchCompleted { summary } => {
                self.set_aggregate(100.0);
                self.finish(&summary.format_summary());
            }
            PipelineEvent::Reset => self.bar.reset(),
            _ => {}
        }
    }

    /// Create a spinner for indeterminate progress
    pub fn spinner(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();

        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));

        spinner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BatchSummary;
    use crate::state::ItemId;

    #[test]
    fn test_bar_follows_aggregate() {
        let progress = ProgressManager::with_bar(ProgressBar::hidden());
        progress.handle_event(&PipelineEvent::ItemProgress {
            id: ItemId::derive("a.png", 1),
            percent: 50.0,
            aggregate: 24.6,
        });
        assert_eq!(progress.position(), 25);

        progress.set_aggregate(250.0);
        assert_eq!(progress.position(), 100);

        progress.handle_event(&PipelineEvent::Reset);
        assert_eq!(progress.position(), 0);
    }

    #[test]
    fn test_batch_completed_fills_bar() {
        let progress = ProgressManager::with_bar(ProgressBar::hidden());
        progress.handle_event(&PipelineEvent::BatchCompleted {
            summary: BatchSummary::default(),
        });
        assert_eq!(progress.position(), 100);
    }
}
