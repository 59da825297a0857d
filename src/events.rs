//! # Pipeline Events Module
//!
//! Questo modulo definisce gli eventi strutturati emessi dalla pipeline verso
//! qualsiasi livello di presentazione (progress bar, GUI, processo esterno).
//!
//! ## Responsabilità:
//! - Enum `PipelineEvent` serializzabile (tag `type`) per comunicazione inter-processo
//! - `EventBus` basato su `tokio::sync::broadcast`: più subscriber, nessun blocco
//! - Emissione JSON-lines su stdout per consumatori programmatici
//!
//! ## Tipi di eventi:
//! - `item_added` / `item_rejected` / `item_removed`: intake
//! - `transform_started` / `item_progress`: avanzamento dei singoli item
//! - `item_succeeded` / `item_failed` / `item_cancelled`: esiti terminali
//! - `batch_completed`: fine del run con il riepilogo
//! - `reset`: pipeline svuotata
//!
//! ## Esempio output:
//! ```json
//! {"type":"item_progress","id":"3f2a9c1d0b7e4a55","percent":40.0,"aggregate":20.0}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::aggregator::{BatchSummary, ItemStats};
use crate::error::{IntakeError, TransformError};
use crate::lifecycle::Handle;
use crate::state::ItemId;

/// Structured notification consumed by presentation layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ItemAdded {
        id: ItemId,
        name: String,
        size_bytes: u64,
        preview: Handle,
    },
    ItemRejected {
        reason: IntakeError,
    },
    ItemRemoved {
        id: ItemId,
    },
    TransformStarted {
        id: ItemId,
    },
    ItemProgress {
        id: ItemId,
        percent: f64,
        aggregate: f64,
    },
    ItemSucceeded {
        id: ItemId,
        metrics: ItemStats,
    },
    ItemFailed {
        id: ItemId,
        error: TransformError,
    },
    ItemCancelled {
        id: ItemId,
    },
    BatchCompleted {
        summary: BatchSummary,
    },
    Reset,
}

impl PipelineEvent {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Print the event as one JSON line on stdout
    pub fn emit(&self) {
        if let Some(json) = self.to_json() {
            println!("{}", json);
        }
    }
}

/// Fan-out of pipeline events; sending never blocks and never fails the pipeline
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        trace!(?event, "pipeline event");
        // nessun subscriber non è un errore
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = PipelineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
