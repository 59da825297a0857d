//! # Orchestrator Module
//!
//! Modulo che separa le responsabilità dell'orchestratore in sottomoduli:
//! - `pipeline`: Facciata della pipeline e scheduling del batch
//! - `worker`: Worker per singoli item
//! - `progress_tracker`: Callback di progresso con coalescing

pub mod pipeline;
pub mod progress_tracker;
pub(crate) mod worker;

pub use pipeline::{Pipeline, RunOptions};
pub use progress_tracker::{ProgressSink, ProgressThrottle};
