//! # Media Batch Pipeline Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare della pipeline
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `lifecycle`: Registry degli handle revocabili (raw, preview, output)
//! - `intake`: Validazione, deduplicazione e tetto del batch
//! - `state`: Item, risultati, fasi della pipeline
//! - `transform`: Trait del transform engine e ricodifica immagini di default
//! - `orchestrator`: Run concorrente, progresso, cancellazione
//! - `aggregator`: Statistiche per item e di batch
//! - `exporter`: Payload singolo o archivio ZIP
//! - `events`: Eventi strutturati per i livelli di presentazione
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore custom per diverse operazioni
//! - `file_manager`: Discovery dei file e utility
//! - `progress`: Progress bar per la CLI
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use media_batch_pipeline::{Config, ImageReencoder, Pipeline, RunOptions};
//!
//! let pipeline = Pipeline::new(Config::default())?;
//! pipeline.add_files(candidates)?;
//! let summary = pipeline.run(Arc::new(ImageReencoder::new()), RunOptions::default()).await?;
//! ```

pub mod aggregator;
pub mod config;
pub mod error;
pub mod events;
pub mod exporter;
pub mod file_manager;
pub mod intake;
pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod state;
pub mod transform;

pub use aggregator::{BatchSummary, ItemStats, ResultAggregator};
pub use config::Config;
pub use error::{IntakeError, PipelineError, TransformError};
pub use events::{EventBus, PipelineEvent};
pub use exporter::{ArchiveExporter, DirectorySink, DownloadSink, ExportPayload};
pub use intake::{Candidate, IntakeReport, MediaClass};
pub use lifecycle::{Handle, HandleKind, ReleaseOutcome, ResourceRegistry};
pub use orchestrator::{Pipeline, ProgressSink, RunOptions};
pub use state::{ItemId, Phase, PipelineState, TransformStatus};
pub use transform::{from_fn, ImageReencoder, TransformEngine, TransformOptions, TransformOutput};
