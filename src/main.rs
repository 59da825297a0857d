//! # Media Batch - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing` (su stderr)
//! - Caricamento della configurazione da file e override da CLI
//! - Avvio della pipeline, visualizzazione del progresso ed export del risultato
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (input, quality, workers, prefix, etc.)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, `RUST_LOG` se presente)
//! 3. Carica la configurazione e applica gli override
//! 4. Legge i file in input e li passa all'intake
//! 5. Esegue il run con il transform engine di default (Ctrl-C cancella)
//! 6. Esporta il payload nella directory di output e rilascia tutte le risorse
//!
//! ## Esempio di utilizzo:
//! ```bash
//! media-batch photos/ extra.png --quality 70 --workers 4 --output out/ --verbose
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use media_batch_pipeline::file_manager::FileManager;
use media_batch_pipeline::progress::ProgressManager;
use media_batch_pipeline::{
    Config, DirectorySink, ImageReencoder, MediaClass, Pipeline, PipelineError, PipelineEvent,
    RunOptions,
};

#[derive(Parser)]
#[command(name = "media-batch")]
#[command(about = "Transform a batch of media files and export them as one download")]
struct Args {
    /// Files or directories to transform
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// JPEG quality (1-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Number of transforms in flight at once
    #[arg(short, long)]
    workers: Option<usize>,

    /// Prefix of exported file names
    #[arg(long)]
    prefix: Option<String>,

    /// Prefix of the archive name
    #[arg(long)]
    tool_name: Option<String>,

    /// Accepted file class (image, video, audio, pdf, any)
    #[arg(long)]
    accept: Option<MediaClass>,

    /// Downscale images so neither side exceeds this many pixels
    #[arg(long)]
    max_dimension: Option<u32>,

    /// Output directory for the exported payload
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Cancel the run after this many seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Output progress and status as JSON lines for programmatic use
    #[arg(long)]
    json: bool,

    /// Dry run - transform but don't write the export
    #[arg(long)]
    dry_run: bool,

    /// Config file (default: ~/.media-batch/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, mut config: Config) -> (Config, Vec<PathBuf>) {
        if let Some(quality) = self.quality {
            config.jpeg_quality = quality;
        }
        if let Some(workers) = self.workers {
            config.max_concurrency = workers;
        }
        if let Some(prefix) = self.prefix {
            config.output_prefix = prefix;
        }
        if let Some(tool_name) = self.tool_name {
            config.tool_name = tool_name;
        }
        if let Some(accept) = self.accept {
            config.accepted_class = accept;
        }
        if self.max_dimension.is_some() {
            config.max_dimension = self.max_dimension;
        }
        if self.output.is_some() {
            config.output_path = self.output;
        }
        if self.deadline.is_some() {
            config.deadline_secs = self.deadline;
        }
        config.json_output |= self.json;
        config.dry_run |= self.dry_run;
        (config, self.inputs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout resta libero per l'output JSON
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = args.config.clone().or_else(Config::default_path);
    let file_config = match config_path {
        Some(ref path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    let (config, inputs) = args.apply(file_config);
    config.validate()?;

    let spinner = (!config.json_output).then(|| ProgressManager::spinner("Reading input files..."));
    let candidates = FileManager::collect_candidates(&inputs).await?;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let pipeline = Pipeline::new(config.clone())?;
    let printer = {
        let mut events = pipeline.subscribe();
        let json_output = config.json_output;
        let progress = (!json_output).then(ProgressManager::new);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(PipelineEvent::Reset) | Err(RecvError::Closed) => break,
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Display fell behind, {} events skipped", skipped);
                        continue;
                    }
                };
                match &progress {
                    Some(progress) => progress.handle_event(&event),
                    None => event.emit(),
                }
            }
        })
    };

    let report = pipeline.add_files(candidates)?;
    if report.added.is_empty() {
        pipeline.shutdown();
        let _ = printer.await;
        return Err(anyhow::anyhow!("No acceptable {} files in the given inputs", config.accepted_class));
    }

    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling pending transforms");
                pipeline.cancel();
            }
        });
    }

    let outcome = run_and_export(&pipeline, &config).await;
    pipeline.shutdown();
    let _ = printer.await;

    outcome
}

async fn run_and_export(pipeline: &Pipeline, config: &Config) -> Result<()> {
    let summary = pipeline
        .run(Arc::new(ImageReencoder::new()), RunOptions::from(config))
        .await?;

    if config.dry_run {
        info!("Dry run: {} outputs not exported", summary.succeeded);
        return Ok(());
    }

    let dir = config.output_path.clone().unwrap_or_else(|| PathBuf::from("."));
    let sink = DirectorySink::new(dir);
    match pipeline.export_to(&sink).await {
        Ok(path) => {
            info!("Exported {}", path.display());
            Ok(())
        }
        Err(PipelineError::NothingToExport) => {
            warn!("No file was transformed successfully, nothing to export");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
