//! # Transform Worker Module
//!
//! Worker per la trasformazione di un singolo item.
//! Separato dall'orchestratore: riceve i byte già risolti e il permesso del
//! semaforo, invoca il transform engine e riporta tutto sul canale del collector.

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::TransformError;
use crate::orchestrator::progress_tracker::ProgressSink;
use crate::state::ItemId;
use crate::transform::{TransformEngine, TransformOptions, TransformOutput};

/// Messages from workers to the orchestrator's collector
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Progress {
        item_id: ItemId,
        epoch: u64,
        percent: f64,
    },
    Finished {
        item_id: ItemId,
        epoch: u64,
        result: Result<TransformOutput, TransformError>,
        elapsed: Duration,
    },
}

/// Everything a worker needs for one item
pub(crate) struct TransformJob {
    pub item_id: ItemId,
    pub epoch: u64,
    pub input: Bytes,
    pub options: TransformOptions,
}

/// Run one transform on its own task; the permit is held until the engine settles
pub(crate) fn spawn_transform(
    engine: Arc<dyn TransformEngine>,
    job: TransformJob,
    permit: OwnedSemaphorePermit,
    tx: UnboundedSender<WorkerEvent>,
    updates_per_sec: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _permit = permit;
        let TransformJob {
            item_id,
            epoch,
            input,
            options,
        } = job;

        // il sink tiene solo un riferimento debole: il canale si chiude con il worker
        let tx = Arc::new(tx);
        let sink = ProgressSink::new(item_id.clone(), epoch, Arc::downgrade(&tx), updates_per_sec);
        let started = Instant::now();

        let result = match AssertUnwindSafe(engine.transform(input, options, sink)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload);
                error!("Transform engine '{}' panicked on {}: {}", engine.name(), item_id, message);
                Err(TransformError::Panicked(message))
            }
        };

        let elapsed = started.elapsed();
        debug!("Worker for {} settled after {:?}", item_id, elapsed);

        // il collector può essere già chiuso se la pipeline è stata resettata
        let _ = tx.send(WorkerEvent::Finished {
            item_id,
            epoch,
            result,
            elapsed,
        });
    })
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::from_fn;
    use tokio::sync::{mpsc, Semaphore};

    async fn run_one(engine: Arc<dyn TransformEngine>) -> Vec<WorkerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let job = TransformJob {
            item_id: ItemId::derive("a.png", 4),
            epoch: 7,
            input: Bytes::from_static(b"abcd"),
            options: TransformOptions::default(),
        };

        spawn_transform(engine, job, permit, tx, 0).await.unwrap();
        assert_eq!(semaphore.available_permits(), 1);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_worker_reports_progress_then_result() {
        let engine = Arc::new(from_fn("copy", |input: Bytes, _options, progress: ProgressSink| async move {
            progress.report(50.0);
            Ok(TransformOutput::new(input))
        }));

        let events = run_one(engine).await;
        assert!(matches!(events[0], WorkerEvent::Progress { percent, epoch: 7, .. } if percent == 50.0));
        assert!(matches!(&events[1], WorkerEvent::Finished { result: Ok(out), .. } if out.bytes.len() == 4));
    }

    #[tokio::test]
    async fn test_sink_kept_by_engine_does_not_hold_channel() {
        let engine = Arc::new(from_fn("leaky", |input: Bytes, _options, progress: ProgressSink| async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                progress.report(99.0);
            });
            Ok(TransformOutput::new(input))
        }));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let job = TransformJob {
            item_id: ItemId::derive("a.png", 4),
            epoch: 0,
            input: Bytes::from_static(b"abcd"),
            options: TransformOptions::default(),
        };
        spawn_transform(engine, job, permit, tx, 0).await.unwrap();

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Finished { result: Ok(_), .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_worker_catches_panics() {
        let engine = Arc::new(from_fn("boom", |_input: Bytes, _options, _progress| async move {
            if true {
                panic!("codec exploded");
            }
            Ok(TransformOutput::new(Bytes::new()))
        }));

        let events = run_one(engine).await;
        assert!(matches!(
            &events[..],
            [WorkerEvent::Finished { result: Err(TransformError::Panicked(msg)), .. }] if msg == "codec exploded"
        ));
    }
}
