//! # Progress Tracking Module
//!
//! Callback di progresso consegnato al transform engine.
//! Coalesce gli aggiornamenti (al massimo N al secondo per item) e li inoltra
//! al collector dell'orchestratore tramite il canale dei worker.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use crate::orchestrator::worker::WorkerEvent;
use crate::state::ItemId;

/// Rate limiter for one item's progress updates
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last_sent: Option<Instant>,
    last_percent: f64,
}

impl ProgressThrottle {
    /// `updates_per_sec == 0` disables coalescing
    pub fn new(updates_per_sec: u32) -> Self {
        let min_interval = if updates_per_sec == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / updates_per_sec
        };
        Self {
            min_interval,
            last_sent: None,
            last_percent: 0.0,
        }
    }

    /// Whether an update should be forwarded. Backwards moves are always dropped,
    /// 100% always passes.
    pub fn admit(&mut self, percent: f64, now: Instant) -> bool {
        if percent <= self.last_percent {
            return false;
        }
        let due = match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if due || percent >= 100.0 {
            self.last_sent = Some(now);
            self.last_percent = percent;
            true
        } else {
            false
        }
    }
}

struct SinkInner {
    item_id: ItemId,
    epoch: u64,
    /// The worker owns the sender; the sink stops reporting once the item settles
    tx: Option<Weak<UnboundedSender<WorkerEvent>>>,
    throttle: Mutex<ProgressThrottle>,
}

/// `onProgress` callback for one item
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

impl ProgressSink {
    pub(crate) fn new(
        item_id: ItemId,
        epoch: u64,
        tx: Weak<UnboundedSender<WorkerEvent>>,
        updates_per_sec: u32,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                item_id,
                epoch,
                tx: Some(tx),
                throttle: Mutex::new(ProgressThrottle::new(updates_per_sec)),
            }),
        }
    }

    /// Sink that goes nowhere, for running an engine outside a pipeline
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(SinkInner {
                item_id: ItemId::derive("", 0),
                epoch: 0,
                tx: None,
                throttle: Mutex::new(ProgressThrottle::new(0)),
            }),
        }
    }

    pub fn item_id(&self) -> &ItemId {
        &self.inner.item_id
    }

    /// Report progress in percent (clamped to 0..=100)
    pub fn report(&self, percent: f64) {
        let Some(tx) = self.inner.tx.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };

        let admitted = self
            .inner
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(percent, Instant::now());

        if admitted {
            // il collector potrebbe essere già chiuso dopo un reset
            let _ = tx.send(WorkerEvent::Progress {
                item_id: self.inner.item_id.clone(),
                epoch: self.inner.epoch,
                percent,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_throttle_coalesces_bursts() {
        let mut throttle = ProgressThrottle::new(10);
        let start = Instant::now();

        assert!(throttle.admit(10.0, start));
        assert!(!throttle.admit(20.0, start + Duration::from_millis(20)));
        assert!(!throttle.admit(30.0, start + Duration::from_millis(50)));
        assert!(throttle.admit(40.0, start + Duration::from_millis(100)));
        // il completamento passa sempre
        assert!(throttle.admit(100.0, start + Duration::from_millis(101)));
    }

    #[test]
    fn test_throttle_drops_regressions() {
        let mut throttle = ProgressThrottle::new(0);
        let now = Instant::now();
        assert!(throttle.admit(50.0, now));
        assert!(!throttle.admit(50.0, now));
        assert!(!throttle.admit(10.0, now));
        assert!(throttle.admit(60.0, now));
    }

    #[test]
    fn test_sink_forwards_admitted_updates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ItemId::derive("a.png", 1);
        let tx = Arc::new(tx);
        let sink = ProgressSink::new(id.clone(), 3, Arc::downgrade(&tx), 0);

        sink.report(25.0);
        sink.report(10.0);
        sink.report(f64::NAN);
        sink.report(400.0);

        let mut seen = Vec::new();
        while let Ok(WorkerEvent::Progress { item_id, epoch, percent }) = rx.try_recv() {
            assert_eq!(item_id, id);
            assert_eq!(epoch, 3);
            seen.push(percent);
        }
        assert_eq!(seen, vec![25.0, 100.0]);
    }

    #[test]
    fn test_sink_goes_quiet_once_sender_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx = Arc::new(tx);
        let sink = ProgressSink::new(ItemId::derive("a.png", 1), 0, Arc::downgrade(&tx), 0);
        let kept = sink.clone();

        sink.report(10.0);
        drop(tx);
        kept.report(90.0);

        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Progress { percent, .. }) if percent == 10.0));
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_detached_sink_is_noop() {
        ProgressSink::detached().report(50.0);
    }
}
