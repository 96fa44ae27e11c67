use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};

use pagetally_core::error::IngestError;
use pagetally_core::event::IngestEvent;

/// Bounded ingestion queue with a single consumer.
///
/// Producers block while the queue is full. Once [`Dispatcher::close`] has
/// been called every submission fails with [`IngestError::ShuttingDown`].
pub struct Dispatcher {
    tx: mpsc::Sender<IngestEvent>,
    rx: Mutex<Option<mpsc::Receiver<IngestEvent>>>,
    shutdown: watch::Sender<bool>,
    requests: AtomicU64,
    capacity: usize,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown,
            requests: AtomicU64::new(0),
            capacity,
        }
    }

    pub async fn submit(&self, event: IngestEvent) -> Result<(), IngestError> {
        if self.is_closed() {
            return Err(IngestError::ShuttingDown);
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| IngestError::ShuttingDown)?;
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The receiving half, handed out once to the consumer loop.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<IngestEvent>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Stop accepting events and signal every background loop to finish.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Events accepted since startup.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }
}

/// Resolve once shutdown has been signalled (or the signal is gone).
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
