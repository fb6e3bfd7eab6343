//! Photos Backup - Progress Reporting
//!
//! Single-producer, single-consumer push channel. The producing operation
//! owns a `ProgressRecord`; the consumer holds a `ProgressStream` that yields
//! updates in order and ends with the operation's result. Throttling is the
//! consumer's business.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;

use crate::error::{BackupError, BackupResult};
use crate::operation::CancellationToken;

/// One `(processed, total, label)` emission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    pub operation: String,
    /// Non-fatal errors accumulated so far
    pub error_count: usize,
}

/// Progress state for a single operation
pub struct ProgressRecord {
    total: usize,
    processed: usize,
    operation: String,
    errors: Vec<String>,
    subscriber: Box<dyn FnMut(&ProgressUpdate) + Send>,
}

impl ProgressRecord {
    /// Record that pushes every update to `subscriber`
    pub fn new<F>(subscriber: F) -> Self
    where
        F: FnMut(&ProgressUpdate) + Send + 'static,
    {
        Self {
            total: 0,
            processed: 0,
            operation: String::new(),
            errors: Vec::new(),
            subscriber: Box::new(subscriber),
        }
    }

    /// Record nobody listens to
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    /// Record feeding a progress channel
    pub fn for_sender<T: Send + 'static>(sender: ProgressSender<T>) -> Self {
        Self::new(move |update| sender.update(update.clone()))
    }

    /// Set the expected unit count. Never drops below what is already processed.
    pub fn set_total(&mut self, total: usize) {
        self.total = total.max(self.processed);
    }

    /// Change the label without completing a unit
    pub fn set_operation(&mut self, label: impl Into<String>) {
        self.operation = label.into();
    }

    /// One unit of work done
    pub fn advance(&mut self, label: impl Into<String>) {
        self.advance_by(1, label);
    }

    /// `n` units of work done
    pub fn advance_by(&mut self, n: usize, label: impl Into<String>) {
        self.processed = (self.processed + n).min(self.total);
        self.operation = label.into();
        self.emit();
    }

    /// Accumulate a non-fatal error
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", message);
        self.errors.push(message);
    }

    /// Emit the final update with `processed == total`
    pub fn finish(&mut self, label: impl Into<String>) {
        self.processed = self.total;
        self.operation = label.into();
        self.emit();
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Hand over the accumulated errors when the operation ends
    pub fn take_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }

    fn emit(&mut self) {
        let update = ProgressUpdate {
            processed: self.processed,
            total: self.total,
            operation: self.operation.clone(),
            error_count: self.errors.len(),
        };
        (self.subscriber)(&update);
    }
}

/// Event delivered to the consumer
#[derive(Debug)]
pub enum ProgressEvent<T> {
    Update(ProgressUpdate),
    Finished(BackupResult<T>),
}

/// Producer half
pub struct ProgressSender<T> {
    tx: Sender<ProgressEvent<T>>,
}

impl<T> Clone for ProgressSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> ProgressSender<T> {
    pub fn update(&self, update: ProgressUpdate) {
        // A consumer that went away is not an error for the producer
        let _ = self.tx.send(ProgressEvent::Update(update));
    }

    pub fn finish(self, result: BackupResult<T>) {
        let _ = self.tx.send(ProgressEvent::Finished(result));
    }
}

/// Consumer half
pub struct ProgressStream<T> {
    rx: Receiver<ProgressEvent<T>>,
    done: bool,
}

/// Create an unbounded progress channel
pub fn channel<T>() -> (ProgressSender<T>, ProgressStream<T>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ProgressSender { tx }, ProgressStream { rx, done: false })
}

impl<T> ProgressStream<T> {
    /// Block for the next event; `None` once the terminal event was delivered
    pub fn recv(&mut self) -> Option<ProgressEvent<T>> {
        if self.done {
            return None;
        }
        match self.rx.recv() {
            Ok(event) => {
                if matches!(event, ProgressEvent::Finished(_)) {
                    self.done = true;
                }
                Some(event)
            }
            Err(_) => {
                self.done = true;
                Some(ProgressEvent::Finished(Err(BackupError::WorkerLost)))
            }
        }
    }

    /// Drain updates and return the final result
    pub fn wait(self) -> BackupResult<T> {
        self.wait_with(|_| {})
    }

    /// Callback-style subscription: `on_update` sees every update in order
    pub fn wait_with<F: FnMut(&ProgressUpdate)>(mut self, mut on_update: F) -> BackupResult<T> {
        while let Some(event) = self.recv() {
            match event {
                ProgressEvent::Update(update) => on_update(&update),
                ProgressEvent::Finished(result) => return result,
            }
        }
        Err(BackupError::WorkerLost)
    }
}

impl<T> Iterator for ProgressStream<T> {
    type Item = ProgressEvent<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

/// A running operation: its progress stream plus a way to cancel it
pub struct OperationHandle<T> {
    stream: ProgressStream<T>,
    cancel: CancellationToken,
}

impl<T> OperationHandle<T> {
    pub fn new(stream: ProgressStream<T>, cancel: CancellationToken) -> Self {
        Self { stream, cancel }
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn recv(&mut self) -> Option<ProgressEvent<T>> {
        self.stream.recv()
    }

    pub fn wait(self) -> BackupResult<T> {
        self.stream.wait()
    }

    pub fn wait_with<F: FnMut(&ProgressUpdate)>(self, on_update: F) -> BackupResult<T> {
        self.stream.wait_with(on_update)
    }

    pub fn into_stream(self) -> ProgressStream<T> {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting() -> (ProgressRecord, Arc<Mutex<Vec<ProgressUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let record = ProgressRecord::new(move |u| sink.lock().unwrap().push(u.clone()));
        (record, seen)
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let (mut record, seen) = collecting();
        record.set_total(2);
        record.advance("one");
        record.advance_by(5, "too many");
        assert_eq!(record.processed(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|u| u.processed <= u.total));
    }

    #[test]
    fn test_finish_reaches_total() {
        let (mut record, seen) = collecting();
        record.set_total(3);
        record.advance("a");
        record.record_error("photo 9 unreadable");
        record.finish("done");

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.processed, 3);
        assert_eq!(last.total, 3);
        assert_eq!(last.error_count, 1);
        assert_eq!(record.errors(), ["photo 9 unreadable".to_string()]);
    }

    #[test]
    fn test_total_not_below_processed() {
        let mut record = ProgressRecord::silent();
        record.set_total(4);
        record.advance_by(3, "x");
        record.set_total(1);
        assert_eq!(record.total(), 3);
    }

    #[test]
    fn test_stream_delivers_in_order_then_result() {
        let (tx, stream) = channel::<u32>();
        let producer = std::thread::spawn(move || {
            let mut record = ProgressRecord::for_sender(tx.clone());
            record.set_total(10);
            for i in 0..10 {
                record.advance(format!("item {}", i));
            }
            tx.finish(Ok(42));
        });

        let mut processed = Vec::new();
        let result = stream.wait_with(|u| processed.push(u.processed));
        producer.join().unwrap();

        assert_eq!(result.unwrap(), 42);
        assert_eq!(processed, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_producer_is_worker_lost() {
        let (tx, stream) = channel::<()>();
        drop(tx);
        assert!(matches!(stream.wait(), Err(BackupError::WorkerLost)));
    }
}
