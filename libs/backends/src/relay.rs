//! Bridge from broker deliveries to the caller's result channel
//!
//! Broker clients hand over messages from their own tasks, possibly several
//! at once. [`Relay::deliver`] serializes those deliveries behind one async
//! mutex so that record numbers are contiguous from 1 and appear on the
//! results channel in increasing order. In single-shot mode the first emitted
//! record completes the read and later deliveries are ignored.

use crate::BackendError;
use relay_types::{unix_ts_utc, BackendRecord, ErrorRecord, ReadRecord};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do when a broker envelope cannot be serialized to JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializeFailure {
    /// Emit the record with `raw` unset
    Continue,
    /// Drop the message without consuming a record number
    Skip,
}

/// A broker-native message as handed over by the client library
pub trait Envelope: Serialize + Send + Sync {
    /// Payload bytes exactly as received
    fn payload(&self) -> &[u8];

    /// Protocol specific part of the canonical record
    fn to_record(&self, received_at: i64) -> BackendRecord;
}

/// Outcome of a single [`Relay::deliver`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the results channel with this record number
    Emitted(i64),
    /// Dropped after a serialization failure
    Skipped,
    /// Arrived after a single-shot read had already completed
    Ignored,
    /// The caller dropped the results receiver
    Closed,
}

struct Inner {
    backend: &'static str,
    continuous: bool,
    on_serialize_error: SerializeFailure,
    /// Last emitted record number; held across build and send
    sequence: Mutex<i64>,
    results: mpsc::Sender<ReadRecord>,
    errors: mpsc::Sender<ErrorRecord>,
    done: CancellationToken,
}

/// Shared state of one read call
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    pub fn new(
        backend: &'static str,
        continuous: bool,
        on_serialize_error: SerializeFailure,
        results: mpsc::Sender<ReadRecord>,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                continuous,
                on_serialize_error,
                sequence: Mutex::new(0),
                results,
                errors,
                done: CancellationToken::new(),
            }),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.inner.backend
    }

    /// True once a single-shot read emitted its record or the caller went away
    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Normalize one envelope and hand it to the caller
    ///
    /// Blocks while the results channel is full.
    pub async fn deliver<E: Envelope>(&self, envelope: &E) -> Delivery {
        self.deliver_then(envelope, || async {}).await
    }

    /// Like [`Relay::deliver`], running `settle` once the message is handled
    ///
    /// `settle` completes before a single-shot read can observe completion, so
    /// broker acknowledgements are never cut off by the read returning.
    pub async fn deliver_then<E, F, Fut>(&self, envelope: &E, settle: F) -> Delivery
    where
        E: Envelope,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let inner = &*self.inner;
        let mut sequence = inner.sequence.lock().await;

        if inner.done.is_cancelled() {
            return Delivery::Ignored;
        }

        let raw = match serde_json::to_vec(envelope) {
            Ok(raw) => Some(raw),
            Err(e) => {
                self.report(ErrorRecord::new(format!(
                    "unable to serialize message into JSON: {e}"
                )))
                .await;
                match inner.on_serialize_error {
                    SerializeFailure::Skip => {
                        settle().await;
                        return Delivery::Skipped;
                    }
                    SerializeFailure::Continue => None,
                }
            }
        };

        *sequence += 1;
        let num = *sequence;
        let received_at = unix_ts_utc();
        let record = ReadRecord::new(
            num,
            received_at,
            envelope.payload().to_vec(),
            raw,
            envelope.to_record(received_at),
        );

        if inner.results.send(record).await.is_err() {
            warn!(backend = inner.backend, "Results receiver dropped, ending read");
            inner.done.cancel();
            return Delivery::Closed;
        }

        settle().await;
        if !inner.continuous {
            inner.done.cancel();
        }

        Delivery::Emitted(num)
    }

    /// Send a non-fatal failure to the caller's error channel
    pub async fn report(&self, record: ErrorRecord) {
        report(self.inner.backend, &self.inner.errors, record).await;
    }

    /// Drive `pump` until the read completes or `ctx` is cancelled
    ///
    /// `pump` feeds broker deliveries into [`Relay::deliver`] and only returns
    /// when the subscription fails or the caller stops listening.
    pub async fn run<F>(&self, ctx: &CancellationToken, pump: F) -> Result<(), BackendError>
    where
        F: Future<Output = Result<(), BackendError>>,
    {
        info!(backend = self.inner.backend, "Listening for messages...");

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(backend = self.inner.backend, "Read cancelled");
                Ok(())
            }
            _ = self.inner.done.cancelled() => {
                debug!(backend = self.inner.backend, "Read complete");
                Ok(())
            }
            result = pump => result,
        }
    }
}

/// Send an error record without failing when the receiver is gone
pub async fn report(
    backend: &'static str,
    errors: &mpsc::Sender<ErrorRecord>,
    record: ErrorRecord,
) {
    if errors.send(record).await.is_err() {
        debug!(backend, "Error receiver dropped, discarding error record");
    }
}
