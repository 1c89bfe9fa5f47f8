//! Outbound publishing shared by write and tunnel

use crate::relay::report;
use crate::BackendError;
use async_trait::async_trait;
use relay_types::{ErrorRecord, WriteRecord};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Publishes one payload to a topic, subject or channel
#[async_trait]
pub trait Publisher: Send {
    /// Backends without header support ignore `headers`
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), BackendError>;
}

/// Publish each record in order
///
/// A failed record is reported on `errors` and does not stop the batch.
/// Cancellation is honored between records.
pub async fn write_all<P: Publisher + ?Sized>(
    ctx: &CancellationToken,
    backend: &'static str,
    destination: &str,
    publisher: &mut P,
    records: Vec<WriteRecord>,
    errors: &mpsc::Sender<ErrorRecord>,
) -> Result<(), BackendError> {
    let total = records.len();

    for (index, record) in records.into_iter().enumerate() {
        if ctx.is_cancelled() {
            debug!(backend, written = index, total, "Write cancelled");
            return Ok(());
        }

        if let Err(e) = publisher
            .publish(destination, &record.input, &record.headers)
            .await
        {
            error!(backend, destination, index, error = %e, "Unable to write message");
            report(
                backend,
                errors,
                ErrorRecord::new(format!("unable to write message: {e}"))
                    .with_metadata("destination", destination)
                    .with_metadata("index", index.to_string()),
            )
            .await;
        }
    }

    debug!(backend, destination, total, "Write complete");
    Ok(())
}
