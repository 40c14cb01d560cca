//! Batched upserts that shrink on oversized-payload rejections.
//!
//! A batch the service rejects as too large is split in half and both halves
//! retried, down to single items. A single item that is still too large is
//! skipped and logged. Any other failure aborts the upsert.

use async_trait::async_trait;
use std::collections::VecDeque;

use crate::api::middleware::AppError;

#[derive(Debug)]
pub enum UpsertFailure {
    Oversized(String),
    Failed(AppError),
}

/// Destination that accepts one batch at a time
#[async_trait]
pub trait BatchSink<T: Sync>: Send + Sync {
    async fn send_batch(&self, batch: &[T]) -> Result<(), UpsertFailure>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub upserted: usize,
    pub skipped: usize,
}

pub async fn upsert_with_halving<T, S>(
    sink: &S,
    items: &[T],
    batch_size: usize,
) -> Result<UpsertReport, AppError>
where
    T: Sync,
    S: BatchSink<T> + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut report = UpsertReport::default();

    // Pending (start, len) ranges, processed front to back in item order
    let mut pending: VecDeque<(usize, usize)> = (0..items.len())
        .step_by(batch_size)
        .map(|start| (start, batch_size.min(items.len() - start)))
        .collect();

    while let Some((start, len)) = pending.pop_front() {
        match sink.send_batch(&items[start..start + len]).await {
            Ok(()) => {
                report.upserted += len;
                tracing::debug!("Upserted {}/{} vectors", report.upserted, items.len());
            }
            Err(UpsertFailure::Oversized(msg)) if len > 1 => {
                let half = len / 2;
                tracing::warn!(
                    "Batch of {} rejected as oversized, retrying as {} + {}: {}",
                    len,
                    half,
                    len - half,
                    msg
                );
                pending.push_front((start + half, len - half));
                pending.push_front((start, half));
            }
            Err(UpsertFailure::Oversized(msg)) => {
                tracing::error!("Skipping item {} that exceeds the payload limit: {}", start, msg);
                report.skipped += 1;
            }
            Err(UpsertFailure::Failed(e)) => return Err(e),
        }
    }

    Ok(report)
}
