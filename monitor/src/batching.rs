use crate::ingest::IngestService;
use crate::metrics::BATCH_SIZE;
use crate::model::VehicleSample;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info};

/// Groups samples arriving from a push transport and hands them to the
/// ingestion service, flushing on size or after `max_wait_ms`.
pub async fn run_batcher(
    mut rx: mpsc::Receiver<VehicleSample>,
    service: Arc<IngestService>,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(
        "Starting batcher with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<VehicleSample> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms));

    loop {
        tokio::select! {
            sample = rx.recv() => {
                match sample {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= max_batch {
                            flush_batch(&service, &mut buffer).await;
                        }
                    }
                    None => {
                        info!("Channel closed, flushing remaining batch");
                        flush_batch(&service, &mut buffer).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(&service, &mut buffer).await;
                }
            }
        }
    }

    info!("Batcher stopped");
}

async fn flush_batch(service: &IngestService, buffer: &mut Vec<VehicleSample>) {
    if buffer.is_empty() {
        return;
    }

    let batch_len = buffer.len();
    BATCH_SIZE.set(batch_len as f64);
    let start = Instant::now();

    let summary = service.ingest(std::mem::take(buffer)).await;
    debug!(
        "Ingested batch of {} samples in {:.3}s ({} alerts raised)",
        batch_len,
        start.elapsed().as_secs_f64(),
        summary.raised
    );
    BATCH_SIZE.set(0.0);
}
