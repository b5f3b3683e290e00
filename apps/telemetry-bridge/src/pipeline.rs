use crate::buffer::BoundedBuffer;
use crate::flatten::{flatten, FlattenOptions};
use crate::ingest::DeviceActivity;
use crate::point::{build_point, Point};
use crate::sink::{PointSink, SinkError};
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub measurement: String,
    pub log_measurement: String,
    pub flatten: FlattenOptions,
    pub rate_window: Duration,
    pub publish_device_rates: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            measurement: "rgbww_metrics".to_string(),
            log_measurement: "rgbww_log".to_string(),
            flatten: FlattenOptions::default(),
            rate_window: Duration::from_secs(600),
            publish_device_rates: true,
        }
    }
}

/// State shared by every task of the bridge. Built once in `main` and handed
/// out behind an `Arc`.
pub struct BridgeContext {
    pub buffer: BoundedBuffer,
    pub stats: IngestStats,
    pub settings: PipelineSettings,
    activity: Mutex<DeviceActivity>,
}

impl BridgeContext {
    pub fn new(capacity: usize, settings: PipelineSettings) -> Self {
        let activity = DeviceActivity::new(settings.rate_window);
        Self {
            buffer: BoundedBuffer::new(capacity),
            stats: IngestStats::new(),
            settings,
            activity: Mutex::new(activity),
        }
    }

    pub fn activity(&self) -> MutexGuard<'_, DeviceActivity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub records_buffered: AtomicU64,
    pub invalid_records: AtomicU64,
    pub points_written: AtomicU64,
    pub flush_failures: AtomicU64,
    pub log_lines_forwarded: AtomicU64,
    pub log_lines_failed: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub sink_enabled: AtomicBool,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            records_buffered: AtomicU64::new(0),
            invalid_records: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            log_lines_forwarded: AtomicU64::new(0),
            log_lines_failed: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            sink_enabled: AtomicBool::new(false),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_sink_enabled(&self, enabled: bool) {
        self.sink_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub fn count(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Idle,
    /// Every drained record failed validation; nothing was sent.
    Discarded { invalid: usize },
    Written { points: usize, invalid: usize },
    /// The sink refused the batch and the drained records went back to the
    /// front of the buffer.
    Requeued {
        entries: usize,
        evicted: usize,
        error: SinkError,
    },
}

pub fn spawn_flush_loop(
    context: Arc<BridgeContext>,
    sink: Arc<dyn PointSink>,
    flush_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the first flush waits a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let FlushOutcome::Requeued { evicted, .. } = flush(&context, sink.as_ref()).await {
                        if evicted > 0 {
                            tracing::warn!(evicted, "requeue overflowed buffer capacity");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    match flush(&context, sink.as_ref()).await {
                        FlushOutcome::Requeued { entries, error, .. } => {
                            tracing::error!(entries, error=%error, "final flush failed; buffered records are lost");
                        }
                        FlushOutcome::Written { points, invalid } => {
                            tracing::info!(points, invalid, "final flush complete");
                        }
                        _ => {}
                    }
                    break;
                }
            }
        }
    })
}

/// Stops the transport and waits for it before cancelling the remaining
/// tasks, so the final flush sees every record the transport appended.
pub async fn shutdown(
    transport_cancel: &CancellationToken,
    transport: Option<JoinHandle<anyhow::Result<()>>>,
    cancel: &CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
) {
    transport_cancel.cancel();
    if let Some(handle) = transport {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error=%err, "transport exited with an error during shutdown"),
            Err(err) => tracing::warn!(error=%err, "transport task failed during shutdown"),
        }
    }

    cancel.cancel();
    for (name, handle) in tasks {
        if let Err(err) = handle.await {
            tracing::warn!(task = name, error=%err, "task failed during shutdown");
        }
    }
}

/// One flush cycle: drain, convert, write, and requeue the drained records
/// if the write fails.
pub async fn flush(context: &BridgeContext, sink: &dyn PointSink) -> FlushOutcome {
    let drained = context.buffer.drain_all();
    if drained.is_empty() {
        return FlushOutcome::Idle;
    }

    let started = Instant::now();
    let stats = &context.stats;
    let timestamp_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let points = build_points(context, &drained, timestamp_ns);
    let invalid = drained.len() - points.len();
    if invalid > 0 {
        stats
            .invalid_records
            .fetch_add(invalid as u64, Ordering::Relaxed);
        tracing::debug!(invalid, drained = drained.len(), "discarded invalid records");
    }
    if points.is_empty() {
        return FlushOutcome::Discarded { invalid };
    }

    match sink.write_points(&points).await {
        Ok(()) => {
            let len = points.len();
            stats.points_written.fetch_add(len as u64, Ordering::Relaxed);
            stats.last_batch_len.store(len as u64, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(len, micros, "flushed points batch");
            FlushOutcome::Written {
                points: len,
                invalid,
            }
        }
        Err(err) => {
            stats.flush_failures.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            let entries = drained.len();
            match &err {
                SinkError::Unauthorized { .. } | SinkError::Config(_) => {
                    tracing::error!(error=%err, entries, "sink refused batch; check credentials");
                }
                _ if err.is_transient() => {
                    tracing::warn!(error=%err, entries, "failed to flush points; requeued");
                }
                _ => {
                    tracing::warn!(error=%err, entries, "store rejected batch; requeued");
                }
            }
            let evicted = context.buffer.requeue_front(drained);
            FlushOutcome::Requeued {
                entries,
                evicted,
                error: err,
            }
        }
    }
}

fn build_points(
    context: &BridgeContext,
    records: &[crate::telemetry::Value],
    timestamp_ns: i64,
) -> Vec<Point> {
    let settings = &context.settings;
    records
        .iter()
        .filter_map(|record| {
            let flat = flatten(record, &settings.flatten);
            match build_point(&flat, &settings.measurement, timestamp_ns) {
                Ok(point) => Some(point),
                Err(reason) => {
                    tracing::debug!(%reason, "dropping record");
                    None
                }
            }
        })
        .collect()
}
