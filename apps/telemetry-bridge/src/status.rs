use crate::ingest::DeviceRate;
use crate::mqtt::OutboundMessage;
use crate::pipeline::{BridgeContext, IngestStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Snapshot of bridge health, published on the status topic and served over
/// HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub messages: u64,
    pub errors: u64,
    pub buffered: usize,
    pub capacity: usize,
    pub evicted: u64,
    pub distinct_device_ids: usize,
    pub devices_in_buffer: usize,
    pub invalid_records: u64,
    pub points_written: u64,
    pub flush_failures: u64,
    pub log_lines_forwarded: u64,
    pub log_lines_failed: u64,
    pub sink_enabled: bool,
    pub mqtt_connected: bool,
    pub last_flush_unix_ms: Option<u64>,
    pub last_batch_len: u64,
    pub average_flush_micros: u64,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_rates: Option<Vec<DeviceRate>>,
}

impl StatusReport {
    pub fn collect(context: &BridgeContext, now: DateTime<Utc>) -> Self {
        let stats = &context.stats;
        let (distinct_device_ids, device_rates) = {
            let mut activity = context.activity();
            let rates = context
                .settings
                .publish_device_rates
                .then(|| activity.rates(now));
            (activity.distinct(), rates)
        };
        let last_flush = IngestStats::count(&stats.last_flush_unix_ms);

        Self {
            messages: IngestStats::count(&stats.messages_received),
            errors: IngestStats::count(&stats.malformed_messages),
            buffered: context.buffer.len(),
            capacity: context.buffer.capacity(),
            evicted: context.buffer.total_evicted(),
            distinct_device_ids,
            devices_in_buffer: context.buffer.distinct_device_count(),
            invalid_records: IngestStats::count(&stats.invalid_records),
            points_written: IngestStats::count(&stats.points_written),
            flush_failures: IngestStats::count(&stats.flush_failures),
            log_lines_forwarded: IngestStats::count(&stats.log_lines_forwarded),
            log_lines_failed: IngestStats::count(&stats.log_lines_failed),
            sink_enabled: stats.sink_enabled.load(Ordering::Relaxed),
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            last_flush_unix_ms: (last_flush > 0).then_some(last_flush),
            last_batch_len: IngestStats::count(&stats.last_batch_len),
            average_flush_micros: IngestStats::count(&stats.average_flush_micros),
            last_error: stats.last_error(),
            device_rates,
        }
    }
}

pub fn spawn_status_loop(
    context: Arc<BridgeContext>,
    topic: String,
    interval: Duration,
    outbound: mpsc::Sender<OutboundMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !publish_status(&context, &topic, &outbound) {
                        break;
                    }
                }
            }
        }
    })
}

/// Queues one status payload. Returns `false` once the transport side has
/// gone away.
fn publish_status(
    context: &BridgeContext,
    topic: &str,
    outbound: &mpsc::Sender<OutboundMessage>,
) -> bool {
    let report = StatusReport::collect(context, Utc::now());
    let payload = match serde_json::to_vec(&report) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error=%err, "failed to encode status payload");
            return true;
        }
    };

    match outbound.try_send(OutboundMessage {
        topic: topic.to_string(),
        payload,
    }) {
        Ok(()) => {
            tracing::debug!(
                buffered = report.buffered,
                devices = report.distinct_device_ids,
                "queued status payload"
            );
            true
        }
        Err(TrySendError::Full(_)) => {
            tracing::debug!("status queue full; skipping this interval");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSettings;
    use crate::telemetry::parse_payload;

    fn context(publish_device_rates: bool) -> Arc<BridgeContext> {
        let settings = PipelineSettings {
            publish_device_rates,
            ..PipelineSettings::default()
        };
        Arc::new(BridgeContext::new(5, settings))
    }

    fn ingest(context: &BridgeContext, raw: &str, at: DateTime<Utc>) {
        let record = parse_payload(raw.as_bytes()).unwrap();
        if let Some(id) = crate::telemetry::device_id(&record) {
            context.activity().record(id, at);
        }
        context.buffer.append(record);
    }

    #[test]
    fn report_serializes_expected_keys() {
        let context = context(true);
        let now = Utc::now();
        ingest(&context, r#"{"id": 1}"#, now - chrono::Duration::seconds(60));
        ingest(&context, r#"{"id": 1}"#, now);
        context.stats.set_sink_enabled(true);

        let report = StatusReport::collect(&context, now);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["buffered"], 2);
        assert_eq!(json["capacity"], 5);
        assert_eq!(json["distinct_device_ids"], 1);
        assert_eq!(json["sink_enabled"], true);
        assert_eq!(json["mqtt_connected"], false);
        assert!(json["last_flush_unix_ms"].is_null());
        assert_eq!(json["device_rates"][0]["id"], 1);
        assert_eq!(json["device_rates"][0]["avg_posts_per_min"], 1.0);
    }

    #[test]
    fn quiet_devices_stay_in_device_rates() {
        let context = context(true);
        let now = Utc::now();
        ingest(&context, r#"{"id": 4}"#, now - chrono::Duration::minutes(30));
        ingest(&context, r#"{"id": 8}"#, now);

        let report = StatusReport::collect(&context, now);
        let rates = report.device_rates.expect("rates enabled");
        assert_eq!(rates.len(), report.distinct_device_ids);
        assert_eq!(rates[0].id, 4);
        assert_eq!(rates[0].avg_posts_per_min, 0.0);
    }

    #[test]
    fn device_rates_can_be_disabled() {
        let context = context(false);
        ingest(&context, r#"{"id": 1}"#, Utc::now());
        let json = serde_json::to_value(StatusReport::collect(&context, Utc::now())).unwrap();
        assert!(json.get("device_rates").is_none());
        assert_eq!(json["distinct_device_ids"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_loop_publishes_on_interval() {
        let context = context(false);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = spawn_status_loop(
            context.clone(),
            "bridge/status".to_string(),
            Duration::from_secs(10),
            tx,
            cancel.clone(),
        );

        let message = rx.recv().await.expect("status message");
        assert_eq!(message.topic, "bridge/status");
        let json: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(json["buffered"], 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn status_loop_stops_when_transport_closes() {
        let context = context(false);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = spawn_status_loop(
            context,
            "bridge/status".to_string(),
            Duration::from_millis(10),
            tx,
            CancellationToken::new(),
        );
        handle.await.unwrap();
    }
}
