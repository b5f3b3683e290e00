use super::{TelemetryIngestor, BRIDGE_SEGMENT, LOG_FIELD, LOG_SUFFIX};
use crate::pipeline::{BridgeContext, IngestStats};
use crate::point::{is_valid_key, FieldValue, Point, DEVICE_TAG};
use crate::sink::PointSink;
use crate::telemetry::{device_id, parse_payload, split_records};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Receives every inbound transport message.
pub trait MessageHandler: Send + Sync {
    fn handle_message<'a>(&'a self, topic: &'a str, payload: &'a [u8])
        -> BoxFuture<'a, IngestOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Records appended to the buffer.
    Buffered(usize),
    LogForwarded,
    LogDropped,
    Ignored,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    Status,
    Log { device: String },
    Ignored,
}

impl TelemetryIngestor {
    pub fn new(
        context: Arc<BridgeContext>,
        sink: Option<Arc<dyn PointSink>>,
        topic_prefix: impl Into<String>,
        status_topic: impl Into<String>,
        log_write_timeout: Duration,
    ) -> Self {
        Self {
            context,
            sink,
            topic_prefix: topic_prefix.into(),
            status_topic: status_topic.into(),
            log_write_timeout,
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.context.stats
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.status_topic {
            return TopicKind::Ignored;
        }
        let Some(rest) = topic
            .strip_prefix(self.topic_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return TopicKind::Status;
        };
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [first, ..] if *first == BRIDGE_SEGMENT => TopicKind::Ignored,
            [device, suffix] if *suffix == LOG_SUFFIX && !device.is_empty() => TopicKind::Log {
                device: (*device).to_string(),
            },
            _ => TopicKind::Status,
        }
    }

    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let stats = self.stats();
        stats.messages_received.fetch_add(1, Ordering::Relaxed);

        match self.classify(topic) {
            TopicKind::Ignored => {
                tracing::trace!(topic, "ignoring bridge topic");
                IngestOutcome::Ignored
            }
            TopicKind::Log { device } => self.forward_log(&device, payload).await,
            TopicKind::Status => self.buffer_status(topic, payload),
        }
    }

    fn buffer_status(&self, topic: &str, payload: &[u8]) -> IngestOutcome {
        let report = match parse_payload(payload) {
            Ok(report) => report,
            Err(err) => {
                self.stats()
                    .malformed_messages
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic, error = %err, "dropping malformed payload");
                return IngestOutcome::Malformed;
            }
        };

        let records = split_records(report);
        let now = Utc::now();
        {
            let mut activity = self.context.activity();
            for id in records.iter().filter_map(device_id) {
                activity.record(id, now);
            }
        }

        let count = records.len();
        for record in records {
            self.context.buffer.append(record);
        }
        self.stats()
            .records_buffered
            .fetch_add(count as u64, Ordering::Relaxed);
        tracing::trace!(topic, count, "buffered status records");
        IngestOutcome::Buffered(count)
    }

    async fn forward_log(&self, device: &str, payload: &[u8]) -> IngestOutcome {
        let stats = self.stats();
        let Some(sink) = self.sink.as_ref() else {
            stats.log_lines_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(device, "no sink configured; dropping log line");
            return IngestOutcome::LogDropped;
        };

        if !is_valid_key(device) {
            stats.log_lines_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(device = ?device, "dropping log line with unencodable device tag");
            return IngestOutcome::LogDropped;
        }

        let text = String::from_utf8_lossy(payload);
        let point = log_point(
            &self.context.settings.log_measurement,
            device,
            text.trim_end(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        );

        let points = [point];
        match tokio::time::timeout(self.log_write_timeout, sink.write_points(&points)).await {
            Ok(Ok(())) => {
                stats.log_lines_forwarded.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::LogForwarded
            }
            Ok(Err(err)) => {
                stats.log_lines_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(device, error = %err, "failed to forward log line");
                IngestOutcome::LogDropped
            }
            Err(_) => {
                stats.log_lines_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device,
                    timeout_ms = self.log_write_timeout.as_millis() as u64,
                    "log line write timed out"
                );
                IngestOutcome::LogDropped
            }
        }
    }
}

impl MessageHandler for TelemetryIngestor {
    fn handle_message<'a>(
        &'a self,
        topic: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, IngestOutcome> {
        self.ingest(topic, payload).boxed()
    }
}

fn log_point(measurement: &str, device: &str, text: &str, timestamp_ns: i64) -> Point {
    let mut tags = BTreeMap::new();
    tags.insert(DEVICE_TAG.to_string(), device.to_string());
    let mut fields = BTreeMap::new();
    fields.insert(LOG_FIELD.to_string(), FieldValue::Str(text.to_string()));
    Point {
        measurement: measurement.to_string(),
        tags,
        fields,
        timestamp_ns,
    }
}
