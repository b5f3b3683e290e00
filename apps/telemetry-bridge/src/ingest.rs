mod ingestor;
mod rolling;


pub use ingestor::{IngestOutcome, MessageHandler, TopicKind};
pub use rolling::{DeviceActivity, DeviceRate};

use crate::pipeline::BridgeContext;
use crate::sink::PointSink;
use std::sync::Arc;
use std::time::Duration;

const LOG_SUFFIX: &str = "log";
const BRIDGE_SEGMENT: &str = "bridge";
const LOG_FIELD: &str = "message";

#[derive(Clone)]
pub struct TelemetryIngestor {
    context: Arc<BridgeContext>,
    sink: Option<Arc<dyn PointSink>>,
    topic_prefix: String,
    status_topic: String,
    log_write_timeout: Duration,
}
