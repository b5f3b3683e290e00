use crate::pipeline::{BridgeContext, PipelineSettings};
use crate::point::Point;
use crate::sink::{PointSink, SinkError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory stand-in for the metrics store.
#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<Point>>>,
    failures: Mutex<VecDeque<SinkError>>,
    always_fail: Mutex<Option<fn() -> SinkError>>,
    delay: Option<Duration>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, err: SinkError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_always(&self, make: fn() -> SinkError) {
        *self.always_fail.lock().unwrap() = Some(make);
    }

    pub fn recover(&self) {
        *self.always_fail.lock().unwrap() = None;
    }

    pub fn batches(&self) -> Vec<Vec<Point>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn points(&self) -> Vec<Point> {
        self.batches().into_iter().flatten().collect()
    }
}

impl PointSink for RecordingSink {
    fn write_points<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), SinkError>> {
        async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            if let Some(make) = *self.always_fail.lock().unwrap() {
                return Err(make());
            }
            self.batches.lock().unwrap().push(points.to_vec());
            Ok(())
        }
        .boxed()
    }
}

pub fn context(capacity: usize) -> Arc<BridgeContext> {
    Arc::new(BridgeContext::new(capacity, PipelineSettings::default()))
}
