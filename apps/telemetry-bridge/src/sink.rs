use crate::config::Config;
use crate::point::{encode_batch, Point};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Url};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink configuration error: {0}")]
    Config(String),
    #[error("sink rejected credentials ({status}): {message}")]
    Unauthorized { status: u16, message: String },
    #[error("sink rejected batch ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transient sink failure: {0}")]
    Transient(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }

    /// Maps a non-success HTTP status from the store to a failure class.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => SinkError::Unauthorized { status, message },
            408 | 429 | 500..=599 => SinkError::Transient(format!("HTTP {status}: {message}")),
            _ => SinkError::Rejected { status, message },
        }
    }
}

/// Batched writer for time-series points. Implementations must treat the
/// batch as a unit: either every point is accepted or an error is returned.
pub trait PointSink: Send + Sync {
    fn write_points<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// InfluxDB v2 line-protocol writer.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        org: &str,
        bucket: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SinkError::Config("no InfluxDB token configured".to_string()))?;
        let mut write_url = Url::parse(url.trim())
            .map_err(|err| SinkError::Config(format!("invalid InfluxDB url {url:?}: {err}")))?;
        // Append rather than join so a reverse-proxy path prefix is kept.
        write_url
            .path_segments_mut()
            .map_err(|_| SinkError::Config(format!("InfluxDB url {url:?} cannot be a base")))?
            .pop_if_empty()
            .extend(["api", "v2", "write"]);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SinkError::Config(err.to_string()))?;

        Ok(Self {
            client,
            write_url,
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, SinkError> {
        Self::new(
            &config.influx_url,
            &config.influx_org,
            &config.influx_bucket,
            config.influx_token.as_deref(),
            config.influx_timeout(),
        )
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    async fn write_batch(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.write_url.clone())
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(encode_batch(points))
            .send()
            .await
            .map_err(|err| SinkError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(SinkError::from_status(status.as_u16(), text))
    }
}

impl PointSink for InfluxSink {
    fn write_points<'a>(&'a self, points: &'a [Point]) -> BoxFuture<'a, Result<(), SinkError>> {
        self.write_batch(points).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::build_point;
    use crate::telemetry::Scalar;

    #[test]
    fn status_codes_map_to_failure_classes() {
        assert!(matches!(
            SinkError::from_status(401, String::new()),
            SinkError::Unauthorized { status: 401, .. }
        ));
        assert!(matches!(
            SinkError::from_status(403, String::new()),
            SinkError::Unauthorized { .. }
        ));
        assert!(SinkError::from_status(503, "busy".into()).is_transient());
        assert!(SinkError::from_status(429, String::new()).is_transient());
        assert!(SinkError::from_status(408, String::new()).is_transient());
        assert!(matches!(
            SinkError::from_status(400, "bad line".into()),
            SinkError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            SinkError::from_status(413, String::new()),
            SinkError::Rejected { .. }
        ));
    }

    #[test]
    fn missing_token_is_a_config_failure() {
        let err = InfluxSink::new(
            "http://influxdb:8086",
            "default",
            "rgbww",
            Some("  "),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn invalid_url_is_a_config_failure() {
        let err = InfluxSink::new("not a url", "o", "b", Some("t"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[test]
    fn write_url_targets_v2_write_endpoint() {
        let sink = InfluxSink::new(
            "http://influxdb:8086",
            "default",
            "rgbww",
            Some("token"),
            Duration::from_secs(1),
        )
        .expect("sink");
        assert_eq!(sink.write_url().as_str(), "http://influxdb:8086/api/v2/write");
    }

    #[test]
    fn write_url_keeps_proxy_path_prefix() {
        for base in ["http://proxy:8080/influx", "http://proxy:8080/influx/"] {
            let sink = InfluxSink::new(base, "o", "b", Some("t"), Duration::from_secs(1))
                .expect("sink");
            assert_eq!(
                sink.write_url().as_str(),
                "http://proxy:8080/influx/api/v2/write",
                "base {base}"
            );
        }
    }

    #[test]
    fn non_hierarchical_url_is_a_config_failure() {
        let err = InfluxSink::new("mailto:ops@example.com", "o", "b", Some("t"), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[tokio::test]
    async fn unreachable_store_is_transient() {
        let sink = InfluxSink::new(
            "http://127.0.0.1:9",
            "default",
            "rgbww",
            Some("token"),
            Duration::from_millis(500),
        )
        .expect("sink");
        let flat = [("id", 1), ("uptime", 30)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), Scalar::Int(v)))
            .collect();
        let point = build_point(&flat, "m", 0).expect("point");
        let err = sink.write_points(&[point]).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
